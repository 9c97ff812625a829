// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A shutdown mid-load must drain every session within `shutdown_timeout`
//! and leave every task either Completed or back in the pool as Ready —
//! nothing stuck Reserved or InFlight once `stop()` returns.

use std::time::Duration;

use serial_test::serial;
use task_messenger::cfg::config::{PoolConfig, WorkerMode};

use crate::integration_tests::common::{REVERSE_SKILL, reverse_registry, spawn_worker, start_manager, submit_sequential_tasks};

#[tokio::test]
#[serial]
async fn shutdown_during_load_leaves_every_task_completed_or_ready() {
    let pool_cfg = PoolConfig { hard_capacity: 1000, low_watermark: 0, refill_batch: 1, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 4).await;

    submit_sequential_tasks(&pool, 1000, REVERSE_SKILL);

    let mut workers = Vec::new();
    for _ in 0..4 {
        workers.push(spawn_worker(addr, 4, WorkerMode::Async, reverse_registry()));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let accounting = manager.stop().await;
    assert_eq!(accounting.forced, 0, "every session should have drained gracefully within shutdown_timeout");

    let stats = pool.stats();
    assert_eq!(stats.reserved, 0, "nothing may remain Reserved after stop() returns");
    assert_eq!(stats.in_flight, 0, "nothing may remain InFlight after stop() returns");
    assert_eq!(
        stats.ready as u64 + stats.total_completed + stats.total_failed,
        1000,
        "every submitted task must be either completed or ready, with none lost"
    );

    for (runtime, handle) in workers {
        runtime.stop();
        let _ = handle.await;
    }
}
