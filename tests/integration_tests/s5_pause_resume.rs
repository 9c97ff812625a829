// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pausing a worker's runtime gates new work intake without affecting
//! tasks already queued on the manager side; resuming drains them all.

use std::time::Duration;

use serial_test::serial;
use task_messenger::cfg::config::{PoolConfig, WorkerMode};

use crate::integration_tests::common::{REVERSE_SKILL, reverse_registry, spawn_worker, start_manager, submit_sequential_tasks, wait_until};

#[tokio::test]
#[serial]
async fn paused_worker_produces_no_completions_until_resumed() {
    let pool_cfg = PoolConfig { hard_capacity: 10, low_watermark: 0, refill_batch: 1, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 4).await;

    submit_sequential_tasks(&pool, 10, REVERSE_SKILL);

    let (runtime, _handle) = spawn_worker(addr, 4, WorkerMode::Async, reverse_registry());
    runtime.pause();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.stats().total_completed, 0, "a paused worker must not produce any responses");

    runtime.resume();
    let stats = wait_until(&pool, Duration::from_secs(2), |s| s.total_completed == 10).await;
    assert_eq!(stats.total_completed, 10, "resuming must flow every queued task through");

    manager.stop().await;
}
