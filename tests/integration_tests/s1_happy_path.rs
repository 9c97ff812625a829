// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end happy path: one worker drains a full batch of tasks through
//! a single manager/worker pair, no failures, no backpressure stalls.

use std::time::Duration;

use serial_test::serial;
use task_messenger::cfg::config::{PoolConfig, WorkerMode};

use crate::integration_tests::common::{
    REVERSE_SKILL, reverse_registry, spawn_worker, start_manager, submit_sequential_tasks, wait_until,
};

#[tokio::test]
#[serial]
async fn single_worker_drains_a_full_batch() {
    let pool_cfg = PoolConfig { hard_capacity: 8, low_watermark: 4, refill_batch: 8, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 2).await;

    submit_sequential_tasks(&pool, 8, REVERSE_SKILL);

    let (_runtime, _handle) = spawn_worker(addr, 2, WorkerMode::Async, reverse_registry());

    let stats = wait_until(&pool, Duration::from_secs(2), |s| s.total_completed == 8).await;
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.reserved, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.total_completed, 8);
    assert_eq!(stats.total_failed, 0);

    manager.stop().await;
}
