// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A task payload that exceeds the worker's configured `max_frame_size`
//! must be rejected by that worker's frame reader: the connection drops,
//! the task is released rather than completed, and the process keeps
//! running. A second, unrestricted worker can still pick the task up.

use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;
use task_messenger::{
    cfg::config::{PoolConfig, WorkerConfig, WorkerMode},
    pool::task::Task,
    worker::Runtime,
};

use crate::integration_tests::common::{REVERSE_SKILL, reverse_registry, start_manager, wait_until};

#[tokio::test]
#[serial]
async fn oversize_frame_is_rejected_without_crashing_the_worker() {
    let pool_cfg = PoolConfig { hard_capacity: 8, low_watermark: 0, refill_batch: 1, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 2).await;

    // Manager's own max_frame_size (set by start_manager) is 1 MiB; this
    // payload is bigger than the worker's restricted limit below but well
    // within the manager's, so the manager happily writes it out.
    let oversized_payload = Bytes::from(vec![b'x'; 2048]);
    pool.submit(Task::new(1, REVERSE_SKILL, oversized_payload)).unwrap();

    let restricted_cfg = WorkerConfig {
        connect_endpoint: addr.to_string(),
        io_threads: 1,
        worker_mode: WorkerMode::Async,
        max_frame_size: 1024,
        backoff_base_ms: 20,
        backoff_cap_ms: 200,
        stop_timeout: Duration::from_millis(500),
        max_in_flight: 2,
    };
    let restricted_worker = Runtime::new(restricted_cfg, reverse_registry());
    let restricted_handle = tokio::spawn(restricted_worker.clone().run());

    // The oversized frame must never complete on the restricted worker; it
    // comes back to the pool instead.
    wait_until(&pool, Duration::from_secs(2), |s| s.ready == 1 && s.total_completed == 0).await;
    let mid_stats = pool.stats();
    assert_eq!(mid_stats.total_completed, 0, "oversized task must not complete on the restricted worker");

    restricted_worker.stop();
    let _ = restricted_handle.await;

    let unrestricted_worker_cfg = WorkerConfig {
        connect_endpoint: addr.to_string(),
        io_threads: 1,
        worker_mode: WorkerMode::Async,
        max_frame_size: 1 << 20,
        backoff_base_ms: 20,
        backoff_cap_ms: 200,
        stop_timeout: Duration::from_millis(500),
        max_in_flight: 2,
    };
    let unrestricted_worker = Runtime::new(unrestricted_worker_cfg, reverse_registry());
    let unrestricted_handle = tokio::spawn(unrestricted_worker.clone().run());

    let stats = wait_until(&pool, Duration::from_secs(2), |s| s.total_completed == 1).await;
    assert_eq!(stats.total_completed, 1, "an unrestricted worker must still be able to complete the task");

    unrestricted_worker.stop();
    let _ = unrestricted_handle.await;
    manager.stop().await;
}
