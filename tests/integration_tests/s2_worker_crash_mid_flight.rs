// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A worker disappears mid-flight (hard-aborted, no graceful close); the
//! manager must release its reserved/in-flight tasks back to the pool so a
//! second worker can finish the batch with no duplicates and no loss.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serial_test::serial;
use task_messenger::{
    cfg::config::{PoolConfig, WorkerMode},
    worker::{FnHandler, SkillOutcome, SkillRegistry},
};

use crate::integration_tests::common::{REVERSE_SKILL, spawn_worker, start_manager, submit_sequential_tasks, wait_until};

fn slow_registry() -> Arc<SkillRegistry> {
    let registry = Arc::new(SkillRegistry::new());
    registry.register(REVERSE_SKILL, FnHandler::new(|_skill_id, payload| {
        std::thread::sleep(Duration::from_millis(30));
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        SkillOutcome::ok(Bytes::from(reversed))
    }));
    registry
}

fn fast_registry() -> Arc<SkillRegistry> {
    let registry = Arc::new(SkillRegistry::new());
    registry.register(REVERSE_SKILL, FnHandler::new(|_skill_id, payload| {
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        SkillOutcome::ok(Bytes::from(reversed))
    }));
    registry
}

#[tokio::test]
#[serial]
async fn crashed_worker_releases_in_flight_tasks_for_a_second_worker() {
    let pool_cfg = PoolConfig { hard_capacity: 200, low_watermark: 0, refill_batch: 1, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 2).await;

    submit_sequential_tasks(&pool, 100, REVERSE_SKILL);

    // Worker 1 runs the slow, blocking handler so it reliably has work
    // reserved/in-flight by the time we crash it.
    let (runtime1, handle1) = spawn_worker(addr, 2, WorkerMode::Blocking, slow_registry());

    wait_until(&pool, Duration::from_secs(2), |s| s.reserved + s.in_flight > 0).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Simulate a crash: abort the runtime's task outright, dropping the
    // socket without any close handshake or drain.
    handle1.abort();
    let _ = handle1.await;
    drop(runtime1);

    // The manager's session must notice the broken connection and release
    // whatever worker 1 still held.
    wait_until(&pool, Duration::from_secs(2), |s| s.reserved == 0 && s.in_flight == 0).await;

    let (_runtime2, _handle2) = spawn_worker(addr, 4, WorkerMode::Async, fast_registry());
    let stats = wait_until(&pool, Duration::from_secs(5), |s| s.total_completed + s.total_failed == 100).await;

    assert_eq!(stats.total_completed + stats.total_failed, 100, "every task must be accounted for exactly once");
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.reserved, 0);
    assert_eq!(stats.in_flight, 0);

    manager.stop().await;
}
