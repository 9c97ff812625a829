// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `max_in_flight = 1` must bound the pool's in-flight count to exactly
//! one task at a time on a single worker, regardless of how many tasks are
//! queued, and every task must still complete.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serial_test::serial;
use task_messenger::{
    cfg::config::{PoolConfig, WorkerMode},
    worker::{FnHandler, SkillOutcome, SkillRegistry},
};

use crate::integration_tests::common::{REVERSE_SKILL, spawn_worker, start_manager, submit_sequential_tasks, wait_until};

fn per_task_delay_registry(delay: Duration) -> Arc<SkillRegistry> {
    let registry = Arc::new(SkillRegistry::new());
    registry.register(REVERSE_SKILL, FnHandler::new(move |_skill_id, payload| {
        std::thread::sleep(delay);
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        SkillOutcome::ok(Bytes::from(reversed))
    }));
    registry
}

#[tokio::test]
#[serial]
async fn max_in_flight_of_one_never_exceeds_one_in_flight_task() {
    let pool_cfg = PoolConfig { hard_capacity: 20, low_watermark: 0, refill_batch: 1, max_release_retries: None };
    let (manager, pool, addr) = start_manager(pool_cfg, 1).await;

    submit_sequential_tasks(&pool, 20, REVERSE_SKILL);

    let (_runtime, _handle) =
        spawn_worker(addr, 1, WorkerMode::Blocking, per_task_delay_registry(Duration::from_millis(50)));

    let mut max_observed_in_flight = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let stats = pool.stats();
        max_observed_in_flight = max_observed_in_flight.max(stats.in_flight);
        if stats.total_completed == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(max_observed_in_flight <= 1, "observed in_flight={max_observed_in_flight}, must never exceed max_in_flight");

    let stats = wait_until(&pool, Duration::from_secs(1), |s| s.total_completed == 20).await;
    assert_eq!(stats.total_completed, 20);
    assert_eq!(stats.total_failed, 0);

    manager.stop().await;
}
