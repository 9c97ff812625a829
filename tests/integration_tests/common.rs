// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use task_messenger::{
    cfg::config::{ManagerConfig, PoolConfig, WorkerConfig, WorkerMode},
    generator::DefaultGenerator,
    manager::SessionManager,
    pool::pool::TaskPool,
    worker::{FnHandler, Runtime, SkillOutcome, SkillRegistry},
};

/// Skill used by every scenario test: reverses the payload bytes, the same
/// toy skill §8 S1 exercises ("skill 1 reverses the string").
pub const REVERSE_SKILL: u16 = 1;

pub fn reverse_registry() -> Arc<SkillRegistry> {
    let registry = Arc::new(SkillRegistry::new());
    registry.register(REVERSE_SKILL, FnHandler::new(|_skill_id, payload| {
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        SkillOutcome::ok(Bytes::from(reversed))
    }));
    registry
}

pub fn manager_config(pool: PoolConfig, max_in_flight: u32) -> ManagerConfig {
    ManagerConfig {
        listen_endpoint: "127.0.0.1:0".to_string(),
        io_threads: 1,
        max_in_flight,
        pool,
        max_frame_size: 1 << 20,
        response_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(2),
        generator_timeout_ms: 200,
    }
}

pub fn worker_config(connect_endpoint: SocketAddr, max_in_flight: u32, worker_mode: WorkerMode) -> WorkerConfig {
    WorkerConfig {
        connect_endpoint: connect_endpoint.to_string(),
        io_threads: 1,
        worker_mode,
        max_frame_size: 1 << 20,
        backoff_base_ms: 20,
        backoff_cap_ms: 200,
        stop_timeout: Duration::from_millis(500),
        max_in_flight,
    }
}

/// Starts a manager bound to an ephemeral port, already listening.
pub async fn start_manager(pool_cfg: PoolConfig, max_in_flight: u32) -> (Arc<SessionManager>, Arc<TaskPool>, SocketAddr) {
    let pool = Arc::new(TaskPool::new(&pool_cfg, 200));
    pool.attach_self();
    let manager = SessionManager::new(pool.clone(), manager_config(pool_cfg, max_in_flight));
    manager.start().await.expect("manager starts");
    let addr = manager.local_addr().expect("listening socket is bound");
    (manager, pool, addr)
}

/// Spawns a worker `Runtime` connecting to `addr`, running in the
/// background. Returns the runtime handle and its task `JoinHandle`.
pub fn spawn_worker(
    addr: SocketAddr,
    max_in_flight: u32,
    worker_mode: WorkerMode,
    registry: Arc<SkillRegistry>,
) -> (Arc<Runtime>, tokio::task::JoinHandle<()>) {
    let runtime = Runtime::new(worker_config(addr, max_in_flight, worker_mode), registry);
    let handle = tokio::spawn(runtime.clone().run());
    (runtime, handle)
}

pub fn submit_sequential_tasks(pool: &TaskPool, count: u64, skill_id: u16) {
    for task_id in 1..=count {
        let payload = Bytes::from(format!("payload-{task_id}"));
        pool.submit(task_messenger::pool::task::Task::new(task_id, skill_id, payload))
            .expect("pool has room");
    }
}

/// Polls `pool.stats()` until `pred` holds or `timeout` elapses, returning
/// the last observed snapshot either way.
pub async fn wait_until(
    pool: &TaskPool,
    timeout: Duration,
    mut pred: impl FnMut(&task_messenger::pool::pool::PoolStats) -> bool,
) -> task_messenger::pool::pool::PoolStats {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stats = pool.stats();
        if pred(&stats) || tokio::time::Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
