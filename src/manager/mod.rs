// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session Manager (§4.6): owns the Acceptor and the set of active
//! Sessions.
//!
//! A `DashMap` keyed by an assigned id, an `OnceCell`-backed self
//! reference so the accept loop can hand out clones of `Arc<Self>`, and a
//! `CancellationToken` hierarchy for quiesce-then-force shutdown.

use std::{net::SocketAddr, sync::Arc, sync::atomic::{AtomicU64, Ordering}};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::ManagerConfig,
    error::CoreError,
    net::Acceptor,
    pool::pool::{PoolStats, TaskPool},
    session::{Session, SessionConfig},
};

/// Lifetime counters for one worker connection (§3 "Worker Record").
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub sent: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetricsSnapshot {
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
}

impl WorkerMetrics {
    fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// §3 "Worker Record": one entry per accepted connection, destroyed on
/// disconnect after its session releases every held task.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: u64,
    pub remote_address: SocketAddr,
    pub connected_at: Instant,
    pub metrics: Arc<WorkerMetrics>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerSnapshot {
    pub worker_id: u64,
    pub remote_address: SocketAddr,
    pub metrics: WorkerMetricsSnapshot,
}

/// §4.6/§11.2: how many sessions drained within `shutdown_timeout` versus
/// how many had to be force-aborted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseAccounting {
    pub graceful: usize,
    pub forced: usize,
}

pub struct SessionManager {
    cfg: ManagerConfig,
    pool: Arc<TaskPool>,
    cancel: CancellationToken,
    next_worker_id: AtomicU64,
    workers: DashMap<u64, WorkerRecord>,
    acceptor: OnceCell<Acceptor>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: OnceCell<std::sync::Weak<SessionManager>>,
}

impl SessionManager {
    pub fn new(pool: Arc<TaskPool>, cfg: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            cfg,
            pool,
            cancel: CancellationToken::new(),
            next_worker_id: AtomicU64::new(1),
            workers: DashMap::new(),
            acceptor: OnceCell::new(),
            accept_task: Mutex::new(None),
            session_tasks: Mutex::new(Vec::new()),
            self_ref: OnceCell::new(),
        });
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    /// Binds, listens, and spawns the accept coroutine (§4.6 `start`).
    pub async fn start(&self) -> Result<(), CoreError> {
        let acceptor = Acceptor::listen(&self.cfg.listen_endpoint).await?;
        info!(endpoint = %self.cfg.listen_endpoint, "session manager listening");
        self.acceptor.set(acceptor).map_err(|_| CoreError::Internal("start() called twice".to_string()))?;

        let Some(manager) = self.self_ref.get().and_then(|w| w.upgrade()) else {
            return Err(CoreError::Internal("session manager self-reference not attached".to_string()));
        };
        let handle = tokio::spawn(async move { manager.accept_loop().await });
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>) {
        let acceptor = self.acceptor.get().expect("start() sets acceptor before spawning accept_loop");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = acceptor.accept() => {
                    match res {
                        Ok((stream, addr)) => self.spawn_session(stream, addr).await,
                        Err(err) => warn!(%err, "accept failed"),
                    }
                },
            }
        }
    }

    async fn spawn_session(self: &Arc<Self>, stream: crate::net::Stream, addr: SocketAddr) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let metrics = Arc::new(WorkerMetrics::default());
        self.workers.insert(
            worker_id,
            WorkerRecord { worker_id, remote_address: addr, connected_at: Instant::now(), metrics: metrics.clone() },
        );
        info!(worker_id, %addr, "worker connected");

        let pool = self.pool.clone();
        let session_cfg = SessionConfig {
            max_in_flight: self.cfg.max_in_flight,
            max_frame_size: self.cfg.max_frame_size,
            io_timeout: self.cfg.response_timeout,
            drain_timeout: self.cfg.drain_timeout,
        };
        let cancel = self.cancel.child_token();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            if let Err(err) = Session::run(stream, worker_id, pool, session_cfg, metrics, cancel).await {
                warn!(worker_id, %err, "session ended with an error");
            }
            manager.workers.remove(&worker_id);
            info!(worker_id, "worker disconnected");
        });
        self.session_tasks.lock().await.push(handle);
    }

    /// Closes the Acceptor, cancels every Session, and waits up to
    /// `shutdown_timeout`; unresponsive sessions are force-aborted
    /// (§4.6 `stop`, §11.2).
    pub async fn stop(&self) -> CloseAccounting {
        self.cancel.cancel();

        if let Some(handle) = self.accept_task.lock().await.take() {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.session_tasks.lock().await);
        let total = handles.len();
        let deadline = Instant::now() + self.cfg.shutdown_timeout;
        let mut graceful = 0usize;

        for handle in handles {
            let abort_handle = handle.abort_handle();
            let now = Instant::now();
            if now >= deadline {
                abort_handle.abort();
                continue;
            }
            match timeout(deadline - now, handle).await {
                Ok(_) => graceful += 1,
                Err(_) => abort_handle.abort(),
            }
        }

        CloseAccounting { graceful, forced: total - graceful }
    }

    /// The bound local address, useful when `listen_endpoint` used an
    /// ephemeral port (`:0`), e.g. in tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.get().and_then(|a| a.local_addr().ok())
    }

    /// Forwards to the Task Pool (§4.6 `get_task_pool_stats`).
    pub fn get_task_pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Snapshot of Worker Records (§4.6 `snapshot_workers`).
    pub fn snapshot_workers(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .map(|e| WorkerSnapshot { worker_id: e.worker_id, remote_address: e.remote_address, metrics: e.metrics.snapshot() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{cfg::config::PoolConfig, pool::task::Task};

    fn manager_cfg(listen_endpoint: &str) -> ManagerConfig {
        ManagerConfig {
            listen_endpoint: listen_endpoint.to_string(),
            io_threads: 1,
            max_in_flight: 4,
            pool: PoolConfig { hard_capacity: 8, low_watermark: 0, refill_batch: 1, max_release_retries: None },
            max_frame_size: 1 << 20,
            response_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(500),
            generator_timeout_ms: 100,
        }
    }

    #[tokio::test]
    async fn stop_without_connections_returns_immediately() {
        let cfg = manager_cfg("127.0.0.1:0");
        let pool = Arc::new(TaskPool::new(&cfg.pool, cfg.generator_timeout_ms));
        pool.attach_self();
        let manager = SessionManager::new(pool, cfg);
        manager.start().await.unwrap();

        let accounting = manager.stop().await;
        assert_eq!(accounting, CloseAccounting::default());
    }

    #[tokio::test]
    async fn snapshot_workers_reflects_accepted_connections() {
        let cfg = manager_cfg("127.0.0.1:0");
        let pool = Arc::new(TaskPool::new(&cfg.pool, cfg.generator_timeout_ms));
        pool.attach_self();
        pool.submit(Task::new(1, 1, Bytes::from_static(b"x"))).unwrap();
        let manager = SessionManager::new(pool, cfg.clone());
        manager.start().await.unwrap();
        let addr = manager.acceptor.get().unwrap().local_addr().unwrap();

        let worker_stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.snapshot_workers().len(), 1);
        drop(worker_stream);

        manager.stop().await;
    }
}
