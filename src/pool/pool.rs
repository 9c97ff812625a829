// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Task Pool (§4.4): the single source of truth for work pending dispatch.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::{
    cfg::config::PoolConfig,
    error::PoolError,
    generator::TaskGenerator,
    primitives::notify::OnceNotify,
    proto::envelope::Status,
    pool::task::{Task, TaskOutcome, TaskRecord, TaskState},
};

/// Snapshot returned by [`TaskPool::stats`] (§4.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub ready: usize,
    pub reserved: usize,
    pub in_flight: usize,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Payload synthesized for a task that exhausted `max_release_retries`
/// (§11.4).
pub const MAX_RELEASE_RETRIES_EXCEEDED_PAYLOAD: &[u8] = b"max_release_retries_exceeded";

pub struct TaskPool {
    tasks: DashMap<u64, TaskRecord>,
    ready: Mutex<VecDeque<u64>>,
    hard_capacity: usize,
    low_watermark: usize,
    refill_batch: usize,
    max_release_retries: Option<u32>,
    generator_timeout: Duration,

    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,

    /// Edge-triggered "ready work exists" signal for session writers.
    pub has_work: OnceNotify,

    generator: OnceCell<Arc<dyn TaskGenerator>>,
    /// At most one outstanding refill callback per low-water epoch.
    refill_in_flight: AtomicBool,
    self_weak: OnceCell<Weak<TaskPool>>,
}

impl TaskPool {
    pub fn new(cfg: &PoolConfig, generator_timeout_ms: u64) -> Self {
        Self {
            tasks: DashMap::with_capacity(cfg.hard_capacity),
            ready: Mutex::new(VecDeque::with_capacity(cfg.hard_capacity)),
            hard_capacity: cfg.hard_capacity,
            low_watermark: cfg.low_watermark,
            refill_batch: cfg.refill_batch,
            max_release_retries: cfg.max_release_retries,
            generator_timeout: Duration::from_millis(generator_timeout_ms),
            total_submitted: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            has_work: OnceNotify::new(),
            generator: OnceCell::new(),
            refill_in_flight: AtomicBool::new(false),
            self_weak: OnceCell::new(),
        }
    }

    /// Must be called once, right after wrapping the pool in an `Arc`, so
    /// refill callbacks can upgrade a weak self-reference.
    pub fn attach_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    /// Registers the generator invoked on low-water refill (§4.8).
    pub fn attach_generator(&self, generator: Arc<dyn TaskGenerator>) {
        let _ = self.generator.set(generator);
    }

    pub fn refill_batch(&self) -> usize {
        self.refill_batch
    }

    /// Adds a Ready task to the pool (§4.4 `submit`).
    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        if self.tasks.len() >= self.hard_capacity {
            return Err(PoolError::PoolFull);
        }
        let task_id = task.task_id;
        self.tasks.insert(task_id, TaskRecord { task, state: TaskState::Ready, release_count: 0 });
        {
            let mut ready = self.ready.lock().expect("pool ready-queue mutex poisoned");
            ready.push_back(task_id);
        }
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.has_work.notify();
        self.refresh_refill_epoch();
        Ok(())
    }

    /// Atomically moves up to `n` Ready tasks to Reserved (§4.4 `reserve`).
    /// Never fails; returns fewer (possibly zero) tasks on drain.
    pub fn reserve(&self, n: usize, worker_id: u64) -> Vec<Task> {
        let mut taken = Vec::with_capacity(n);
        {
            let mut ready = self.ready.lock().expect("pool ready-queue mutex poisoned");
            for _ in 0..n {
                let Some(task_id) = ready.pop_front() else { break };
                taken.push(task_id);
            }
        }

        let mut tasks = Vec::with_capacity(taken.len());
        for task_id in taken {
            if let Some(mut rec) = self.tasks.get_mut(&task_id) {
                rec.state = TaskState::Reserved { worker_id };
                tasks.push(rec.task.clone());
            }
        }

        self.maybe_trigger_refill();
        tasks
    }

    /// Reserved → InFlight (transition made explicit so `stats()` can
    /// distinguish the two per the documented snapshot shape; not a
    /// literal §4.4 operation, but required to represent it).
    pub fn mark_in_flight(&self, task_id: u64, worker_id: u64) -> Result<(), PoolError> {
        let mut rec = self.tasks.get_mut(&task_id).ok_or(PoolError::UnknownTask(task_id))?;
        match rec.state {
            TaskState::Reserved { worker_id: owner } if owner == worker_id => {
                rec.state = TaskState::InFlight { worker_id };
                Ok(())
            },
            TaskState::Reserved { .. } | TaskState::InFlight { .. } => {
                Err(PoolError::NotReserved(task_id))
            },
            _ => Err(PoolError::NotReserved(task_id)),
        }
    }

    /// Reserved/InFlight → Completed/Failed (§4.4 `commit`).
    pub fn commit(&self, task_id: u64, outcome: TaskOutcome) -> Result<(), PoolError> {
        let (_, rec) = self.tasks.remove(&task_id).ok_or(PoolError::UnknownTask(task_id))?;
        match rec.state {
            TaskState::Reserved { .. } | TaskState::InFlight { .. } => {},
            _ => {
                // Re-insert: commit must be a no-op state transition failure,
                // not a silent task loss.
                self.tasks.insert(task_id, rec);
                return Err(PoolError::NotReserved(task_id));
            },
        }

        match outcome.status {
            Status::Ok => {
                self.total_completed.fetch_add(1, Ordering::Relaxed);
            },
            Status::Error => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
            },
        }
        Ok(())
    }

    /// Reserved/InFlight → Ready, requeued at the head (§4.4 `release`).
    /// Used on session failure. Honors `max_release_retries` (§11.4).
    pub fn release(&self, task_id: u64, worker_id: u64) -> Result<(), PoolError> {
        let mut rec = self.tasks.get_mut(&task_id).ok_or(PoolError::UnknownTask(task_id))?;
        let owner = match rec.state {
            TaskState::Reserved { worker_id } | TaskState::InFlight { worker_id } => worker_id,
            _ => return Err(PoolError::UnknownTask(task_id)),
        };
        if owner != worker_id {
            return Err(PoolError::NotOwned { task_id, worker_id });
        }

        rec.release_count += 1;
        if let Some(max) = self.max_release_retries
            && rec.release_count > max
        {
            rec.state = TaskState::Failed;
            drop(rec);
            self.tasks.remove(&task_id);
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        rec.state = TaskState::Ready;
        drop(rec);

        {
            let mut ready = self.ready.lock().expect("pool ready-queue mutex poisoned");
            ready.push_front(task_id);
        }
        self.has_work.notify();
        self.refresh_refill_epoch();
        Ok(())
    }

    /// Snapshot of pool occupancy and lifetime counters (§4.4 `stats`).
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.tasks.iter() {
            match entry.state {
                TaskState::Ready => stats.ready += 1,
                TaskState::Reserved { .. } => stats.reserved += 1,
                TaskState::InFlight { .. } => stats.in_flight += 1,
                TaskState::Completed | TaskState::Failed => {},
            }
        }
        stats
    }

    fn ready_len(&self) -> usize {
        self.ready.lock().expect("pool ready-queue mutex poisoned").len()
    }

    /// Resets the refill epoch once `ready >= low_watermark` again, per
    /// §4.4 "Refill policy".
    fn refresh_refill_epoch(&self) {
        if self.ready_len() >= self.low_watermark {
            self.refill_in_flight.store(false, Ordering::Release);
        } else {
            self.maybe_trigger_refill();
        }
    }

    /// Fires `on_low_water` at most once per epoch, bounded by
    /// `generator_timeout_ms`.
    fn maybe_trigger_refill(&self) {
        let ready_len = self.ready_len();
        if ready_len >= self.low_watermark {
            return;
        }
        if self.refill_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(generator) = self.generator.get().cloned() else {
            return;
        };
        let Some(weak) = self.self_weak.get().cloned() else {
            return;
        };
        let shortfall = (self.low_watermark - ready_len).min(self.refill_batch);
        let timeout = self.generator_timeout;

        tokio::spawn(async move {
            let Some(pool) = weak.upgrade() else { return };
            let fut = generator.on_low_water(&pool, shortfall);
            if tokio::time::timeout(timeout, fut).await.is_err() {
                tracing::warn!("task generator exceeded generator_timeout_ms; refill incomplete");
            }
        });
    }
}

/// Builds the synthetic failure payload used when a task exceeds
/// `max_release_retries` (§11.4).
pub fn max_release_retries_exceeded() -> Bytes {
    Bytes::from_static(MAX_RELEASE_RETRIES_EXCEEDED_PAYLOAD)
}
