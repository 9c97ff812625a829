// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Task Generator (§4.8) and the default bounded-rotation implementation
//! (§11.3).

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;

use crate::pool::pool::TaskPool;

/// A function object registered with the Task Pool and invoked on
/// low-water refill (§4.8).
///
/// An associated-type future per step wouldn't be object-safe; since the
/// pool needs to hold this behind `Arc<dyn TaskGenerator>`, the hook
/// returns a boxed future directly instead.
pub trait TaskGenerator: Send + Sync {
    /// Invoked with the current shortfall (`low_watermark - ready`, always
    /// positive). Implementations should submit new tasks onto `pool` up
    /// to `refill_batch` before returning, or submit nothing to signal
    /// exhaustion.
    fn on_low_water<'a>(
        &'a self,
        pool: &'a TaskPool,
        shortfall: usize,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Default generator (§11.3): synthesizes tasks with a monotonically
/// increasing `task_id` and a round-robin rotation over a fixed list of
/// `skill_id`s, with placeholder ASCII payloads. Concrete skill payload
/// schemas are out of core scope; this generator exists so the pool has
/// something to refill from out of the box.
pub struct DefaultGenerator {
    skill_ids: Vec<u16>,
    next_task_id: AtomicU64,
    next_skill_index: AtomicU64,
}

impl DefaultGenerator {
    pub fn new(skill_ids: Vec<u16>, first_task_id: u64) -> Arc<Self> {
        Arc::new(Self {
            skill_ids,
            next_task_id: AtomicU64::new(first_task_id),
            next_skill_index: AtomicU64::new(0),
        })
    }

    fn next_skill_id(&self) -> u16 {
        if self.skill_ids.is_empty() {
            return 0;
        }
        let i = self.next_skill_index.fetch_add(1, Ordering::Relaxed) as usize;
        self.skill_ids[i % self.skill_ids.len()]
    }
}

impl TaskGenerator for DefaultGenerator {
    fn on_low_water<'a>(
        &'a self,
        pool: &'a TaskPool,
        shortfall: usize,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for _ in 0..shortfall {
                let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                let skill_id = self.next_skill_id();
                let payload = Bytes::from(format!("task-{task_id}"));
                let _ = pool.submit(crate::pool::task::Task::new(task_id, skill_id, payload));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_over_skill_ids() {
        let gen = DefaultGenerator::new(vec![1, 2, 3], 100);
        assert_eq!(gen.next_skill_id(), 1);
        assert_eq!(gen.next_skill_id(), 2);
        assert_eq!(gen.next_skill_id(), 3);
        assert_eq!(gen.next_skill_id(), 1);
    }
}
