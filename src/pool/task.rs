// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Task record (§3, GLOSSARY "Task").

use std::time::Instant;

use bytes::Bytes;

use crate::proto::envelope::Status;

/// A unit of dispatchable work. `task_id` is stable for the task's full
/// lifetime.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: u64,
    pub skill_id: u16,
    pub payload_bytes: Bytes,
    pub created_at: Instant,
}

impl Task {
    pub fn new(task_id: u64, skill_id: u16, payload_bytes: Bytes) -> Self {
        Self { task_id, skill_id, payload_bytes, created_at: Instant::now() }
    }
}

/// Lifecycle state of a task while it is resident in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Reserved { worker_id: u64 },
    InFlight { worker_id: u64 },
    Completed,
    Failed,
}

/// Outcome reported by `commit` (§4.4).
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: Status,
    pub response_bytes: Bytes,
}

/// Internal bookkeeping record held by the pool: the task itself, its
/// current state, and the release-retry counter backing §11.4.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub task: Task,
    pub state: TaskState,
    pub release_count: u32,
}
