// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Skill Handler contract and registry (§4.7, §9 "Dynamic dispatch on
//! skills": a registry keyed by `skill_id`, no inheritance required).

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::proto::envelope::Status;

/// Well-known response payload for a request whose `skill_id` has no
/// registered handler (§4.7 "Unknown skill_id yields a Failed response
/// with a well-known error code; the connection stays open.").
pub const UNKNOWN_SKILL_PAYLOAD: &[u8] = b"unknown_skill_id";

/// Outcome of dispatching one request to a [`SkillHandler`].
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub status: Status,
    pub response_bytes: Bytes,
}

impl SkillOutcome {
    pub fn ok(response_bytes: Bytes) -> Self {
        Self { status: Status::Ok, response_bytes }
    }

    pub fn error(response_bytes: Bytes) -> Self {
        Self { status: Status::Error, response_bytes }
    }
}

/// A registered skill implementation.
///
/// §4.7 requires handlers be "pure with respect to the runtime (no side
/// effects on runtime state)"; they may be synchronous or coroutine-based.
/// This trait models the synchronous half of that contract directly: the
/// runtime decides, per `worker_mode`, whether to call `handle` inline (the
/// `async` processor) or hand it to a dedicated OS thread via
/// `spawn_blocking` (the `blocking` processor, §4.7). Concrete skill
/// payload schemas are out of core scope (§1); implementers bring their
/// own handler and register it.
pub trait SkillHandler: Send + Sync + 'static {
    fn handle(&self, skill_id: u16, payload: &[u8]) -> SkillOutcome;
}

/// Closure-backed handler, convenient for tests and simple skills.
pub struct FnHandler<F>(F)
where F: Fn(u16, &[u8]) -> SkillOutcome + Send + Sync + 'static;

impl<F> FnHandler<F>
where F: Fn(u16, &[u8]) -> SkillOutcome + Send + Sync + 'static
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> SkillHandler for FnHandler<F>
where F: Fn(u16, &[u8]) -> SkillOutcome + Send + Sync + 'static
{
    fn handle(&self, skill_id: u16, payload: &[u8]) -> SkillOutcome {
        (self.0)(skill_id, payload)
    }
}

/// Map from `skill_id` to its handler, shared across processor coroutines
/// (§4.7, §9). Mirrors the `DashMap<id, record>` idiom the Task Pool and
/// Session Manager use for their own concurrent maps.
#[derive(Default)]
pub struct SkillRegistry {
    handlers: DashMap<u16, Arc<dyn SkillHandler>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self { handlers: DashMap::new() }
    }

    pub fn register(&self, skill_id: u16, handler: Arc<dyn SkillHandler>) {
        self.handlers.insert(skill_id, handler);
    }

    /// Dispatches a request; unregistered `skill_id`s yield a Failed
    /// outcome without closing the connection (§4.7).
    pub fn dispatch(&self, skill_id: u16, payload: &[u8]) -> SkillOutcome {
        match self.handlers.get(&skill_id) {
            Some(handler) => handler.handle(skill_id, payload),
            None => SkillOutcome::error(Bytes::from_static(UNKNOWN_SKILL_PAYLOAD)),
        }
    }
}
