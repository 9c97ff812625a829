// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Worker Runtime (§4.7): connects to the manager, processes tasks, and
//! returns responses, honoring pause/stop.

pub mod handler;
pub mod runtime;

pub use handler::{FnHandler, SkillHandler, SkillOutcome, SkillRegistry};
pub use runtime::{Runtime, RuntimeState, RuntimeStats};
