// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared primitive (§4.9): an edge-triggered, coalescing wakeup signal.
//!
//! Used for `has_work` (pool → session writer) and `notify_on_completion`
//! (session reader → writer): a fire that happens before anyone is
//! waiting must still wake the next `wait()` call exactly once, and
//! concurrent fires must coalesce rather than queue.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct OnceNotify {
    signaled: AtomicBool,
    notify: Notify,
}

impl OnceNotify {
    pub fn new() -> Self {
        Self { signaled: AtomicBool::new(false), notify: Notify::new() }
    }

    /// Records that the event occurred and wakes one waiter, whether or
    /// not anyone is currently waiting.
    pub fn notify(&self) {
        self.signaled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Waits until `notify()` has fired since the last `wait()` returned.
    /// If it already fired, returns immediately.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, or a notify() between the
            // check and the await would be lost.
            let notified = self.notify.notified();
            if self.signaled.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
            if self.signaled.swap(false, Ordering::AcqRel) {
                return;
            }
        }
    }
}
