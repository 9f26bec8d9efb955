// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monitors.
//!
//! A monitor is lazily attached to an object the first time a `sync` block
//! targets it. Acquisition is reentrant per fiber; contested acquisition
//! parks the fiber and the releasing fiber respawns the first waiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::vm::fiber::{FiberRef, FiberStatus};

#[derive(Debug, Default)]
pub struct Monitor {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    owner: Option<u64>,
    depth: usize,
    waiters: VecDeque<FiberRef>,
}

/// Outcome of an acquisition attempt.
pub enum Acquire {
    /// The calling fiber now holds the monitor.
    Acquired,
    /// The monitor is contested; the fiber was parked and will be respawned
    /// by the releasing fiber.
    Park,
}

// === impl Monitor ===

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, fiber: &FiberRef) -> Acquire {
        let mut inner = self.inner.lock().unwrap();

        match inner.owner {
            None => {
                inner.owner = Some(fiber.id());
                inner.depth = 1;
                Acquire::Acquired
            }
            Some(owner) if owner == fiber.id() => {
                // reentrant acquisition by the owning fiber
                inner.depth += 1;
                Acquire::Acquired
            }
            Some(_) => {
                fiber.set_status(FiberStatus::BlockedSuspended);
                inner.waiters.push_back(Arc::clone(fiber));
                Acquire::Park
            }
        }
    }

    /// Release one level of the monitor, handing back a waiter to respawn
    /// when the monitor became free.
    pub fn release(&self, fiber: &FiberRef) -> Option<FiberRef> {
        let mut inner = self.inner.lock().unwrap();

        debug_assert_eq!(
            inner.owner,
            Some(fiber.id()),
            "monitor released by a non-owning fiber"
        );

        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth > 0 {
            return None;
        }

        inner.owner = None;
        inner.waiters.pop_front()
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().unwrap().owner.is_some()
    }
}
