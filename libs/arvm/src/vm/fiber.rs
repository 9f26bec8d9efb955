// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers.
//!
//! A fiber is one logical thread of execution: a stack of frames, a panic
//! chain and the bookkeeping the scheduler and event loop need to park and
//! resume it. The hot state (frames, panics) lives behind a single mutex
//! that the running worker holds for the duration of a dispatch; wakers
//! only ever touch the atomic status, the async-result slot and the future.
//!
//! Status transitions are explicit; there is no preemption:
//!
//! - `Runnable`: sitting in a run queue.
//! - `Running`: owned by a worker, executing.
//! - `Suspended`: cooperatively yielded; the worker re-enqueues it.
//! - `Blocked`: parked on a channel, future, monitor or I/O event; whoever
//!   completes the wait respawns it.
//! - `BlockedSuspended`: as `Blocked`, and only the event loop may resume
//!   it.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::object::{ObjRef, Slot};
use crate::vm::frame::Frame;
use crate::vm::panicking::PanicRecord;

pub type FiberRef = Arc<Fiber>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberStatus {
    Runnable = 0,
    Running = 1,
    Suspended = 2,
    Blocked = 3,
    BlockedSuspended = 4,
}

impl FiberStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Blocked,
            4 => Self::BlockedSuspended,
            _ => Self::Runnable,
        }
    }
}

/// Result deposited by the event loop (or a channel peer) for a fiber that
/// suspended mid-instruction; installed on top of the stack when the fiber
/// is picked up again.
#[derive(Debug, Default)]
pub enum AsyncResult {
    #[default]
    None,
    Value(ObjRef),
    /// The pending operation was cancelled or failed; the fiber resumes
    /// panicking with this error.
    Error(ObjRef),
}

pub struct Fiber {
    id: u64,
    status: AtomicU8,
    /// Id (+1) of the worker currently owning this fiber; 0 when parked.
    active_ost: AtomicU64,
    /// Worker id (+1) this fiber is pinned to; 0 when unpinned. Pinned
    /// fibers are not migrated off their worker.
    pinned_ost: AtomicU64,
    async_result: Mutex<AsyncResult>,
    /// Future publishing the terminal result, when one was requested.
    future: Mutex<Option<ObjRef>>,
    pub core: Mutex<FiberCore>,
}

#[derive(Default)]
pub struct FiberCore {
    pub frames: Vec<Frame>,
    /// The panic chain, oldest first. Append-only between traps.
    pub panics: Vec<PanicRecord>,
    /// Frame index a synchronous sub-evaluation must not unwind past.
    pub unwind_limit: Option<usize>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// === impl Fiber ===

impl Fiber {
    pub fn new() -> FiberRef {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            status: AtomicU8::new(FiberStatus::Runnable as u8),
            active_ost: AtomicU64::new(0),
            pinned_ost: AtomicU64::new(0),
            async_result: Mutex::new(AsyncResult::None),
            future: Mutex::new(None),
            core: Mutex::new(FiberCore::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: FiberStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// The worker currently owning this fiber, if any.
    pub fn active_ost(&self) -> Option<u64> {
        match self.active_ost.load(Ordering::Acquire) {
            0 => None,
            id => Some(id - 1),
        }
    }

    pub fn set_active_ost(&self, worker: u64) {
        self.active_ost.store(worker + 1, Ordering::Release);
    }

    pub fn clear_active_ost(&self) {
        self.active_ost.store(0, Ordering::Release);
    }

    /// Worker this fiber is pinned to, if any.
    pub fn pinned_ost(&self) -> Option<u64> {
        match self.pinned_ost.load(Ordering::Acquire) {
            0 => None,
            id => Some(id - 1),
        }
    }

    /// Pin this fiber to the worker it currently runs on, or release the
    /// pin.
    pub fn pin_to_ost(&self, pinned: bool) {
        if pinned {
            self.pinned_ost
                .store(self.active_ost.load(Ordering::Acquire), Ordering::Release);
        } else {
            self.pinned_ost.store(0, Ordering::Release);
        }
    }

    pub fn set_async_value(&self, value: ObjRef) {
        *self.async_result.lock().unwrap() = AsyncResult::Value(value);
    }

    pub fn set_async_error(&self, error: ObjRef) {
        *self.async_result.lock().unwrap() = AsyncResult::Error(error);
    }

    pub fn take_async_result(&self) -> AsyncResult {
        std::mem::take(&mut *self.async_result.lock().unwrap())
    }

    pub fn attach_future(&self, future: ObjRef) {
        *self.future.lock().unwrap() = Some(future);
    }

    pub fn future(&self) -> Option<ObjRef> {
        self.future.lock().unwrap().clone()
    }

    /// Reset a pooled fiber shell for reuse.
    pub fn reset(&self) {
        let mut core = self.core.lock().unwrap();
        core.frames.clear();
        core.panics.clear();
        core.unwind_limit = None;
        drop(core);

        *self.future.lock().unwrap() = None;
        *self.async_result.lock().unwrap() = AsyncResult::None;
        self.pinned_ost.store(0, Ordering::Release);
        self.set_status(FiberStatus::Runnable);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// === impl FiberCore ===

impl FiberCore {
    pub fn top(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn panicking(&self) -> bool {
        !self.panics.is_empty()
    }

    /// Raise `object` as a panic, snapshotting the current frame stack for
    /// the traceback.
    pub fn raise(&mut self, object: ObjRef) {
        let record = PanicRecord::capture(object, &self.frames);
        tracing::debug!(fiber.panics = self.panics.len() + 1, "panic raised");
        self.panics.push(record);
    }

    /// Detach the panic-chain suffix above `baseline`, returning the newest
    /// error object. Used by `TRAP`.
    pub fn trap_above(&mut self, baseline: usize) -> Option<ObjRef> {
        if self.panics.len() <= baseline {
            return None;
        }

        let mut detached: Vec<PanicRecord> = self.panics.drain(baseline..).collect();
        for record in &mut detached {
            record.aborted = true;
        }
        detached.pop().map(|r| r.object)
    }

    /// Drop the newest panic record, keeping the rest of the chain.
    pub fn discard_last_panic(&mut self) -> Option<ObjRef> {
        self.panics.pop().map(|r| r.object)
    }

    /// The error carried by the newest record.
    pub fn last_error(&self) -> Option<ObjRef> {
        self.panics.last().map(|r| r.object.clone())
    }

    pub fn install_slot(&mut self, slot: Slot) {
        if let Some(frame) = self.frames.last_mut() {
            frame.replace_top(slot);
        }
    }
}
