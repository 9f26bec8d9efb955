// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Channels.
//!
//! A channel is a bounded buffer with FIFO queues of parked readers and
//! writers. The handoff protocol mirrors the engine's two suspension
//! flavors:
//!
//! - a parked **reader** has already advanced past `POPC`; the writer that
//!   serves it deposits the value into the reader's async-result slot, so
//!   the reader resumes with the value on top of the stack;
//! - a parked **writer** has *not* advanced past `PSHC`; it is respawned
//!   without a result and retries the write.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, Payload};
use crate::vm::fiber::{FiberRef, FiberStatus};

pub static CHAN_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("chan");
    typ.repr = Some(|obj| {
        let Payload::Chan(chan) = obj.payload() else {
            unreachable!("chan repr on non-chan payload")
        };
        Ok(format!("<chan cap={}>", chan.capacity))
    });
    Arc::new(typ)
});

pub struct Chan {
    pub capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    buf: VecDeque<ObjRef>,
    readers: VecDeque<FiberRef>,
    writers: VecDeque<FiberRef>,
}

/// What the engine should do after a channel operation.
pub enum ChanOp {
    /// The operation completed; `value` is the read value (`None` for
    /// writes) and `wake` are fibers to respawn.
    Done {
        value: Option<ObjRef>,
        wake: Vec<FiberRef>,
    },
    /// The calling fiber was registered and marked suspended; hand control
    /// back to the scheduler.
    Park,
    /// As `Park`, but the fibers must be respawned first (an unbuffered
    /// writer waiting for this reader).
    ParkAndWake(Vec<FiberRef>),
}

// === impl Chan ===

impl Chan {
    /// Write `value`, preferring direct handoff to a parked reader.
    pub fn write(&self, value: &ObjRef, self_fiber: &FiberRef) -> ChanOp {
        let mut inner = self.inner.lock().unwrap();

        if let Some(reader) = inner.readers.pop_front() {
            reader.set_async_value(Arc::clone(value));
            return ChanOp::Done {
                value: None,
                wake: vec![reader],
            };
        }

        if inner.buf.len() < self.capacity {
            inner.buf.push_back(Arc::clone(value));
            return ChanOp::Done {
                value: None,
                wake: Vec::new(),
            };
        }

        self_fiber.set_status(FiberStatus::Blocked);
        inner.writers.push_back(Arc::clone(self_fiber));
        ChanOp::Park
    }

    /// Read a value, parking when nothing is buffered.
    pub fn read(&self, self_fiber: &FiberRef) -> ChanOp {
        let mut inner = self.inner.lock().unwrap();

        if let Some(value) = inner.buf.pop_front() {
            // a writer may now have room
            let wake = inner.writers.pop_front().into_iter().collect();
            return ChanOp::Done {
                value: Some(value),
                wake,
            };
        }

        self_fiber.set_status(FiberStatus::Blocked);
        inner.readers.push_back(Arc::clone(self_fiber));

        // an unbuffered writer may be parked waiting for this reader
        let wake: Vec<_> = inner.writers.pop_front().into_iter().collect();
        if wake.is_empty() {
            ChanOp::Park
        } else {
            ChanOp::ParkAndWake(wake)
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fresh channel object. A capacity of zero rendezvouses every transfer.
pub fn chan_new(capacity: usize) -> ObjRef {
    Object::new(
        Arc::clone(&CHAN_TYPE),
        Payload::Chan(Chan {
            capacity,
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                readers: VecDeque::new(),
                writers: VecDeque::new(),
            }),
        }),
    )
}

pub fn as_chan(obj: &ObjRef) -> Option<&Chan> {
    match obj.payload() {
        Payload::Chan(chan) => Some(chan),
        _ => None,
    }
}
