// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Event records.
//!
//! One [`Event`] describes one outstanding asynchronous operation. On the
//! readiness platforms the completion callback performs the actual syscall
//! when the descriptor signals; it reports whether the operation finished
//! (successfully or with an error delivered as a panic object) or needs to
//! stay registered.

use crate::object::{ObjRef, Slot};
use crate::vm::fiber::FiberRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Raw descriptor type shared across platforms.
pub type RawDesc = i32;

/// Readiness report from the platform poller.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub fd: RawDesc,
    pub readable: bool,
    pub writable: bool,
}

/// Outcome of running an event's completion callback.
pub enum EventStatus {
    /// The operation finished; the fiber resumes with the value (or
    /// panicking with the error).
    Complete(Result<ObjRef, ObjRef>),
    /// The descriptor was not actually ready (or the transfer is partial);
    /// keep the event registered.
    Again,
}

pub type EventCb = fn(&mut Event) -> EventStatus;

/// Buffer state carried across partial transfers.
#[derive(Default)]
pub struct EventBuffer {
    pub data: Vec<u8>,
    /// Bytes requested per chunk (`recv`), or total length to send.
    pub want: usize,
    /// Send offset for partial writes.
    pub off: usize,
}

pub struct Event {
    pub fiber: FiberRef,
    /// The object the operation originates from, typically a socket.
    pub initiator: ObjRef,
    /// Remote peer, user data.
    pub aux: Slot,
    pub buffer: EventBuffer,
    pub callback: EventCb,
    pub direction: Direction,
    pub fd: RawDesc,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("fiber", &self.fiber.id())
            .field("fd", &self.fd)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
