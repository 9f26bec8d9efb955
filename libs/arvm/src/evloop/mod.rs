// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The asynchronous event loop.
//!
//! One loop per runtime, executing on its own thread (never on a scheduler
//! worker). It owns the platform poller, the per-descriptor event queues
//! and the timer heap. Fibers interact with it only through the submission
//! entry points, which take the per-loop lock briefly; completions are
//! delivered by depositing the result into the initiating fiber's
//! async-result slot and handing the fiber back to the scheduler.
//!
//! The platform split lives in one place: [`sys`] is epoll on Linux, kqueue
//! on the BSDs and Darwin, and the Windows implementation in `iocp.rs`.

pub mod event;
pub mod socket;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        use epoll as sys;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
    ))] {
        mod kqueue;
        use kqueue as sys;
    } else if #[cfg(windows)] {
        mod iocp;
        use iocp as sys;
    }
}

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::object::{ObjRef, nil};
use crate::vm::RuntimeInner;
use crate::vm::fiber::{FiberRef, FiberStatus};

pub use event::{Direction, Event, EventBuffer, EventCb, EventStatus, RawDesc};

/// Poll timeout when no timer bounds the wait.
const EVENT_TIMEOUT_MS: u64 = 500;

/// Monotonic epoch all deadlines are measured against.
static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds since the loop epoch.
pub fn now_ms() -> u64 {
    u64::try_from(EPOCH.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: u64,
    seq: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct FdQueue {
    input: VecDeque<Event>,
    output: VecDeque<Event>,
}

impl FdQueue {
    fn len(&self) -> usize {
        self.input.len() + self.output.len()
    }

    fn queue(&mut self, direction: Direction) -> &mut VecDeque<Event> {
        match direction {
            Direction::In => &mut self.input,
            Direction::Out => &mut self.output,
        }
    }
}

struct LoopState {
    queues: HashMap<RawDesc, FdQueue>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_fibers: HashMap<u64, FiberRef>,
    timer_seq: u64,
}

pub struct EventLoop {
    rt: Weak<RuntimeInner>,
    /// Platform poller; lives outside the state lock so submissions never
    /// wait behind a poll.
    poller: std::sync::OnceLock<sys::Poller>,
    state: Mutex<LoopState>,
    cond: Condvar,
    /// Outstanding operations (events plus timers); the loop idles on its
    /// condition variable while zero.
    io_count: AtomicUsize,
    should_stop: AtomicBool,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

// === impl EventLoop ===

impl EventLoop {
    pub fn new(rt: Weak<RuntimeInner>) -> Self {
        Self {
            rt,
            poller: std::sync::OnceLock::new(),
            state: Mutex::new(LoopState {
                queues: HashMap::new(),
                timers: BinaryHeap::new(),
                timer_fibers: HashMap::new(),
                timer_seq: 0,
            }),
            cond: Condvar::new(),
            io_count: AtomicUsize::new(0),
            should_stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Create the platform poller and start the dispatcher thread.
    pub fn start(&self) -> anyhow::Result<()> {
        let poller = sys::Poller::new()?;
        if self.poller.set(poller).is_err() {
            anyhow::bail!("event loop started twice");
        }

        let rt = self.rt.clone();
        let handle = std::thread::Builder::new()
            .name("argon-evloop".to_string())
            .spawn(move || dispatcher(&rt))?;

        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.cond.notify_all();

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().ok();
        }
    }

    /// Arm a timer resuming `fiber` with `nil` after `ms` milliseconds.
    pub fn set_timeout(&self, fiber: &FiberRef, ms: u64) {
        fiber.set_status(FiberStatus::Blocked);

        let mut state = self.state.lock().unwrap();
        let seq = state.timer_seq;
        state.timer_seq += 1;

        state.timers.push(Reverse(TimerEntry {
            deadline: now_ms().saturating_add(ms),
            seq,
        }));
        state.timer_fibers.insert(seq, Arc::clone(fiber));

        self.io_count.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_one();

        tracing::trace!(fiber = fiber.id(), ms, "timer armed");
    }

    /// Register an I/O event. The initiating fiber must already have tried
    /// the operation and seen it block.
    pub fn submit(&self, event: Event) {
        event.fiber.set_status(FiberStatus::BlockedSuspended);

        let mut state = self.state.lock().unwrap();
        let fd = event.fd;

        let queue = state.queues.entry(fd).or_default();
        let first = queue.len() == 0;
        queue.queue(event.direction).push_back(event);

        drop(state);

        if first
            && let Some(poller) = self.poller.get()
            && let Err(err) = poller.add(fd)
        {
            // kernel registration failures mean a corrupted environment
            panic!("failed to register descriptor {fd} with the event loop: {err}");
        }

        self.io_count.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_one();

        tracing::trace!(fd, "event registered");
    }

    /// Cancel every pending operation of `fiber`, resuming it with `err`.
    pub fn cancel(&self, fiber: &FiberRef, err: &ObjRef) {
        let rt = self.rt.upgrade();
        let mut state = self.state.lock().unwrap();

        let mut cancelled = Vec::new();

        for queue in state.queues.values_mut() {
            for dir_queue in [&mut queue.input, &mut queue.output] {
                let before = dir_queue.len();
                dir_queue.retain(|event| {
                    if event.fiber.id() == fiber.id() {
                        cancelled.push(Arc::clone(&event.fiber));
                        false
                    } else {
                        true
                    }
                });
                let removed = before - dir_queue.len();
                for _ in 0..removed {
                    self.io_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        drop(state);

        for cancelled in cancelled {
            cancelled.set_async_error(err.clone());
            if let Some(rt) = &rt {
                rt.spawn_fiber(cancelled);
            }
        }
    }
}

/// The loop thread: wait for completions bounded by the nearest timer
/// deadline, run completion callbacks, expire timers.
fn dispatcher(rt: &Weak<RuntimeInner>) {
    tracing::debug!("event loop online");

    loop {
        let Some(rt) = rt.upgrade() else { break };
        let evloop = &rt.evloop;

        if evloop.should_stop.load(Ordering::Acquire) {
            break;
        }

        // idle until there is something to wait for
        if evloop.io_count.load(Ordering::Acquire) == 0 {
            let state = evloop.state.lock().unwrap();
            let _unused = evloop
                .cond
                .wait_timeout(state, Duration::from_millis(EVENT_TIMEOUT_MS))
                .unwrap();
            continue;
        }

        // pending writers are retried before every poll
        process_pending_output(&rt);

        let timeout = next_timeout(evloop);
        let mut ready = Vec::new();
        if let Some(poller) = evloop.poller.get()
            && let Err(err) = poller.wait(timeout, &mut ready)
        {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            panic!("event loop poll failed: {err}");
        }

        for readiness in ready {
            if readiness.readable {
                process_queue(&rt, readiness.fd, Direction::In);
            }
            if readiness.writable {
                process_queue(&rt, readiness.fd, Direction::Out);
            }
            maybe_unregister(&rt, readiness.fd);
        }

        expire_timers(&rt);
    }

    tracing::debug!("event loop offline");
}

fn next_timeout(evloop: &EventLoop) -> u64 {
    let state = evloop.state.lock().unwrap();
    let Some(Reverse(next)) = state.timers.peek() else {
        return EVENT_TIMEOUT_MS;
    };

    next.deadline.saturating_sub(now_ms()).min(EVENT_TIMEOUT_MS)
}

/// Run completion callbacks for one direction of one descriptor until a
/// callback reports the descriptor drained.
fn process_queue(rt: &Arc<RuntimeInner>, fd: RawDesc, direction: Direction) {
    loop {
        let mut event = {
            let mut state = rt.evloop.state.lock().unwrap();
            let Some(queue) = state.queues.get_mut(&fd) else {
                return;
            };
            let Some(event) = queue.queue(direction).pop_front() else {
                return;
            };
            event
        };

        match (event.callback)(&mut event) {
            EventStatus::Complete(result) => {
                let fiber = Arc::clone(&event.fiber);
                match result {
                    Ok(value) => fiber.set_async_value(value),
                    Err(err) => fiber.set_async_error(err),
                }

                rt.evloop.io_count.fetch_sub(1, Ordering::AcqRel);
                rt.spawn_fiber(fiber);
            }
            EventStatus::Again => {
                // not actually ready: put it back and stop draining
                let mut state = rt.evloop.state.lock().unwrap();
                state
                    .queues
                    .entry(fd)
                    .or_default()
                    .queue(direction)
                    .push_front(event);
                return;
            }
        }
    }
}

/// Retry descriptors with queued writers; send buffers often drain without
/// another poll round trip.
fn process_pending_output(rt: &Arc<RuntimeInner>) {
    let fds: Vec<RawDesc> = {
        let state = rt.evloop.state.lock().unwrap();
        state
            .queues
            .iter()
            .filter(|(_, q)| !q.output.is_empty())
            .map(|(fd, _)| *fd)
            .collect()
    };

    for fd in fds {
        process_queue(rt, fd, Direction::Out);
        maybe_unregister(rt, fd);
    }
}

/// Drop the poller registration once a descriptor has no pending events.
fn maybe_unregister(rt: &Arc<RuntimeInner>, fd: RawDesc) {
    let mut state = rt.evloop.state.lock().unwrap();

    let drained = state.queues.get(&fd).is_some_and(|q| q.len() == 0);
    if drained {
        state.queues.remove(&fd);
        drop(state);
        if let Some(poller) = rt.evloop.poller.get() {
            poller.delete(fd).ok();
        }
    }
}

fn expire_timers(rt: &Arc<RuntimeInner>) {
    let now = now_ms();

    loop {
        let fiber = {
            let mut state = rt.evloop.state.lock().unwrap();

            let Some(Reverse(next)) = state.timers.peek() else {
                return;
            };
            if next.deadline > now {
                return;
            }

            let Reverse(entry) = state.timers.pop().expect("peeked timer disappeared");
            state.timer_fibers.remove(&entry.seq)
        };

        // a cancelled timer leaves a heap entry with no fiber
        let Some(fiber) = fiber else { continue };

        tracing::trace!(fiber = fiber.id(), "timer expired");
        fiber.set_async_value(nil::nil());
        rt.evloop.io_count.fetch_sub(1, Ordering::AcqRel);
        rt.spawn_fiber(fiber);
    }
}
