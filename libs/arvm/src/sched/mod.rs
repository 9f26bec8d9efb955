// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The M:N scheduler.
//!
//! Runnable fibers are multiplexed over a fixed array of virtual cores
//! (VCores), each a bounded FIFO queue wired to at most one OS worker at a
//! time. Overflow and remote spawns land in the unbounded global queue.
//! Workers are started on demand up to the configured cap, park on the
//! scheduler's condition variable when there is nothing to do, and steal
//! half a victim's queue when their own runs dry.
//!
//! Invariants the rest of the runtime relies on:
//!
//! - a runnable fiber sits in exactly one queue;
//! - a fiber is owned by at most one worker at a time (`active_ost`);
//! - a VCore is wired to at most one worker, a worker owns at most one
//!   VCore.

mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use fqueue::{Full, Queue};

use crate::vm::Config;
use crate::vm::fiber::{Fiber, FiberRef, FiberStatus};

pub(crate) use worker::CURRENT_VCORE;

/// Iterations between forced global-queue probes, so local work cannot
/// starve remote spawns.
const TICK_BEFORE_GLOBAL_CHECK: u32 = 61;

pub struct VCore {
    pub queue: Queue<FiberRef>,
    wired: AtomicBool,
    /// Set while a worker is stealing into this core's queue.
    stealing: AtomicBool,
}

// === impl VCore ===

impl VCore {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Queue::new(capacity),
            wired: AtomicBool::new(false),
            stealing: AtomicBool::new(false),
        }
    }

    /// Attempt to wire this core to a worker.
    fn try_wire(&self) -> bool {
        self.wired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unwire(&self) {
        self.wired.store(false, Ordering::Release);
    }
}

struct OstState {
    idle: usize,
    alive: usize,
    next_id: u64,
}

pub struct Scheduler {
    vcores: Box<[VCore]>,
    /// Unbounded overflow and remote-spawn queue.
    global: Queue<FiberRef>,
    pool: Mutex<Vec<FiberRef>>,
    pool_cap: usize,

    ost: Mutex<OstState>,
    ost_cond: Condvar,

    /// VCores currently not wired to any worker.
    vc_idle: AtomicUsize,
    /// Workers currently in the stealing state, bounded by the busy-VCore
    /// count to avoid a thundering herd.
    spinning: AtomicUsize,

    should_stop: AtomicBool,
    max_ost: usize,
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        let vcores = if config.vcores == 0 {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        } else {
            config.vcores
        };

        tracing::debug!(vcores, max_ost = config.max_ost, "scheduler initialized");

        Self {
            vcores: (0..vcores)
                .map(|_| VCore::new(config.vcore_queue))
                .collect(),
            global: Queue::new(0),
            pool: Mutex::new(Vec::new()),
            pool_cap: config.fiber_pool,
            ost: Mutex::new(OstState {
                idle: 0,
                alive: 0,
                next_id: 0,
            }),
            ost_cond: Condvar::new(),
            vc_idle: AtomicUsize::new(vcores),
            spinning: AtomicUsize::new(0),
            should_stop: AtomicBool::new(false),
            max_ost: config.max_ost.max(1),
        }
    }

    pub fn num_vcores(&self) -> usize {
        self.vcores.len()
    }

    pub(crate) fn vcores(&self) -> &[VCore] {
        &self.vcores
    }

    pub(crate) fn global_queue(&self) -> &Queue<FiberRef> {
        &self.global
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    /// Fetch a recyclable fiber shell or allocate a fresh one.
    pub fn alloc_fiber(&self) -> FiberRef {
        let mut pool = self.pool.lock().unwrap();
        while let Some(fiber) = pool.pop() {
            // a shell still referenced elsewhere cannot be reused
            if Arc::strong_count(&fiber) == 1 {
                fiber.reset();
                return fiber;
            }
        }
        drop(pool);

        Fiber::new()
    }

    fn free_fiber(&self, fiber: FiberRef) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.pool_cap {
            pool.push(fiber);
        }
    }

    /// Make `fiber` runnable: local queue when called from a worker, global
    /// queue otherwise, then make sure somebody is awake to run it.
    pub fn spawn(&self, fiber: FiberRef, rt: &Arc<crate::vm::RuntimeInner>) {
        fiber.set_status(FiberStatus::Runnable);

        let local = CURRENT_VCORE.with(|c| c.get());
        match local {
            Some(idx) => {
                if let Err(Full(fiber)) = self.vcores[idx].queue.push(fiber) {
                    self.global.push(fiber).ok();
                }
            }
            None => {
                self.global.push(fiber).ok();
            }
        }

        self.wake_run(rt);
    }

    /// Wake one idle worker, or start a new one while under the cap.
    pub fn wake_run(&self, rt: &Arc<crate::vm::RuntimeInner>) {
        if self.should_stop() {
            return;
        }

        // all cores wired and nothing queued globally: the running workers
        // will find the work themselves
        if self.global.is_empty() && self.vc_idle.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut ost = self.ost.lock().unwrap();

        if ost.idle > 0 {
            self.ost_cond.notify_one();
            return;
        }

        if ost.alive >= self.max_ost {
            return;
        }

        ost.alive += 1;
        let id = ost.next_id;
        ost.next_id += 1;
        drop(ost);

        let rt = Arc::clone(rt);
        let spawned = std::thread::Builder::new()
            .name(format!("argon-worker-{id}"))
            .spawn(move || worker::worker_loop(&rt, id));

        if let Err(err) = spawned {
            // thread exhaustion is environment corruption
            panic!("failed to start scheduler worker: {err}");
        }

        tracing::debug!(worker = id, "started worker");
    }

    /// Stop all workers, waiting up to `timeout` for them to drain.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.should_stop.store(true, Ordering::Release);

        let mut ost = self.ost.lock().unwrap();
        self.ost_cond.notify_all();

        let deadline = std::time::Instant::now() + timeout;
        while ost.alive > 0 {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                tracing::warn!(alive = ost.alive, "shutdown timed out");
                return false;
            };

            let (guard, _) = self.ost_cond.wait_timeout(ost, remaining).unwrap();
            ost = guard;
        }

        true
    }

    /// Publish a finished fiber's result through its future and recycle the
    /// shell.
    pub(crate) fn publish_result(
        &self,
        rt: &Arc<crate::vm::RuntimeInner>,
        fiber: FiberRef,
        result: Option<crate::object::ObjRef>,
    ) {
        use crate::object::{error, future};

        let last_error = fiber.core.lock().unwrap().last_error();

        if result.is_none()
            && rt.config.stack_trace
            && !last_error
                .as_ref()
                .is_some_and(|e| error::error_is(e, error::KIND_RUNTIME_EXIT))
        {
            let core = fiber.core.lock().unwrap();
            eprint!("{}", crate::vm::panicking::render_traceback(&core.panics));
        }

        if let Some(fut_obj) = fiber.future() {
            if let Some(fut) = future::as_future(&fut_obj) {
                let outcome = match &result {
                    Some(value) => Ok(value.clone()),
                    None => Err(last_error.unwrap_or_else(|| {
                        error::runtime_error("fiber terminated without a result".to_string())
                    })),
                };

                for waiter in fut.resolve(outcome) {
                    self.spawn(waiter, rt);
                }
            }
        }

        self.free_fiber(fiber);
    }

    // internal accessors for the worker loop

    fn park_worker(&self) {
        let mut ost = self.ost.lock().unwrap();

        // the stop flag is flipped before the broadcast, both under this
        // lock's protection on the waiter side, so checking here closes the
        // park-after-broadcast window
        if self.should_stop() {
            return;
        }

        ost.idle += 1;
        ost = self.ost_cond.wait(ost).unwrap();
        ost.idle = ost.idle.saturating_sub(1);
    }

    fn worker_exit(&self) {
        let mut ost = self.ost.lock().unwrap();
        ost.alive -= 1;
        drop(ost);
        self.ost_cond.notify_all();
    }

    fn vc_idle(&self) -> usize {
        self.vc_idle.load(Ordering::Acquire)
    }

    /// Wire any free VCore, preferring `pref`.
    fn acquire_vcore(&self, pref: Option<usize>) -> Option<usize> {
        if let Some(idx) = pref
            && self.vcores[idx].try_wire()
        {
            self.vc_idle.fetch_sub(1, Ordering::AcqRel);
            return Some(idx);
        }

        for (idx, vcore) in self.vcores.iter().enumerate() {
            if vcore.try_wire() {
                self.vc_idle.fetch_sub(1, Ordering::AcqRel);
                return Some(idx);
            }
        }

        None
    }

    fn release_vcore(&self, idx: usize) {
        self.vcores[idx].unwire();
        self.vc_idle.fetch_add(1, Ordering::AcqRel);
    }
}
