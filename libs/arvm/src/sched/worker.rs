// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker scheduling loop.
//!
//! A worker acquires a VCore, drains runnable fibers from it (probing the
//! global queue every [`TICK_BEFORE_GLOBAL_CHECK`] iterations so remote
//! spawns cannot starve), steals from a random victim when it runs dry, and
//! parks when the whole scheduler is quiet.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use fqueue::Full;

use crate::sched::{Scheduler, TICK_BEFORE_GLOBAL_CHECK};
use crate::vm::eval::{FiberExit, eval, install_async_result};
use crate::vm::fiber::{FiberRef, FiberStatus};
use crate::vm::RuntimeInner;

thread_local! {
    /// Index of the VCore wired to this thread, when it is a worker.
    pub(crate) static CURRENT_VCORE: Cell<Option<usize>> = const { Cell::new(None) };
}

pub(super) fn worker_loop(rt: &Arc<RuntimeInner>, id: u64) {
    let sched = &rt.sched;
    let mut rng = fastrand::Rng::with_seed(id ^ 0x9e37_79b9_7f4a_7c15);

    // a fiber picked up but not yet runnable again (still owned by its
    // previous worker, or displaced by a queue probe)
    let mut last: Option<FiberRef> = None;
    let mut vcore: Option<usize> = None;
    let mut tick = 0_u32;
    let mut spinning = false;

    tracing::debug!(worker = id, "worker online");

    while !sched.should_stop() {
        // make sure we own a VCore, parking while none is free
        vcore = match acquire_or_park(sched, vcore, &mut last) {
            Some(idx) => {
                CURRENT_VCORE.with(|c| c.set(Some(idx)));
                Some(idx)
            }
            None => break,
        };
        let vc_idx = vcore.expect("worker without a vcore");

        tick += 1;
        let global_first = tick >= TICK_BEFORE_GLOBAL_CHECK;
        if global_first {
            tick = 0;
        }

        let mut fiber = find_executable(sched, vc_idx, global_first, &mut rng, &mut spinning);

        if fiber.is_none() {
            fiber = last.take();
        }

        let Some(fiber) = fiber else {
            // nothing anywhere: give the VCore back and sleep
            CURRENT_VCORE.with(|c| c.set(None));
            sched.release_vcore(vc_idx);
            vcore = None;

            if sched.should_stop() {
                break;
            }
            sched.park_worker();
            continue;
        };

        if spinning {
            spinning = false;
            sched.spinning.fetch_sub(1, Ordering::AcqRel);
            if sched.vc_idle() > 0 {
                sched.ost_cond.notify_one();
            }
        }

        if let Some(displaced) = last.take() {
            if let Err(Full(displaced)) = sched.vcores()[vc_idx].queue.push(displaced) {
                sched.global_queue().push(displaced).ok();
            }
        }

        // an I/O completion can re-enqueue a fiber before the worker that
        // ran it has released it; give that worker one beat to let go
        if fiber.active_ost().is_some() {
            last = Some(fiber);
            continue;
        }

        // fibers pinned by LockOST stay with their worker
        if let Some(pinned) = fiber.pinned_ost()
            && pinned != id
        {
            sched.global_queue().push(fiber).ok();
            continue;
        }

        fiber.set_active_ost(id);
        install_async_result(&fiber);
        fiber.set_status(FiberStatus::Running);

        tracing::trace!(worker = id, fiber = fiber.id(), "running fiber");
        let exit = eval(rt, &fiber);
        fiber.clear_active_ost();

        match exit {
            FiberExit::Suspended => {
                // cooperative yields come right back; blocked fibers are
                // respawned by whoever completes their wait
                if fiber.status() == FiberStatus::Suspended {
                    last = Some(fiber);
                }
            }
            FiberExit::Done(result) => {
                debug_assert!(fiber.core.lock().unwrap().frames.is_empty());
                sched.publish_result(rt, fiber, result);
            }
        }
    }

    // shutdown: put the VCore back and unwind
    CURRENT_VCORE.with(|c| c.set(None));
    if let Some(idx) = vcore {
        sched.release_vcore(idx);
    }
    if let Some(fiber) = last.take() {
        sched.global_queue().push(fiber).ok();
    }
    if spinning {
        sched.spinning.fetch_sub(1, Ordering::AcqRel);
    }

    sched.worker_exit();
    tracing::debug!(worker = id, "worker offline");
}

/// Wire a VCore, preferring the previously owned one; park until one frees
/// up. `None` only on shutdown.
fn acquire_or_park(
    sched: &Scheduler,
    pref: Option<usize>,
    last: &mut Option<FiberRef>,
) -> Option<usize> {
    if let Some(idx) = pref
        && sched.vcores()[idx].wired.load(Ordering::Acquire)
        && CURRENT_VCORE.with(|c| c.get()) == Some(idx)
    {
        // still wired from the previous iteration
        return Some(idx);
    }

    loop {
        if sched.should_stop() {
            return None;
        }

        if let Some(idx) = sched.acquire_vcore(pref) {
            return Some(idx);
        }

        // nothing to run on: hand any carried fiber to the global queue so
        // it cannot be lost while we sleep
        if let Some(fiber) = last.take() {
            sched.global_queue().push(fiber).ok();
        }

        sched.park_worker();
    }
}

/// Pick the next runnable fiber: local queue first (global first every
/// [`TICK_BEFORE_GLOBAL_CHECK`] ticks), then the global queue, then
/// stealing.
fn find_executable(
    sched: &Scheduler,
    vc_idx: usize,
    global_first: bool,
    rng: &mut fastrand::Rng,
    spinning: &mut bool,
) -> Option<FiberRef> {
    if sched.should_stop() {
        return None;
    }

    let local = &sched.vcores()[vc_idx].queue;

    if !global_first
        && let Some(fiber) = local.pop()
    {
        return Some(fiber);
    }

    if let Some(fiber) = sched.global_queue().pop() {
        return Some(fiber);
    }

    if let Some(fiber) = steal_work(sched, vc_idx, rng, spinning) {
        return Some(fiber);
    }

    if global_first {
        return local.pop();
    }

    None
}

/// Steal half of a random victim's queue into ours, bounded so that at most
/// one spinner exists per busy VCore.
fn steal_work(
    sched: &Scheduler,
    vc_idx: usize,
    rng: &mut fastrand::Rng,
    spinning: &mut bool,
) -> Option<FiberRef> {
    let vcores = sched.vcores();
    let busy = vcores.len().saturating_sub(sched.vc_idle());

    if !*spinning {
        if sched.spinning.load(Ordering::Acquire) + 1 > busy {
            return None;
        }
        *spinning = true;
        sched.spinning.fetch_add(1, Ordering::AcqRel);
    }

    let n = vcores.len();
    let start = rng.usize(..n.max(1));

    let our = &vcores[vc_idx];
    our.stealing.store(true, Ordering::Release);

    let mut found = None;
    for i in 0..n {
        let idx = (start + i) % n;
        if idx == vc_idx {
            continue;
        }

        let victim = &vcores[idx];
        if victim.stealing.load(Ordering::Acquire) {
            continue;
        }

        // only queues with at least two items are worth splitting
        let Ok(stealer) = victim.queue.try_steal(2) else {
            continue;
        };

        if let Some(fiber) = stealer.take_half(&our.queue) {
            tracing::trace!(victim = idx, into = vc_idx, "stole work");
            found = Some(fiber);
            break;
        }
    }

    our.stealing.store(false, Ordering::Release);
    found
}
