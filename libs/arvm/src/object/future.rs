// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Futures: single-shot, write-once handles publishing a fiber's terminal
//! result.
//!
//! A future can be awaited by fibers (which park and are respawned on
//! resolution) and by host threads (which block on the condition variable).

use std::sync::{Arc, Condvar, LazyLock, Mutex};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, Payload};
use crate::vm::fiber::FiberRef;

pub static FUTURE_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("future");
    typ.repr = Some(|obj| {
        let Payload::Future(fut) = obj.payload() else {
            unreachable!("future repr on non-future payload")
        };
        Ok(if fut.is_resolved() {
            "<future resolved>".to_string()
        } else {
            "<future pending>".to_string()
        })
    });
    Arc::new(typ)
});

pub struct Future {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    result: Option<Result<ObjRef, ObjRef>>,
    waiters: Vec<FiberRef>,
}

// === impl Future ===

impl Future {
    pub fn is_resolved(&self) -> bool {
        self.state.lock().unwrap().result.is_some()
    }

    /// The resolved result, if any.
    pub fn result(&self) -> Option<Result<ObjRef, ObjRef>> {
        self.state.lock().unwrap().result.clone()
    }

    /// Register `fiber` to be respawned on resolution. Returns `false` when
    /// the future is already resolved, in which case the caller must not
    /// park.
    pub fn register(&self, fiber: FiberRef) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.result.is_some() {
            return false;
        }

        state.waiters.push(fiber);
        true
    }

    /// Resolve the future, waking host waiters and handing back the parked
    /// fibers for the caller to respawn.
    ///
    /// A second resolution is ignored; the handle is write-once.
    pub fn resolve(&self, result: Result<ObjRef, ObjRef>) -> Vec<FiberRef> {
        let mut state = self.state.lock().unwrap();

        if state.result.is_some() {
            tracing::warn!("future resolved twice, keeping the first result");
            return Vec::new();
        }

        state.result = Some(result);
        self.cond.notify_all();
        std::mem::take(&mut state.waiters)
    }

    /// Block the calling OS thread until resolution. Host-side only; fibers
    /// go through `AWAIT`.
    pub fn wait_blocking(&self) -> Result<ObjRef, ObjRef> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// A fresh, unresolved future object.
pub fn future_new() -> ObjRef {
    Object::new(
        Arc::clone(&FUTURE_TYPE),
        Payload::Future(Future {
            state: Mutex::new(State {
                result: None,
                waiters: Vec::new(),
            }),
            cond: Condvar::new(),
        }),
    )
}

pub fn as_future(obj: &ObjRef) -> Option<&Future> {
    match obj.payload() {
        Payload::Future(fut) => Some(fut),
        _ => None,
    }
}
