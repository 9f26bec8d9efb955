// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The native function ABI.
//!
//! Natives are invoked directly by the call machinery. A native that needs
//! to wait (timers, sockets) registers the wait, marks the fiber blocked
//! and returns [`NativeOutcome::Suspend`]; the call site then performs the
//! regular call cleanup, leaving a placeholder on top of the stack that the
//! scheduler overwrites with the fiber's async result on resume.

use std::sync::Arc;

use crate::object::{ObjRef, OpResult};
use crate::vm::RuntimeInner;
use crate::vm::fiber::FiberRef;

pub enum NativeOutcome {
    Value(ObjRef),
    /// The fiber was parked; the async-result slot will carry the call's
    /// result when it resumes.
    Suspend,
}

pub type NativeResult = OpResult<NativeOutcome>;

pub struct NativeCtx<'a> {
    pub rt: &'a Arc<RuntimeInner>,
    pub fiber: &'a FiberRef,
}

pub type NativeFn = fn(&mut NativeCtx<'_>, &[ObjRef], Option<&ObjRef>) -> NativeResult;
