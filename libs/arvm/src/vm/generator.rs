// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generators: resumable frame objects.
//!
//! Calling a generator function does not execute it; it wraps the prepared
//! frame in a generator object. `NXT` takes the one-slot lock, reinstalls
//! the frame on the running fiber and executes until `YLD` hands the frame
//! back or a return marks the generator exhausted.

use std::sync::{Arc, LazyLock, Mutex};

use crate::object::typeinfo::{IterSlots, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, error};
use crate::vm::frame::Frame;

static GENERATOR_ITER: IterSlots = IterSlots {
    // `LDITER` passes generators through untouched
    iter: |obj, _| Ok(Arc::clone(obj)),
    next: None,
};

pub static GENERATOR_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("generator");
    typ.repr = Some(|obj| {
        let Payload::Generator(generator) = obj.payload() else {
            unreachable!("generator repr on non-generator payload")
        };
        Ok(format!("<generator {}>", generator.qname))
    });
    typ.iter = Some(&GENERATOR_ITER);
    Arc::new(typ)
});

pub struct Generator {
    pub qname: String,
    state: Mutex<State>,
}

enum State {
    /// Frame parked, ready to be resumed.
    Parked(Box<Frame>),
    /// Currently installed on the given fiber.
    Running(u64),
    Exhausted,
}

// === impl Generator ===

impl Generator {
    /// Attempt to take the frame for resumption on `fiber_id`.
    ///
    /// `Ok(None)` means the generator is exhausted.
    ///
    /// # Errors
    ///
    /// `RuntimeError` when the generator is already running; a generator
    /// frame is owned by at most one fiber at a time.
    pub fn take(&self, fiber_id: u64) -> OpResult<Option<Box<Frame>>> {
        let mut state = self.state.lock().unwrap();

        match std::mem::replace(&mut *state, State::Running(fiber_id)) {
            State::Parked(frame) => Ok(Some(frame)),
            State::Exhausted => {
                *state = State::Exhausted;
                Ok(None)
            }
            State::Running(owner) => {
                *state = State::Running(owner);
                Err(error::runtime_error(format!(
                    "generator '{}' is already running",
                    self.qname
                )))
            }
        }
    }

    /// Park the frame back after a `YLD`.
    pub fn park(&self, frame: Box<Frame>) {
        *self.state.lock().unwrap() = State::Parked(frame);
    }

    /// Mark exhausted after the frame returned or unwound.
    pub fn exhaust(&self) {
        *self.state.lock().unwrap() = State::Exhausted;
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Exhausted)
    }
}

/// Wrap a prepared frame into a generator object.
pub fn generator_new(qname: String, frame: Frame) -> ObjRef {
    Object::new(
        Arc::clone(&GENERATOR_TYPE),
        Payload::Generator(Generator {
            qname,
            state: Mutex::new(State::Parked(Box::new(frame))),
        }),
    )
}

pub fn as_generator(obj: &ObjRef) -> Option<&Generator> {
    match obj.payload() {
        Payload::Generator(generator) => Some(generator),
        _ => None,
    }
}
