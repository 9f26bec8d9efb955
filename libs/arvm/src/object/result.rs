// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `Result(value, error)` objects produced by trapped evaluations.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{self, ObjRef, Object, OpResult, Payload, nil};

pub static RESULT_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("result");
    typ.truth = Some(|obj| matches!(obj.payload(), Payload::Result(r) if r.ok));
    typ.repr = Some(result_repr);
    Arc::new(typ)
});

pub struct ResultPayload {
    pub value: ObjRef,
    pub ok: bool,
}

/// A successful result wrapping `value`.
pub fn result_ok(value: ObjRef) -> ObjRef {
    Object::new(
        Arc::clone(&RESULT_TYPE),
        Payload::Result(ResultPayload { value, ok: true }),
    )
}

/// A failed result wrapping the error object.
pub fn result_err(error: ObjRef) -> ObjRef {
    Object::new(
        Arc::clone(&RESULT_TYPE),
        Payload::Result(ResultPayload { value: error, ok: false }),
    )
}

/// The `value` attribute: the wrapped value on success, `nil` otherwise.
pub fn result_value(obj: &ObjRef) -> ObjRef {
    match obj.payload() {
        Payload::Result(r) if r.ok => Arc::clone(&r.value),
        _ => nil::nil(),
    }
}

/// The `error` attribute: the wrapped error on failure, `nil` otherwise.
pub fn result_error(obj: &ObjRef) -> ObjRef {
    match obj.payload() {
        Payload::Result(r) if !r.ok => Arc::clone(&r.value),
        _ => nil::nil(),
    }
}

fn result_repr(obj: &ObjRef) -> OpResult<String> {
    let Payload::Result(r) = obj.payload() else {
        unreachable!("result repr on non-result payload")
    };

    let inner = object::repr(&r.value)?;
    Ok(if r.ok {
        format!("Ok({inner})")
    } else {
        format!("Err({inner})")
    })
}
