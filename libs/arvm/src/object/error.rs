// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error objects.
//!
//! An error carries an atom-interned kind tag and a message. Panics raised
//! by the runtime itself always use one of the kind constants below; user
//! code can panic with any object.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{CompareMode, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, atom, boolean};

pub const KIND_TYPE: &str = "TypeError";
pub const KIND_VALUE: &str = "ValueError";
pub const KIND_OVERFLOW: &str = "OverflowError";
pub const KIND_ZERO_DIVISION: &str = "ZeroDivisionError";
pub const KIND_UNASSIGNABLE: &str = "UnassignableError";
pub const KIND_UNDECLARED: &str = "UndeclaredError";
pub const KIND_OS: &str = "OSError";
pub const KIND_ACCESS_VIOLATION: &str = "AccessViolationError";
pub const KIND_NOT_IMPLEMENTED: &str = "NotImplementedError";
pub const KIND_RUNTIME: &str = "RuntimeError";
pub const KIND_ASSERTION: &str = "AssertionError";
pub const KIND_UNICODE: &str = "UnicodeError";
pub const KIND_BUFFER: &str = "BufferError";
pub const KIND_RUNTIME_EXIT: &str = "RuntimeExitError";
pub const KIND_KEY: &str = "KeyError";
pub const KIND_UNHASHABLE: &str = "UnhashableError";

pub static ERROR_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("error");
    typ.compare = Some(error_compare);
    typ.repr = Some(error_repr);
    Arc::new(typ)
});

pub struct ErrorPayload {
    /// Atom-interned kind tag.
    pub kind: ObjRef,
    pub message: String,
}

/// Build an error object with the given kind atom and message.
pub fn error_new(kind: &str, message: String) -> ObjRef {
    Object::new(
        Arc::clone(&ERROR_TYPE),
        Payload::Error(ErrorPayload {
            kind: atom::atom(kind),
            message,
        }),
    )
}

pub fn type_error(message: String) -> ObjRef {
    error_new(KIND_TYPE, message)
}

pub fn value_error(message: String) -> ObjRef {
    error_new(KIND_VALUE, message)
}

pub fn runtime_error(message: String) -> ObjRef {
    error_new(KIND_RUNTIME, message)
}

pub fn overflow_error(message: String) -> ObjRef {
    error_new(KIND_OVERFLOW, message)
}

pub fn zero_division_error() -> ObjRef {
    error_new(KIND_ZERO_DIVISION, "division by zero".to_string())
}

pub fn undeclared_error(name: &str) -> ObjRef {
    error_new(KIND_UNDECLARED, format!("undeclared variable '{name}'"))
}

pub fn unassignable_error(name: &str) -> ObjRef {
    error_new(
        KIND_UNASSIGNABLE,
        format!("unable to assign to constant '{name}'"),
    )
}

pub fn access_violation_error(message: String) -> ObjRef {
    error_new(KIND_ACCESS_VIOLATION, message)
}

pub fn key_error(key_repr: &str) -> ObjRef {
    error_new(KIND_KEY, format!("invalid key '{key_repr}'"))
}

pub fn unhashable_error(type_name: &str) -> ObjRef {
    error_new(KIND_UNHASHABLE, format!("unhashable type '{type_name}'"))
}

pub fn buffer_error(message: String) -> ObjRef {
    error_new(KIND_BUFFER, message)
}

pub fn os_error(errno: i32, context: &str) -> ObjRef {
    error_new(
        KIND_OS,
        format!("{context}: {}", std::io::Error::from_raw_os_error(errno)),
    )
}

/// Whether `obj` is an error object of the given kind.
pub fn error_is(obj: &ObjRef, kind: &str) -> bool {
    matches!(obj.payload(), Payload::Error(e) if atom::atom_is(&e.kind, kind))
}

pub fn error_kind(obj: &ObjRef) -> Option<&ObjRef> {
    match obj.payload() {
        Payload::Error(e) => Some(&e.kind),
        _ => None,
    }
}

pub fn error_message(obj: &ObjRef) -> Option<&str> {
    match obj.payload() {
        Payload::Error(e) => Some(&e.message),
        _ => None,
    }
}

fn error_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Error(ea), Payload::Error(eb)) = (a.payload(), b.payload()) else {
        return None;
    };

    let eq = Arc::ptr_eq(&ea.kind, &eb.kind) && ea.message == eb.message;
    match mode {
        CompareMode::Eq => Some(Ok(boolean::boolean(eq))),
        CompareMode::Ne => Some(Ok(boolean::boolean(!eq))),
        _ => None,
    }
}

fn error_repr(obj: &ObjRef) -> OpResult<String> {
    let Payload::Error(e) = obj.payload() else {
        unreachable!("error repr on non-error payload")
    };

    Ok(format!("{}: {}", atom::atom_str(&e.kind), e.message))
}
