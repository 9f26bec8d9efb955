// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The object ABI.
//!
//! Every runtime value is an [`Object`]: a header holding the type handle
//! and an optional monitor, followed by a type-specific [`Payload`]. Objects
//! are shared through [`ObjRef`] (acquire is `clone`, release is `drop`);
//! weak references use [`std::sync::Weak`]. Evaluation-stack and local slots
//! are [`Slot`]s: either a strong reference or the null sentinel, which is
//! distinct from the `nil` object.
//!
//! Operations that can fail in-language return [`OpResult`]: the error
//! variant carries the error *object* that the engine turns into a panic
//! record on the current fiber.

pub mod atom;
pub mod boolean;
pub mod bounds;
pub mod bytes;
pub mod chan;
pub mod code;
pub mod dict;
pub mod error;
pub mod float;
pub mod function;
pub mod future;
pub mod integer;
pub mod iterator;
pub mod list;
pub mod module;
pub mod monitor;
pub mod namespace;
pub mod nil;
pub mod result;
pub mod set;
pub mod string;
pub mod structure;
pub mod tuple;
pub mod typeinfo;

use std::sync::{Arc, Mutex, OnceLock};

use crate::evloop::socket::Socket;
use crate::object::bounds::Bounds;
use crate::object::chan::Chan;
use crate::object::code::Code;
use crate::object::dict::DictMap;
use crate::object::error::ErrorPayload;
use crate::object::function::Function;
use crate::object::future::Future;
use crate::object::iterator::IterState;
use crate::object::module::Module;
use crate::object::monitor::Monitor;
use crate::object::result::ResultPayload;
use crate::object::set::SetMap;
use crate::object::structure::Instance;
use crate::object::typeinfo::{CompareMode, OpSlots, TypeHandle};
use crate::vm::generator::Generator;

/// A strong reference to a heap object.
pub type ObjRef = Arc<Object>;

/// One evaluation-stack or local slot: a strong reference or the null
/// sentinel. Slots are never left uninitialized between the live region and
/// the stack ceiling.
pub type Slot = Option<ObjRef>;

/// The result of an in-language operation. The error variant is the error
/// object a panic will be raised with.
pub type OpResult<T = ObjRef> = Result<T, ObjRef>;

pub struct Object {
    typ: TypeHandle,
    monitor: OnceLock<Monitor>,
    payload: Payload,
}

pub enum Payload {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
    Atom(Box<str>),
    Bytes(Mutex<Vec<u8>>),
    Tuple(Box<[ObjRef]>),
    List(Mutex<Vec<ObjRef>>),
    Set(Mutex<SetMap>),
    Dict(Mutex<DictMap>),
    Bounds(Bounds),
    Code(Arc<Code>),
    Function(Function),
    Error(ErrorPayload),
    Result(ResultPayload),
    Future(Future),
    Chan(Chan),
    Generator(Generator),
    Iter(Mutex<IterState>),
    Module(Module),
    Type(TypeHandle),
    Instance(Instance),
    Socket(Socket),
}

// === impl Object ===

impl Object {
    pub fn new(typ: TypeHandle, payload: Payload) -> ObjRef {
        Arc::new(Self {
            typ,
            monitor: OnceLock::new(),
            payload,
        })
    }

    #[inline]
    pub fn typ(&self) -> &TypeHandle {
        &self.typ
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.typ.name
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The monitor serializing `sync` blocks on this object, attached on
    /// first use.
    pub fn monitor(&self) -> &Monitor {
        self.monitor.get_or_init(Monitor::new)
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.get().is_some()
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} object at {:p}>", self.type_name(), self)
    }
}

/// Identity of an object, used by `is` comparisons and identity-default
/// equality.
#[inline]
pub fn obj_id(obj: &ObjRef) -> usize {
    Arc::as_ptr(obj) as usize
}

#[inline]
pub fn same_type(a: &ObjRef, b: &ObjRef) -> bool {
    Arc::ptr_eq(a.typ(), b.typ())
}

/// Truth value of a slot. The null sentinel is false; objects without a
/// truth slot are true.
pub fn is_true(slot: &Slot) -> bool {
    match slot {
        None => false,
        Some(obj) => match obj.typ().truth {
            Some(truth) => truth(obj),
            None => true,
        },
    }
}

/// Rich comparison dispatch.
///
/// The left operand's slot is tried first, then the right's with swapped
/// operands and mirrored mode. When both are absent, `EQ`/`NE` fall back to
/// identity and every other mode fails with a `TypeError`.
pub fn compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> OpResult {
    if let Some(cmp) = a.typ().compare
        && let Some(ret) = cmp(a, b, mode)
    {
        return ret;
    }

    let mirrored = match mode {
        CompareMode::Lt => CompareMode::Gt,
        CompareMode::Le => CompareMode::Ge,
        CompareMode::Gt => CompareMode::Lt,
        CompareMode::Ge => CompareMode::Le,
        other => other,
    };

    if let Some(cmp) = b.typ().compare
        && let Some(ret) = cmp(b, a, mirrored)
    {
        return ret;
    }

    match mode {
        CompareMode::Eq => Ok(boolean::boolean(Arc::ptr_eq(a, b))),
        CompareMode::Ne => Ok(boolean::boolean(!Arc::ptr_eq(a, b))),
        _ => Err(error::type_error(format!(
            "'{}' not supported between instance of '{}' and '{}'",
            mode.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Equality probe used by `TEST`, dict keys and namespace internals.
pub fn equal(a: &ObjRef, b: &ObjRef) -> OpResult<bool> {
    if Arc::ptr_eq(a, b) {
        return Ok(true);
    }

    let ret = compare(a, b, CompareMode::Eq)?;
    Ok(is_true(&Some(ret)))
}

/// String conversion, defaulting to the debug form.
pub fn repr(obj: &ObjRef) -> OpResult<String> {
    match obj.typ().repr {
        Some(repr) => repr(obj),
        None => Ok(format!("<{} object>", obj.type_name())),
    }
}

/// Binary operator dispatch: left slot first, then the right operand's slot
/// with the operands kept in order (the slot itself inspects both sides).
pub fn binary_op(
    a: &ObjRef,
    b: &ObjRef,
    select: fn(&OpSlots) -> Option<typeinfo::BinaryOp>,
    symbol: &str,
) -> OpResult {
    if let Some(op) = a.typ().ops.and_then(select)
        && let Some(ret) = op(a, b)
    {
        return ret;
    }

    if !same_type(a, b)
        && let Some(op) = b.typ().ops.and_then(select)
        && let Some(ret) = op(a, b)
    {
        return ret;
    }

    Err(error::runtime_error(format!(
        "unsupported operand type(s) for '{symbol}': '{}' and '{}'",
        a.type_name(),
        b.type_name()
    )))
}

pub fn unary_op(
    a: &ObjRef,
    select: fn(&OpSlots) -> Option<typeinfo::UnaryOp>,
    symbol: &str,
) -> OpResult {
    let Some(op) = a.typ().ops.and_then(select) else {
        return Err(error::runtime_error(format!(
            "unsupported operand type for '{symbol}': '{}'",
            a.type_name()
        )));
    };

    op(a)
}

/// Convert an object into an iterator through its `iter` slot.
pub fn iter_get(obj: &ObjRef, reversed: bool) -> OpResult {
    let Some(slots) = obj.typ().iter else {
        return Err(error::type_error(format!(
            "'{}' is not iterable",
            obj.type_name()
        )));
    };

    (slots.iter)(obj, reversed)
}

/// Advance an iterator. `Ok(None)` means exhaustion, not an error.
pub fn iter_next(iter: &ObjRef) -> OpResult<Option<ObjRef>> {
    let Some(next) = iter.typ().iter.and_then(|s| s.next) else {
        return Err(error::type_error(format!(
            "'{}' is not an iterator",
            iter.type_name()
        )));
    };

    next(iter)
}

/// Subscript load, routing bounds objects to the slice slot.
pub fn subscript_get(obj: &ObjRef, index: &ObjRef) -> OpResult {
    let Some(slots) = obj.typ().subscript else {
        return Err(error::type_error(format!(
            "'{}' not subscriptable",
            obj.type_name()
        )));
    };

    if matches!(index.payload(), Payload::Bounds(_)) {
        let Some(get_slice) = slots.get_slice else {
            return Err(error::type_error(format!(
                "'{}' does not support slice operations",
                obj.type_name()
            )));
        };

        return get_slice(obj, index);
    }

    let Some(get_item) = slots.get_item else {
        return Err(error::type_error(format!(
            "'{}' does not support index operations",
            obj.type_name()
        )));
    };

    get_item(obj, index)
}

/// Subscript store, routing bounds objects to the slice slot.
pub fn subscript_set(obj: &ObjRef, index: &ObjRef, value: &ObjRef) -> OpResult<()> {
    let Some(slots) = obj.typ().subscript else {
        return Err(error::type_error(format!(
            "'{}' not subscriptable",
            obj.type_name()
        )));
    };

    if matches!(index.payload(), Payload::Bounds(_)) {
        let Some(set_slice) = slots.set_slice else {
            return Err(error::type_error(format!(
                "'{}' does not support slice operations",
                obj.type_name()
            )));
        };

        return set_slice(obj, index, value);
    }

    let Some(set_item) = slots.set_item else {
        return Err(error::type_error(format!(
            "'{}' does not support index operations",
            obj.type_name()
        )));
    };

    set_item(obj, index, value)
}

/// Containment probe (`in` / `not in`).
pub fn item_in(container: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    let Some(item_in) = container.typ().subscript.and_then(|s| s.item_in) else {
        return Err(error::runtime_error(format!(
            "unsupported operand type for 'in': '{}'",
            container.type_name()
        )));
    };

    item_in(container, item)
}

/// Read access through the buffer protocol.
pub fn buffer_read(obj: &ObjRef, f: &mut dyn FnMut(&[u8])) -> OpResult<()> {
    let Some(slots) = obj.typ().buffer else {
        return Err(error::buffer_error(format!(
            "'{}' does not support buffer access",
            obj.type_name()
        )));
    };

    (slots.read)(obj, f)
}

/// Write access through the buffer protocol.
pub fn buffer_write(obj: &ObjRef, f: &mut dyn FnMut(&mut Vec<u8>)) -> OpResult<()> {
    let Some(write) = obj.typ().buffer.and_then(|s| s.write) else {
        return Err(error::buffer_error(format!(
            "'{}' does not support writable buffer access",
            obj.type_name()
        )));
    };

    write(obj, f)
}

/// Hash an object for use as a dict or set key.
pub fn obj_hash(obj: &ObjRef) -> OpResult<u64> {
    let Some(hash) = obj.typ().hash else {
        return Err(error::unhashable_error(obj.type_name()));
    };

    hash(obj)
}
