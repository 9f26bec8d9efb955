// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Immutable UTF-8 strings.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, LazyLock};

use crate::object::bounds::Bounds;
use crate::object::typeinfo::{
    BufferSlots, CompareMode, IterSlots, OpSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{
    ObjRef, Object, OpResult, Payload, boolean, error, integer, iterator,
};

static STR_OPS: LazyLock<OpSlots> = LazyLock::new(|| OpSlots {
    add: Some(str_concat),
    inp_add: Some(str_concat),
    mul: Some(str_repeat),
    ..OpSlots::default()
});

static STR_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: Some(str_get_item),
    set_item: None,
    get_slice: Some(str_get_slice),
    set_slice: None,
    item_in: Some(str_item_in),
};

static STR_BUFFER: BufferSlots = BufferSlots {
    read: |obj, f| {
        f(str_value(obj).as_bytes());
        Ok(())
    },
    write: None,
};

static STR_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static STR_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("str");
    typ.truth = Some(|obj| !str_value(obj).is_empty());
    typ.repr = Some(|obj| Ok(str_value(obj).to_string()));
    typ.compare = Some(str_compare);
    typ.hash = Some(|obj| Ok(str_hash(str_value(obj))));
    typ.ops = Some(LazyLock::force(&STR_OPS));
    typ.subscript = Some(&STR_SUBSCRIPT);
    typ.buffer = Some(&STR_BUFFER);
    typ.iter = Some(&STR_ITER);
    Arc::new(typ)
});

pub fn string(value: impl Into<Box<str>>) -> ObjRef {
    Object::new(Arc::clone(&STR_TYPE), Payload::Str(value.into()))
}

pub fn str_value(obj: &ObjRef) -> &str {
    match obj.payload() {
        Payload::Str(s) => s,
        _ => "",
    }
}

/// Extract a `&str`, raising `TypeError` for anything else.
pub fn expect_str<'a>(obj: &'a ObjRef, what: &str) -> OpResult<&'a str> {
    match obj.payload() {
        Payload::Str(s) => Ok(s),
        _ => Err(error::type_error(format!(
            "{what} expects a 'str', got '{}'",
            obj.type_name()
        ))),
    }
}

pub fn str_hash(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Number of characters, as exposed by `len`.
pub fn str_len(obj: &ObjRef) -> usize {
    str_value(obj).chars().count()
}

fn str_concat(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Str(lhs), Payload::Str(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    let mut out = String::with_capacity(lhs.len() + rhs.len());
    out.push_str(lhs);
    out.push_str(rhs);
    Some(Ok(string(out)))
}

fn str_repeat(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::Str(lhs), Payload::Int(count)) = (a.payload(), b.payload()) else {
        return None;
    };

    let Ok(count) = usize::try_from(*count) else {
        return Some(Err(error::value_error(
            "negative string repetition".to_string(),
        )));
    };

    Some(Ok(string(lhs.repeat(count))))
}

fn str_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Str(lhs), Payload::Str(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    let ord = lhs.cmp(rhs);
    Some(Ok(boolean::boolean(match mode {
        CompareMode::Eq => ord.is_eq(),
        CompareMode::Ne => ord.is_ne(),
        CompareMode::Lt => ord.is_lt(),
        CompareMode::Le => ord.is_le(),
        CompareMode::Gt => ord.is_gt(),
        CompareMode::Ge => ord.is_ge(),
    })))
}

fn str_get_item(obj: &ObjRef, index: &ObjRef) -> OpResult {
    let s = str_value(obj);
    let idx = integer::expect_int(index, "string index")?;
    let len = s.chars().count();

    let Some(idx) = normalize_index(idx, len) else {
        return Err(error::value_error(format!(
            "string index '{idx}' out of range"
        )));
    };

    let ch = s.chars().nth(idx).expect("index bounds already checked");
    Ok(string(ch.to_string()))
}

fn str_get_slice(obj: &ObjRef, bounds: &ObjRef) -> OpResult {
    let s = str_value(obj);
    let len = s.chars().count();
    let (start, stop) = Bounds::clamp(bounds, len)?;

    let out: String = s.chars().skip(start).take(stop.saturating_sub(start)).collect();
    Ok(string(out))
}

fn str_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    let needle = expect_str(item, "'in' on a string")?;
    Ok(str_value(obj).contains(needle))
}

/// Resolve a possibly negative index against `len`.
pub fn normalize_index(idx: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if idx < 0 { idx + len } else { idx };

    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}
