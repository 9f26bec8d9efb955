// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Immutable sequences.

use std::sync::{Arc, LazyLock};

use crate::object::bounds::Bounds;
use crate::object::typeinfo::{
    CompareMode, IterSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{
    self, ObjRef, Object, OpResult, Payload, boolean, error, integer, iterator,
};

static TUPLE_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: Some(tuple_get_item),
    set_item: None,
    get_slice: Some(tuple_get_slice),
    set_slice: None,
    item_in: Some(tuple_item_in),
};

static TUPLE_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static TUPLE_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("tuple");
    typ.truth = Some(|obj| !tuple_items(obj).is_empty());
    typ.repr = Some(tuple_repr);
    typ.compare = Some(tuple_compare);
    typ.hash = Some(tuple_hash);
    typ.subscript = Some(&TUPLE_SUBSCRIPT);
    typ.iter = Some(&TUPLE_ITER);
    Arc::new(typ)
});

pub fn tuple(items: Vec<ObjRef>) -> ObjRef {
    Object::new(Arc::clone(&TUPLE_TYPE), Payload::Tuple(items.into()))
}

pub fn tuple_items(obj: &ObjRef) -> &[ObjRef] {
    match obj.payload() {
        Payload::Tuple(items) => items,
        _ => &[],
    }
}

pub fn tuple_get(obj: &ObjRef, index: usize) -> Option<ObjRef> {
    tuple_items(obj).get(index).cloned()
}

fn tuple_get_item(obj: &ObjRef, index: &ObjRef) -> OpResult {
    let items = tuple_items(obj);
    let idx = integer::expect_int(index, "tuple index")?;

    crate::object::string::normalize_index(idx, items.len())
        .map(|i| Arc::clone(&items[i]))
        .ok_or_else(|| error::value_error(format!("tuple index '{idx}' out of range")))
}

fn tuple_get_slice(obj: &ObjRef, bounds: &ObjRef) -> OpResult {
    let items = tuple_items(obj);
    let (start, stop) = Bounds::clamp(bounds, items.len())?;
    Ok(tuple(items[start..stop].to_vec()))
}

fn tuple_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    for candidate in tuple_items(obj) {
        if object::equal(candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tuple_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Tuple(lhs), Payload::Tuple(rhs)) = (a.payload(), b.payload()) else {
        return None;
    };

    if !matches!(mode, CompareMode::Eq | CompareMode::Ne) {
        return None;
    }

    let mut eq = lhs.len() == rhs.len();
    if eq {
        for (x, y) in lhs.iter().zip(rhs.iter()) {
            match object::equal(x, y) {
                Ok(true) => {}
                Ok(false) => {
                    eq = false;
                    break;
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    Some(Ok(boolean::boolean(match mode {
        CompareMode::Ne => !eq,
        _ => eq,
    })))
}

fn tuple_hash(obj: &ObjRef) -> OpResult<u64> {
    let mut hash = 0x811c_9dc5_u64;
    for item in tuple_items(obj) {
        hash = (hash ^ object::obj_hash(item)?).wrapping_mul(0x0100_0000_01b3);
    }
    Ok(hash)
}

fn tuple_repr(obj: &ObjRef) -> OpResult<String> {
    let mut out = String::from("(");
    for (i, item) in tuple_items(obj).iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&object::repr(item)?);
    }
    out.push(')');
    Ok(out)
}
