// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Growable sequences.
//!
//! `+=` appends in place and returns the receiver unchanged, which is what
//! lets the engine skip the store instruction that follows `IPADD`.

use std::sync::{Arc, LazyLock, Mutex};

use crate::object::bounds::Bounds;
use crate::object::typeinfo::{
    CompareMode, IterSlots, OpSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{
    self, ObjRef, Object, OpResult, Payload, boolean, error, integer, iterator,
};

static LIST_OPS: LazyLock<OpSlots> = LazyLock::new(|| OpSlots {
    add: Some(list_concat),
    inp_add: Some(list_inplace_extend),
    ..OpSlots::default()
});

static LIST_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: Some(list_get_item),
    set_item: Some(list_set_item),
    get_slice: Some(list_get_slice),
    set_slice: None,
    item_in: Some(list_item_in),
};

static LIST_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static LIST_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("list");
    typ.truth = Some(|obj| list_len(obj) != 0);
    typ.repr = Some(list_repr);
    typ.compare = Some(list_compare);
    typ.ops = Some(LazyLock::force(&LIST_OPS));
    typ.subscript = Some(&LIST_SUBSCRIPT);
    typ.iter = Some(&LIST_ITER);
    Arc::new(typ)
});

pub fn list(items: Vec<ObjRef>) -> ObjRef {
    Object::new(Arc::clone(&LIST_TYPE), Payload::List(Mutex::new(items)))
}

pub fn list_len(obj: &ObjRef) -> usize {
    with_items(obj, <[ObjRef]>::len)
}

pub fn with_items<R>(obj: &ObjRef, f: impl FnOnce(&[ObjRef]) -> R) -> R {
    match obj.payload() {
        Payload::List(lock) => f(&lock.lock().unwrap()),
        _ => f(&[]),
    }
}

pub fn list_get(obj: &ObjRef, index: usize) -> Option<ObjRef> {
    with_items(obj, |items| items.get(index).cloned())
}

pub fn list_push(obj: &ObjRef, item: ObjRef) {
    if let Payload::List(lock) = obj.payload() {
        lock.lock().unwrap().push(item);
    }
}

pub fn list_set(obj: &ObjRef, index: usize, item: ObjRef) {
    if let Payload::List(lock) = obj.payload() {
        let mut items = lock.lock().unwrap();
        if index < items.len() {
            items[index] = item;
        } else {
            // closure construction stores captures past the current length
            items.resize(index, crate::object::nil::nil());
            items.push(item);
        }
    }
}

/// Append every item of `iterable` to the list.
pub fn list_extend(obj: &ObjRef, iterable: &ObjRef) -> OpResult<()> {
    // extending a list with itself iterates a snapshot, not the live tail
    if Arc::ptr_eq(obj, iterable) {
        for item in list_snapshot(iterable) {
            list_push(obj, item);
        }
        return Ok(());
    }

    let iter = object::iter_get(iterable, false)?;
    while let Some(item) = object::iter_next(&iter)? {
        list_push(obj, item);
    }
    Ok(())
}

pub fn list_snapshot(obj: &ObjRef) -> Vec<ObjRef> {
    with_items(obj, <[ObjRef]>::to_vec)
}

fn list_concat(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let (Payload::List(_), Payload::List(_)) = (a.payload(), b.payload()) else {
        return None;
    };

    let mut out = list_snapshot(a);
    if Arc::ptr_eq(a, b) {
        out.extend(out.clone());
    } else {
        with_items(b, |items| out.extend_from_slice(items));
    }
    Some(Ok(list(out)))
}

/// In-place `+=`: mutates the receiver and returns it, signalling the engine
/// to skip the following store.
fn list_inplace_extend(a: &ObjRef, b: &ObjRef) -> Option<OpResult> {
    let Payload::List(_) = a.payload() else {
        return None;
    };

    match list_extend(a, b) {
        Ok(()) => Some(Ok(Arc::clone(a))),
        Err(err) => Some(Err(err)),
    }
}

fn list_get_item(obj: &ObjRef, index: &ObjRef) -> OpResult {
    let idx = integer::expect_int(index, "list index")?;

    with_items(obj, |items| {
        crate::object::string::normalize_index(idx, items.len())
            .map(|i| Arc::clone(&items[i]))
            .ok_or_else(|| error::value_error(format!("list index '{idx}' out of range")))
    })
}

fn list_set_item(obj: &ObjRef, index: &ObjRef, value: &ObjRef) -> OpResult<()> {
    let idx = integer::expect_int(index, "list index")?;

    let Payload::List(lock) = obj.payload() else {
        return Err(error::type_error("not a list".to_string()));
    };

    let mut items = lock.lock().unwrap();
    let Some(i) = crate::object::string::normalize_index(idx, items.len()) else {
        return Err(error::value_error(format!("list index '{idx}' out of range")));
    };

    items[i] = Arc::clone(value);
    Ok(())
}

fn list_get_slice(obj: &ObjRef, bounds: &ObjRef) -> OpResult {
    with_items(obj, |items| {
        let (start, stop) = Bounds::clamp(bounds, items.len())?;
        Ok(list(items[start..stop].to_vec()))
    })
}

fn list_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    let snapshot = list_snapshot(obj);
    for candidate in &snapshot {
        if object::equal(candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn list_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::List(_), Payload::List(_)) = (a.payload(), b.payload()) else {
        return None;
    };

    if !matches!(mode, CompareMode::Eq | CompareMode::Ne) {
        return None;
    }

    let lhs = list_snapshot(a);
    let rhs = list_snapshot(b);

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

fn list_repr(obj: &ObjRef) -> OpResult<String> {
    let snapshot = list_snapshot(obj);
    let mut out = String::from("[");
    for (i, item) in snapshot.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&object::repr(item)?);
    }
    out.push(']');
    Ok(out)
}
