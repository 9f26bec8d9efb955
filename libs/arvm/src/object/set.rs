// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hash sets over hashable objects.

use std::sync::{Arc, LazyLock, Mutex};

use hashbrown::HashSet;

use crate::object::dict::DictKey;
use crate::object::typeinfo::{
    CompareMode, IterSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{self, ObjRef, Object, OpResult, Payload, boolean, error, iterator};

pub type SetMap = HashSet<DictKey>;

static SET_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: None,
    set_item: None,
    get_slice: None,
    set_slice: None,
    item_in: Some(set_item_in),
};

static SET_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static SET_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("set");
    typ.truth = Some(|obj| set_len(obj) != 0);
    typ.repr = Some(set_repr);
    typ.compare = Some(set_compare);
    typ.subscript = Some(&SET_SUBSCRIPT);
    typ.iter = Some(&SET_ITER);
    Arc::new(typ)
});

pub fn set_new() -> ObjRef {
    Object::new(Arc::clone(&SET_TYPE), Payload::Set(Mutex::new(HashSet::new())))
}

pub fn set_len(obj: &ObjRef) -> usize {
    match obj.payload() {
        Payload::Set(lock) => lock.lock().unwrap().len(),
        _ => 0,
    }
}

pub fn set_add(obj: &ObjRef, item: ObjRef) -> OpResult<()> {
    let Payload::Set(lock) = obj.payload() else {
        return Err(error::type_error("not a set".to_string()));
    };

    let key = DictKey::new(item)?;
    lock.lock().unwrap().insert(key);
    Ok(())
}

pub fn set_contains(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    let Payload::Set(lock) = obj.payload() else {
        return Err(error::type_error("not a set".to_string()));
    };

    let key = DictKey::new(Arc::clone(item))?;
    Ok(lock.lock().unwrap().contains(&key))
}

pub fn set_items(obj: &ObjRef) -> Vec<ObjRef> {
    match obj.payload() {
        Payload::Set(lock) => lock
            .lock()
            .unwrap()
            .iter()
            .map(|k| Arc::clone(&k.obj))
            .collect(),
        _ => Vec::new(),
    }
}

fn set_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    set_contains(obj, item)
}

fn set_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Set(_), Payload::Set(_)) = (a.payload(), b.payload()) else {
        return None;
    };

    if !matches!(mode, CompareMode::Eq | CompareMode::Ne) {
        return None;
    }

    let mut eq = set_len(a) == set_len(b);
    if eq {
        for item in set_items(a) {
            match set_contains(b, &item) {
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

fn set_repr(obj: &ObjRef) -> OpResult<String> {
    let mut out = String::from("{");
    for (i, item) in set_items(obj).iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&object::repr(item)?);
    }
    out.push('}');
    Ok(out)
}
