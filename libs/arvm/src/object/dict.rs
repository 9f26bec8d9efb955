// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hash maps keyed by hashable objects.
//!
//! A [`DictKey`] carries the key object together with its precomputed hash.
//! Key equality has to be total inside the hash table, so it is restricted
//! to the structurally comparable payloads; anything else is rejected with
//! `UnhashableError` before it ever becomes a key.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};

use hashbrown::HashMap;

use crate::object::typeinfo::{
    CompareMode, IterSlots, SubscriptSlots, TypeHandle, TypeInfo,
};
use crate::object::{
    self, ObjRef, Object, OpResult, Payload, boolean, error, iterator,
};

pub type DictMap = HashMap<DictKey, ObjRef>;

static DICT_SUBSCRIPT: SubscriptSlots = SubscriptSlots {
    get_item: Some(dict_get_item),
    set_item: Some(dict_set_item),
    get_slice: None,
    set_slice: None,
    item_in: Some(dict_item_in),
};

static DICT_ITER: IterSlots = IterSlots {
    iter: |obj, reversed| Ok(iterator::iterator_new(Arc::clone(obj), reversed)),
    next: None,
};

pub static DICT_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("dict");
    typ.truth = Some(|obj| dict_len(obj) != 0);
    typ.repr = Some(dict_repr);
    typ.compare = Some(dict_compare);
    typ.subscript = Some(&DICT_SUBSCRIPT);
    typ.iter = Some(&DICT_ITER);
    Arc::new(typ)
});

/// A dict/set key: the key object plus its hash.
#[derive(Clone)]
pub struct DictKey {
    hash: u64,
    pub obj: ObjRef,
}

// === impl DictKey ===

impl DictKey {
    /// Wrap `obj` as a key, failing with `UnhashableError` when its type has
    /// no hash slot.
    pub fn new(obj: ObjRef) -> OpResult<Self> {
        let hash = object::obj_hash(&obj)?;
        Ok(Self { hash, obj })
    }
}

impl Hash for DictKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for DictKey {
    fn eq(&self, other: &Self) -> bool {
        raw_key_eq(&self.obj, &other.obj)
    }
}

impl Eq for DictKey {}

/// Total structural equality over hashable payloads.
#[expect(clippy::cast_precision_loss, reason = "mixed-type numeric keys")]
#[expect(clippy::float_cmp, reason = "key equality is exact")]
fn raw_key_eq(a: &ObjRef, b: &ObjRef) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }

    match (a.payload(), b.payload()) {
        (Payload::Int(x), Payload::Int(y)) => x == y,
        (Payload::Float(x), Payload::Float(y)) => x == y,
        (Payload::Int(x), Payload::Float(y)) | (Payload::Float(y), Payload::Int(x)) => {
            *x as f64 == *y
        }
        (Payload::Bool(x), Payload::Bool(y)) => x == y,
        (Payload::Str(x), Payload::Str(y)) => x == y,
        (Payload::Nil, Payload::Nil) => true,
        // atoms are interned, identity above already decided
        (Payload::Atom(_), Payload::Atom(_)) => false,
        (Payload::Tuple(x), Payload::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(i, j)| raw_key_eq(i, j))
        }
        _ => false,
    }
}

pub fn dict_new() -> ObjRef {
    Object::new(Arc::clone(&DICT_TYPE), Payload::Dict(Mutex::new(HashMap::new())))
}

pub fn dict_len(obj: &ObjRef) -> usize {
    match obj.payload() {
        Payload::Dict(lock) => lock.lock().unwrap().len(),
        _ => 0,
    }
}

pub fn dict_insert(obj: &ObjRef, key: ObjRef, value: ObjRef) -> OpResult<()> {
    let Payload::Dict(lock) = obj.payload() else {
        return Err(error::type_error("not a dict".to_string()));
    };

    let key = DictKey::new(key)?;
    lock.lock().unwrap().insert(key, value);
    Ok(())
}

pub fn dict_get(obj: &ObjRef, key: &ObjRef) -> OpResult<Option<ObjRef>> {
    let Payload::Dict(lock) = obj.payload() else {
        return Err(error::type_error("not a dict".to_string()));
    };

    let key = DictKey::new(Arc::clone(key))?;
    Ok(lock.lock().unwrap().get(&key).cloned())
}

pub fn dict_keys(obj: &ObjRef) -> Vec<ObjRef> {
    match obj.payload() {
        Payload::Dict(lock) => lock
            .lock()
            .unwrap()
            .keys()
            .map(|k| Arc::clone(&k.obj))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn dict_entries(obj: &ObjRef) -> Vec<(ObjRef, ObjRef)> {
    match obj.payload() {
        Payload::Dict(lock) => lock
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (Arc::clone(&k.obj), Arc::clone(v)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Merge `other` into `target`. With `strict` set, a duplicate key is a
/// `ValueError`.
pub fn dict_merge(target: &ObjRef, other: &ObjRef, strict: bool) -> OpResult<()> {
    for (key, value) in dict_entries(other) {
        if strict && dict_get(target, &key)?.is_some() {
            return Err(error::value_error(format!(
                "duplicate key '{}' in dict merge",
                object::repr(&key)?
            )));
        }
        dict_insert(target, key, value)?;
    }
    Ok(())
}

fn dict_get_item(obj: &ObjRef, index: &ObjRef) -> OpResult {
    dict_get(obj, index)?
        .ok_or_else(|| match object::repr(index) {
            Ok(repr) => error::key_error(&repr),
            Err(err) => err,
        })
}

fn dict_set_item(obj: &ObjRef, index: &ObjRef, value: &ObjRef) -> OpResult<()> {
    dict_insert(obj, Arc::clone(index), Arc::clone(value))
}

fn dict_item_in(obj: &ObjRef, item: &ObjRef) -> OpResult<bool> {
    Ok(dict_get(obj, item)?.is_some())
}

fn dict_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Dict(_), Payload::Dict(_)) = (a.payload(), b.payload()) else {
        return None;
    };

    if !matches!(mode, CompareMode::Eq | CompareMode::Ne) {
        return None;
    }

    let mut eq = dict_len(a) == dict_len(b);
    if eq {
        for (key, value) in dict_entries(a) {
            match dict_get(b, &key) {
                Ok(Some(other)) => match object::equal(&value, &other) {
                    Ok(true) => {}
                    Ok(false) => {
                        eq = false;
                        break;
                    }
                    Err(err) => return Some(Err(err)),
                },
                Ok(None) => {
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

fn dict_repr(obj: &ObjRef) -> OpResult<String> {
    let mut out = String::from("{");
    for (i, (key, value)) in dict_entries(obj).iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&object::repr(key)?);
        out.push_str(": ");
        out.push_str(&object::repr(value)?);
    }
    out.push('}');
    Ok(out)
}
