// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sequence iterators.
//!
//! One iterator type serves every built-in container. Indexable sources
//! (str, bytes, tuple, list) are walked live by position; hashed containers
//! (dict, set) are snapshotted at creation so concurrent mutation cannot
//! skew the walk.

use std::sync::{Arc, LazyLock, Mutex};

use crate::object::typeinfo::{IterSlots, TypeHandle, TypeInfo};
use crate::object::{
    ObjRef, Object, OpResult, Payload, bytes, dict, integer, list, set, string, tuple,
};

static ITER_SLOTS: IterSlots = IterSlots {
    // an iterator iterates itself
    iter: |obj, _| Ok(Arc::clone(obj)),
    next: Some(iterator_next),
};

pub static ITER_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("iterator");
    typ.iter = Some(&ITER_SLOTS);
    Arc::new(typ)
});

pub struct IterState {
    source: IterSource,
    cursor: usize,
    reversed: bool,
}

enum IterSource {
    /// Indexed live through the source object.
    Indexed(ObjRef),
    /// Items snapshotted at iterator creation.
    Snapshot(Vec<ObjRef>),
}

/// Build an iterator over any built-in container.
pub fn iterator_new(source: ObjRef, reversed: bool) -> ObjRef {
    let source = match source.payload() {
        Payload::Dict(_) => IterSource::Snapshot(dict::dict_keys(&source)),
        Payload::Set(_) => IterSource::Snapshot(set::set_items(&source)),
        _ => IterSource::Indexed(source),
    };

    Object::new(
        Arc::clone(&ITER_TYPE),
        Payload::Iter(Mutex::new(IterState {
            source,
            cursor: 0,
            reversed,
        })),
    )
}

fn iterator_next(obj: &ObjRef) -> OpResult<Option<ObjRef>> {
    let Payload::Iter(lock) = obj.payload() else {
        return Ok(None);
    };

    let mut state = lock.lock().unwrap();

    let len = match &state.source {
        IterSource::Indexed(src) => indexed_len(src),
        IterSource::Snapshot(items) => items.len(),
    };

    if state.cursor >= len {
        return Ok(None);
    }

    let index = if state.reversed {
        len - 1 - state.cursor
    } else {
        state.cursor
    };
    state.cursor += 1;

    let item = match &state.source {
        IterSource::Snapshot(items) => Some(Arc::clone(&items[index])),
        IterSource::Indexed(src) => indexed_get(src, index),
    };

    Ok(item)
}

fn indexed_len(src: &ObjRef) -> usize {
    match src.payload() {
        Payload::Str(s) => s.chars().count(),
        Payload::Bytes(_) => bytes::bytes_len(src),
        Payload::Tuple(items) => items.len(),
        Payload::List(_) => list::list_len(src),
        _ => 0,
    }
}

fn indexed_get(src: &ObjRef, index: usize) -> Option<ObjRef> {
    match src.payload() {
        Payload::Str(s) => s.chars().nth(index).map(|c| string::string(c.to_string())),
        Payload::Bytes(_) => bytes::with_bytes(src, |data| {
            data.get(index).map(|b| integer::integer(i64::from(*b)))
        }),
        Payload::Tuple(items) => items.get(index).cloned(),
        Payload::List(_) => list::list_get(src, index),
        _ => None,
    }
}
