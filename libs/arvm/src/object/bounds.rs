// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slice bounds built by `MKBND`.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, error, integer, nil};

pub static BOUNDS_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("bounds");
    typ.repr = Some(|obj| {
        let Payload::Bounds(b) = obj.payload() else {
            unreachable!("bounds repr on non-bounds payload")
        };
        Ok(format!("{:?}..{:?}", b.start, b.stop))
    });
    Arc::new(typ)
});

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    /// `None` stands for "from the beginning".
    pub start: Option<i64>,
    /// `None` stands for "to the end".
    pub stop: Option<i64>,
}

// === impl Bounds ===

impl Bounds {
    /// Build a bounds object from the start/stop slots; `nil` marks an open
    /// end.
    pub fn new(start: &ObjRef, stop: &ObjRef) -> OpResult {
        Ok(Object::new(
            Arc::clone(&BOUNDS_TYPE),
            Payload::Bounds(Self {
                start: Self::end(start, "slice start")?,
                stop: Self::end(stop, "slice stop")?,
            }),
        ))
    }

    fn end(obj: &ObjRef, what: &str) -> OpResult<Option<i64>> {
        if nil::is_nil(obj) {
            return Ok(None);
        }
        integer::expect_int(obj, what).map(Some)
    }

    /// Resolve against a sequence of `len` items, clamping out-of-range ends
    /// the way slicing conventionally does.
    pub fn clamp(bounds: &ObjRef, len: usize) -> OpResult<(usize, usize)> {
        let Payload::Bounds(b) = bounds.payload() else {
            return Err(error::type_error(format!(
                "expected 'bounds', got '{}'",
                bounds.type_name()
            )));
        };

        let ilen = i64::try_from(len).unwrap_or(i64::MAX);
        let resolve = |end: Option<i64>, default: i64| -> usize {
            let v = end.unwrap_or(default);
            let v = if v < 0 { v + ilen } else { v };
            usize::try_from(v.clamp(0, ilen)).unwrap_or(0)
        };

        let start = resolve(b.start, 0);
        let stop = resolve(b.stop, ilen);
        Ok((start, stop.max(start)))
    }
}
