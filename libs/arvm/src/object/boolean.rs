// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{CompareMode, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload};

pub static BOOL_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("bool");
    typ.truth = Some(|obj| matches!(obj.payload(), Payload::Bool(true)));
    typ.repr = Some(|obj| {
        Ok(match obj.payload() {
            Payload::Bool(true) => "true".to_string(),
            _ => "false".to_string(),
        })
    });
    typ.compare = Some(bool_compare);
    typ.hash = Some(|obj| {
        Ok(match obj.payload() {
            Payload::Bool(true) => 1,
            _ => 0,
        })
    });
    Arc::new(typ)
});

static TRUE: LazyLock<ObjRef> =
    LazyLock::new(|| Object::new(Arc::clone(&BOOL_TYPE), Payload::Bool(true)));
static FALSE: LazyLock<ObjRef> =
    LazyLock::new(|| Object::new(Arc::clone(&BOOL_TYPE), Payload::Bool(false)));

/// The `true`/`false` singletons.
pub fn boolean(value: bool) -> ObjRef {
    if value {
        Arc::clone(&TRUE)
    } else {
        Arc::clone(&FALSE)
    }
}

pub fn bool_value(obj: &ObjRef) -> bool {
    matches!(obj.payload(), Payload::Bool(true))
}

fn bool_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let (Payload::Bool(a), Payload::Bool(b)) = (a.payload(), b.payload()) else {
        return None;
    };

    match mode {
        CompareMode::Eq => Some(Ok(boolean(a == b))),
        CompareMode::Ne => Some(Ok(boolean(a != b))),
        _ => None,
    }
}
