// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{CompareMode, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, boolean};

pub static NIL_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("nil");
    typ.truth = Some(|_| false);
    typ.repr = Some(|_| Ok("nil".to_string()));
    typ.compare = Some(nil_compare);
    typ.hash = Some(|_| Ok(0));
    Arc::new(typ)
});

static NIL: LazyLock<ObjRef> =
    LazyLock::new(|| Object::new(Arc::clone(&NIL_TYPE), Payload::Nil));

/// The `nil` singleton.
pub fn nil() -> ObjRef {
    Arc::clone(&NIL)
}

pub fn is_nil(obj: &ObjRef) -> bool {
    matches!(obj.payload(), Payload::Nil)
}

fn nil_compare(_: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let eq = matches!(b.payload(), Payload::Nil);
    match mode {
        CompareMode::Eq => Some(Ok(boolean::boolean(eq))),
        CompareMode::Ne => Some(Ok(boolean::boolean(!eq))),
        _ => None,
    }
}
