// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Module objects: a name plus a namespace of public symbols.

use std::sync::{Arc, LazyLock};

use crate::object::namespace::Namespace;
use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, Payload};

pub static MODULE_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("module");
    typ.repr = Some(|obj| {
        let Payload::Module(module) = obj.payload() else {
            unreachable!("module repr on non-module payload")
        };
        Ok(format!("<module '{}'>", module.name))
    });
    Arc::new(typ)
});

pub struct Module {
    pub name: String,
    pub ns: Arc<Namespace>,
}

pub fn module_new(name: impl Into<String>, ns: Arc<Namespace>) -> ObjRef {
    Object::new(
        Arc::clone(&MODULE_TYPE),
        Payload::Module(Module {
            name: name.into(),
            ns,
        }),
    )
}

pub fn as_module(obj: &ObjRef) -> Option<&Module> {
    match obj.payload() {
        Payload::Module(module) => Some(module),
        _ => None,
    }
}
