// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interned symbols.
//!
//! Atoms are process-wide unique: interning the same spelling twice yields
//! the same object, so identity comparison is enough. Error kinds are atoms.

use std::sync::{Arc, LazyLock, Mutex};

use hashbrown::HashMap;

use crate::object::typeinfo::{CompareMode, TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, boolean};

pub static ATOM_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("atom");
    typ.compare = Some(atom_compare);
    typ.hash = Some(atom_hash);
    typ.repr = Some(atom_repr);
    Arc::new(typ)
});

static INTERNED: LazyLock<Mutex<HashMap<String, ObjRef>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Intern `name`, returning the process-wide unique atom object for it.
pub fn atom(name: &str) -> ObjRef {
    let mut interned = INTERNED.lock().unwrap();

    if let Some(existing) = interned.get(name) {
        return Arc::clone(existing);
    }

    let obj = Object::new(Arc::clone(&ATOM_TYPE), Payload::Atom(name.into()));
    interned.insert(name.to_string(), Arc::clone(&obj));
    obj
}

pub fn atom_str(obj: &ObjRef) -> &str {
    match obj.payload() {
        Payload::Atom(s) => s,
        _ => "",
    }
}

/// Whether `obj` is the atom spelled `name`.
pub fn atom_is(obj: &ObjRef, name: &str) -> bool {
    matches!(obj.payload(), Payload::Atom(s) if &**s == name)
}

fn atom_compare(a: &ObjRef, b: &ObjRef, mode: CompareMode) -> Option<OpResult> {
    let Payload::Atom(_) = b.payload() else {
        return None;
    };

    // interning makes identity authoritative
    let eq = Arc::ptr_eq(a, b);
    match mode {
        CompareMode::Eq => Some(Ok(boolean::boolean(eq))),
        CompareMode::Ne => Some(Ok(boolean::boolean(!eq))),
        _ => None,
    }
}

fn atom_hash(obj: &ObjRef) -> OpResult<u64> {
    Ok(crate::object::string::str_hash(atom_str(obj)))
}

fn atom_repr(obj: &ObjRef) -> OpResult<String> {
    Ok(format!("@{}", atom_str(obj)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity() {
        let a = atom("TypeError");
        let b = atom("TypeError");
        let c = atom("ValueError");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(atom_str(&a), "TypeError");
    }
}
