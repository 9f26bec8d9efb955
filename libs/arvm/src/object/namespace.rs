// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Namespaces.
//!
//! A namespace maps names to values with per-entry attribute flags. It backs
//! module globals, type attribute tables and instance fields. The protocol
//! the engine relies on is small: `lookup`, `new_symbol`, `set` (which fails
//! on `CONST` entries) and the public-merge used by `IMPALL`.
//!
//! Declaration order is preserved; positional struct construction assigns
//! fields in the order they were declared.

use std::sync::Mutex;

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::object::{ObjRef, OpResult, error};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributeFlags: u16 {
        /// Visible outside the defining module or type.
        const PUBLIC = 1 << 0;
        /// Assignment after declaration is an error.
        const CONST = 1 << 1;
        /// Entry lives on the type, not on instances.
        const STATIC = 1 << 2;
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: ObjRef,
    flags: AttributeFlags,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Namespace {
    inner: Mutex<Inner>,
}

// === impl Namespace ===

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a name up, returning the value and its flags.
    pub fn lookup(&self, key: &str) -> Option<(ObjRef, AttributeFlags)> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|e| (e.value.clone(), e.flags))
    }

    pub fn contains(&self, key: &str) -> Option<AttributeFlags> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|e| e.flags)
    }

    /// Declare a new symbol, replacing any previous declaration.
    pub fn new_symbol(&self, key: &str, value: ObjRef, flags: AttributeFlags) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.entries.contains_key(key) {
            inner.order.push(key.to_string());
        }
        inner.entries.insert(key.to_string(), Entry { value, flags });
    }

    /// Update an existing entry.
    ///
    /// # Errors
    ///
    /// `UndeclaredError` when the name does not exist, `UnassignableError`
    /// when it was declared `CONST`.
    pub fn set(&self, key: &str, value: ObjRef) -> OpResult<()> {
        let mut inner = self.inner.lock().unwrap();

        let Some(entry) = inner.entries.get_mut(key) else {
            return Err(error::undeclared_error(key));
        };

        if entry.flags.contains(AttributeFlags::CONST) {
            return Err(error::unassignable_error(key));
        }

        entry.value = value;
        Ok(())
    }

    /// Copy every `PUBLIC` entry of `other` into `self`. Used by `IMPALL`.
    pub fn merge_public(&self, other: &Namespace) {
        if std::ptr::eq(self, other) {
            return;
        }

        let entries: Vec<(String, Entry)> = {
            let from = other.inner.lock().unwrap();
            from.order
                .iter()
                .filter_map(|key| {
                    let entry = from.entries.get(key)?;
                    entry
                        .flags
                        .contains(AttributeFlags::PUBLIC)
                        .then(|| (key.clone(), entry.clone()))
                })
                .collect()
        };

        for (key, entry) in entries {
            self.new_symbol(&key, entry.value, entry.flags);
        }
    }

    /// Entries in declaration order.
    pub fn ordered(&self) -> Vec<(String, ObjRef, AttributeFlags)> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|key| {
                let entry = inner.entries.get(key)?;
                Some((key.clone(), entry.value.clone(), entry.flags))
            })
            .collect()
    }

    /// Snapshot of all names, in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::integer::integer;

    #[test]
    fn set_respects_const() {
        let ns = Namespace::new();
        ns.new_symbol("x", integer(1), AttributeFlags::CONST);

        let err = ns.set("x", integer(2)).unwrap_err();
        assert!(error::error_is(&err, error::KIND_UNASSIGNABLE));
    }

    #[test]
    fn set_requires_declaration() {
        let ns = Namespace::new();
        let err = ns.set("missing", integer(1)).unwrap_err();
        assert!(error::error_is(&err, error::KIND_UNDECLARED));
    }

    #[test]
    fn merge_public_skips_private() {
        let a = Namespace::new();
        let b = Namespace::new();

        b.new_symbol("pub", integer(1), AttributeFlags::PUBLIC);
        b.new_symbol("priv", integer(2), AttributeFlags::empty());

        a.merge_public(&b);

        assert!(a.lookup("pub").is_some());
        assert!(a.lookup("priv").is_none());
    }

    #[test]
    fn declaration_order_is_preserved() {
        let ns = Namespace::new();
        ns.new_symbol("b", integer(1), AttributeFlags::empty());
        ns.new_symbol("a", integer(2), AttributeFlags::empty());
        ns.new_symbol("c", integer(3), AttributeFlags::empty());

        assert_eq!(ns.names(), vec!["b", "a", "c"]);
    }
}
