// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User-defined types and attribute access.
//!
//! `MKSTRUCT`/`MKTRAIT` finalize a type under construction: a fresh
//! descriptor whose namespace was populated by `TSTORE` and whose MRO is
//! C3-linearized from the declared traits. `INIT` builds instances.
//!
//! Attribute access for *every* object funnels through [`attr_load`],
//! [`attr_load_method`] and [`attr_set`]; visibility is enforced here. A
//! non-public attribute resolves only when the access comes from code whose
//! instance shares the defining type's MRO.

use std::sync::{Arc, LazyLock};

use crate::object::namespace::{AttributeFlags, Namespace};
use crate::object::typeinfo::{TypeFlags, TypeHandle, TypeInfo, c3_linearize};
use crate::object::{
    ObjRef, Object, OpResult, Payload, boolean, error, function, module, result,
};

pub static TYPE_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("type");
    typ.repr = Some(|obj| {
        let Payload::Type(t) = obj.payload() else {
            unreachable!("type repr on non-type payload")
        };
        Ok(format!("<type {}>", t.qname))
    });
    Arc::new(typ)
});

pub struct Instance {
    pub ns: Arc<Namespace>,
}

/// Finalize a user struct or trait type.
pub fn type_new(
    name: &str,
    qname: &str,
    ns: Arc<Namespace>,
    traits: Vec<TypeHandle>,
    flags: TypeFlags,
) -> OpResult {
    let mut info = TypeInfo::builtin("struct");
    info.name = if flags.contains(TypeFlags::TRAIT) {
        "trait"
    } else {
        "struct"
    };
    info.qname = qname.to_string();
    info.flags = flags;
    info.bases = traits;
    info.ns = Some(ns);

    let handle = Arc::new(info);

    if c3_linearize(&handle).is_none() {
        return Err(error::type_error(format!(
            "inconsistent trait hierarchy for '{name}'"
        )));
    }

    Ok(Object::new(Arc::clone(&TYPE_TYPE), Payload::Type(handle)))
}

pub fn as_type(obj: &ObjRef) -> Option<&TypeHandle> {
    match obj.payload() {
        Payload::Type(t) => Some(t),
        _ => None,
    }
}

/// Instance fields of a struct type, in declaration order: every non-static
/// non-function entry of the type namespace.
fn instance_fields(typ: &TypeHandle) -> Vec<(String, ObjRef, AttributeFlags)> {
    let Some(ns) = &typ.ns else {
        return Vec::new();
    };

    ns.ordered()
        .into_iter()
        .filter(|(_, value, flags)| {
            !flags.contains(AttributeFlags::STATIC)
                && !matches!(value.payload(), Payload::Function(_))
        })
        .collect()
}

/// Build an instance of `typ` from constructor arguments.
///
/// Positional mode assigns fields in declaration order; keyword mode takes
/// (name, value) pairs.
pub fn instance_new(typ: &TypeHandle, args: &[ObjRef], kw_init: bool) -> OpResult {
    if !typ.is_struct() {
        return Err(error::type_error(format!(
            "'{}' cannot be instantiated",
            typ.qname
        )));
    }

    let ns = Arc::new(Namespace::new());
    let fields = instance_fields(typ);

    // defaults from the type namespace first
    for (name, value, flags) in &fields {
        ns.new_symbol(name, Arc::clone(value), *flags);
    }

    if kw_init {
        if args.len() % 2 != 0 {
            return Err(error::type_error(
                "keyword initialization expects name/value pairs".to_string(),
            ));
        }

        for pair in args.chunks_exact(2) {
            let name = crate::object::string::expect_str(&pair[0], "field name")?;

            if !fields.iter().any(|(f, ..)| f == name) {
                return Err(error::undeclared_error(name));
            }

            ns.new_symbol(name, Arc::clone(&pair[1]), AttributeFlags::PUBLIC);
        }
    } else {
        if args.len() > fields.len() {
            return Err(error::type_error(format!(
                "'{}' takes at most {} field value(s), got {}",
                typ.qname,
                fields.len(),
                args.len()
            )));
        }

        for (arg, (name, _, flags)) in args.iter().zip(fields.iter()) {
            ns.new_symbol(name, Arc::clone(arg), *flags);
        }
    }

    Ok(Object::new(
        Arc::clone(typ),
        Payload::Instance(Instance { ns }),
    ))
}

/// The calling scope for visibility checks: the type whose code is
/// executing, if any.
pub type Scope<'a> = Option<&'a TypeHandle>;

fn check_visibility(
    defining: &TypeHandle,
    key: &str,
    flags: AttributeFlags,
    scope: Scope<'_>,
) -> OpResult<()> {
    if flags.contains(AttributeFlags::PUBLIC) {
        return Ok(());
    }

    let allowed = scope.is_some_and(|caller| caller.derives_from(defining));
    if allowed {
        Ok(())
    } else {
        Err(error::access_violation_error(format!(
            "access violation, attribute '{key}' of '{}' is private",
            defining.qname
        )))
    }
}

/// Look `key` up on the type and its MRO.
fn type_attr(typ: &TypeHandle, key: &str) -> Option<(ObjRef, AttributeFlags, TypeHandle)> {
    for candidate in typ.mro() {
        if let Some(ns) = &candidate.ns
            && let Some((value, flags)) = ns.lookup(key)
        {
            return Some((value, flags, Arc::clone(candidate)));
        }
    }
    None
}

/// Attribute load (`LDATTR` with `static_scope = false`, `LDSCOPE` with
/// `true`).
pub fn attr_load(obj: &ObjRef, key: &str, static_scope: bool, scope: Scope<'_>) -> OpResult {
    match obj.payload() {
        Payload::Module(m) => {
            let Some((value, flags)) = m.ns.lookup(key) else {
                return Err(error::undeclared_error(key));
            };

            if !flags.contains(AttributeFlags::PUBLIC) {
                return Err(error::access_violation_error(format!(
                    "access violation, '{key}' of module '{}' is private",
                    m.name
                )));
            }

            Ok(value)
        }
        Payload::Type(t) => {
            let Some((value, flags, defining)) = type_attr(t, key) else {
                return Err(no_attribute(obj, key));
            };

            check_visibility(&defining, key, flags, scope)?;
            Ok(value)
        }
        Payload::Instance(inst) if !static_scope => {
            if let Some((value, flags)) = inst.ns.lookup(key) {
                check_visibility(obj.typ(), key, flags, scope)?;
                return Ok(value);
            }

            let Some((value, flags, defining)) = type_attr(obj.typ(), key) else {
                return Err(no_attribute(obj, key));
            };

            check_visibility(&defining, key, flags, scope)?;
            Ok(value)
        }
        Payload::Instance(_) => {
            // scope access resolves only on the type
            let Some((value, flags, defining)) = type_attr(obj.typ(), key) else {
                return Err(no_attribute(obj, key));
            };

            check_visibility(&defining, key, flags, scope)?;
            Ok(value)
        }
        Payload::Error(e) => match key {
            "kind" => Ok(Arc::clone(&e.kind)),
            "message" => Ok(crate::object::string::string(e.message.clone())),
            _ => Err(no_attribute(obj, key)),
        },
        Payload::Result(r) => match key {
            "value" => Ok(result::result_value(obj)),
            "error" => Ok(result::result_error(obj)),
            "ok" => Ok(boolean::boolean(r.ok)),
            _ => Err(no_attribute(obj, key)),
        },
        _ => Err(no_attribute(obj, key)),
    }
}

/// Method lookup for `LDMETH`: resolves on the receiver's type first and
/// reports whether the result is a bindable method.
pub fn attr_load_method(obj: &ObjRef, key: &str, scope: Scope<'_>) -> OpResult<(ObjRef, bool)> {
    if let Some((value, flags, defining)) = type_attr(obj.typ(), key) {
        check_visibility(&defining, key, flags, scope)?;

        let is_method = function::as_function(&value)
            .is_some_and(|f| f.flags.contains(crate::object::function::FunctionFlags::METHOD));
        return Ok((value, is_method));
    }

    attr_load(obj, key, false, scope).map(|value| (value, false))
}

/// Attribute store (`STATTR`/`STSCOPE`).
pub fn attr_set(
    obj: &ObjRef,
    key: &str,
    value: &ObjRef,
    static_scope: bool,
    scope: Scope<'_>,
) -> OpResult<()> {
    match obj.payload() {
        Payload::Instance(inst) if !static_scope => {
            if let Some(flags) = inst.ns.contains(key) {
                check_visibility(obj.typ(), key, flags, scope)?;

                if flags.contains(AttributeFlags::CONST) {
                    return Err(error::unassignable_error(key));
                }

                return inst.ns.set(key, Arc::clone(value));
            }

            Err(no_attribute(obj, key))
        }
        Payload::Module(m) => {
            let Some(flags) = m.ns.contains(key) else {
                return Err(error::undeclared_error(key));
            };

            if !flags.contains(AttributeFlags::PUBLIC) {
                return Err(error::access_violation_error(format!(
                    "access violation, '{key}' of module '{}' is private",
                    m.name
                )));
            }

            m.ns.set(key, Arc::clone(value))
        }
        Payload::Type(t) => {
            let Some(ns) = &t.ns else {
                return Err(no_attribute(obj, key));
            };

            let Some(flags) = ns.contains(key) else {
                return Err(no_attribute(obj, key));
            };

            check_visibility(t, key, flags, scope)?;
            ns.set(key, Arc::clone(value))
        }
        _ => Err(error::type_error(format!(
            "'{}' does not support attribute assignment",
            obj.type_name()
        ))),
    }
}

fn no_attribute(obj: &ObjRef, key: &str) -> ObjRef {
    let onto = match obj.payload() {
        Payload::Type(t) => t.qname.clone(),
        _ => obj.type_name().to_string(),
    };

    error::type_error(format!("unknown attribute '{key}' of '{onto}'"))
}

/// `IMPFRM` helper: load a public attribute from a module object by statics
/// index key.
pub fn import_from(module_obj: &ObjRef, key: &str) -> OpResult {
    if module::as_module(module_obj).is_none() {
        return Err(error::type_error(format!(
            "expected 'module', got '{}'",
            module_obj.type_name()
        )));
    }

    attr_load(module_obj, key, false, None)
}

/// `type_of` builtin support.
pub fn type_of(obj: &ObjRef) -> ObjRef {
    Object::new(
        Arc::clone(&TYPE_TYPE),
        Payload::Type(Arc::clone(obj.typ())),
    )
}

/// Whether `obj` is an instance whose type derives from `typ`.
pub fn isinstance(obj: &ObjRef, typ: &TypeHandle) -> bool {
    Arc::ptr_eq(obj.typ(), typ) || obj.typ().derives_from(typ)
}
