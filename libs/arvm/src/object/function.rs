// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Function objects.
//!
//! A function wraps either a code object or a native entry point, plus the
//! metadata the call machinery needs: arity, flags, default values, curried
//! arguments from partial application and the enclosed list captured at
//! `MKFN` time.

use std::sync::{Arc, LazyLock};

use bitflags::bitflags;

use crate::object::code::Code;
use crate::object::namespace::Namespace;
use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, Payload};
use crate::vm::native::NativeFn;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u8 {
        const METHOD = 1 << 0;
        const VARIADIC = 1 << 1;
        const KWARGS = 1 << 2;
        const GENERATOR = 1 << 3;
        const ASYNC = 1 << 4;
        const STATIC = 1 << 5;
        const CLOSURE = 1 << 6;
        const HAVE_DEFAULTS = 1 << 7;
    }
}

pub static FUNCTION_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("function");
    typ.repr = Some(|obj| {
        let Payload::Function(func) = obj.payload() else {
            unreachable!("function repr on non-function payload")
        };
        Ok(format!("<function {}/{}>", func.qname, func.arity))
    });
    Arc::new(typ)
});

pub struct Function {
    /// Bytecode body; absent for natives.
    pub code: Option<Arc<Code>>,
    /// Native entry point; absent for bytecode functions.
    pub native: Option<NativeFn>,
    pub qname: String,
    /// Declared positional parameter count.
    pub arity: usize,
    pub flags: FunctionFlags,
    /// Arguments captured by partial application, applied before the call's
    /// own positionals.
    pub currying: Vec<ObjRef>,
    /// Default values for trailing parameters.
    pub defaults: Vec<ObjRef>,
    /// Enclosed list captured at construction (a list object).
    pub enclosed: Option<ObjRef>,
    /// Owning type for methods, used for attribute visibility.
    pub base: Option<TypeHandle>,
    /// Globals namespace the body executes against.
    pub globals: Arc<Namespace>,
}

// === impl Function ===

impl Function {
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(FunctionFlags::GENERATOR)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(FunctionFlags::ASYNC)
    }

    pub fn is_variadic(&self) -> bool {
        self.flags.contains(FunctionFlags::VARIADIC)
    }

    pub fn is_kwargs(&self) -> bool {
        self.flags.contains(FunctionFlags::KWARGS)
    }

    pub fn have_defaults(&self) -> bool {
        self.flags.contains(FunctionFlags::HAVE_DEFAULTS)
    }

    pub fn into_object(self) -> ObjRef {
        Object::new(Arc::clone(&FUNCTION_TYPE), Payload::Function(self))
    }
}

/// Build a bytecode function.
pub fn function_new(
    code: Arc<Code>,
    qname: impl Into<String>,
    arity: usize,
    flags: FunctionFlags,
    defaults: Vec<ObjRef>,
    enclosed: Option<ObjRef>,
    base: Option<TypeHandle>,
    globals: Arc<Namespace>,
) -> ObjRef {
    Function {
        code: Some(code),
        native: None,
        qname: qname.into(),
        arity,
        flags,
        currying: Vec::new(),
        defaults,
        enclosed,
        base,
        globals,
    }
    .into_object()
}

/// Build a native function.
pub fn native_new(
    qname: impl Into<String>,
    arity: usize,
    flags: FunctionFlags,
    native: NativeFn,
    globals: Arc<Namespace>,
) -> ObjRef {
    Function {
        code: None,
        native: Some(native),
        qname: qname.into(),
        arity,
        flags,
        currying: Vec::new(),
        defaults: Vec::new(),
        enclosed: None,
        base: None,
        globals,
    }
    .into_object()
}

/// Partial application: a copy of `func` with `args` appended to the curried
/// argument vector.
pub fn curry(func: &Function, args: &[ObjRef]) -> ObjRef {
    let mut currying = func.currying.clone();
    currying.extend(args.iter().cloned());

    Function {
        code: func.code.clone(),
        native: func.native,
        qname: func.qname.clone(),
        arity: func.arity,
        flags: func.flags,
        currying,
        defaults: func.defaults.clone(),
        enclosed: func.enclosed.clone(),
        base: func.base.clone(),
        globals: Arc::clone(&func.globals),
    }
    .into_object()
}

/// View an object as a function payload.
pub fn as_function(obj: &ObjRef) -> Option<&Function> {
    match obj.payload() {
        Payload::Function(func) => Some(func),
        _ => None,
    }
}
