// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Type descriptors.
//!
//! Every object carries a handle to a [`TypeInfo`], a *flat* table of
//! function slots the engine dispatches through. Any slot may be absent,
//! meaning the operation is unsupported for that type; operator dispatch
//! reports this with `None` so the engine can try the reflected operand
//! before raising a `TypeError`.
//!
//! User-defined types (structs and traits) share the same descriptor shape:
//! they have no function slots of their own but carry a namespace of
//! attributes and a C3-linearized MRO computed from their bases.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::object::namespace::Namespace;
use crate::object::{ObjRef, OpResult};

pub type TypeHandle = Arc<TypeInfo>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// Built-in base type.
        const BASE = 1 << 0;
        /// User-defined struct type.
        const STRUCT = 1 << 1;
        /// User-defined trait type.
        const TRAIT = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CompareMode {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareMode {
    pub fn from_arg(arg: u16) -> Option<Self> {
        match arg {
            0 => Some(Self::Eq),
            1 => Some(Self::Ne),
            2 => Some(Self::Lt),
            3 => Some(Self::Le),
            4 => Some(Self::Gt),
            5 => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Binary operator slot.
///
/// `None` means the slot holder cannot combine with this operand; the engine
/// then tries the other operand's slot before giving up. `Some(Err(..))` is a
/// panic in flight.
pub type BinaryOp = fn(&ObjRef, &ObjRef) -> Option<OpResult>;
pub type UnaryOp = fn(&ObjRef) -> OpResult;

/// Arithmetic, logic and shift slots.
#[derive(Default)]
pub struct OpSlots {
    pub add: Option<BinaryOp>,
    pub sub: Option<BinaryOp>,
    pub mul: Option<BinaryOp>,
    pub div: Option<BinaryOp>,
    pub idiv: Option<BinaryOp>,
    pub rem: Option<BinaryOp>,
    pub shl: Option<BinaryOp>,
    pub shr: Option<BinaryOp>,
    pub and: Option<BinaryOp>,
    pub or: Option<BinaryOp>,
    pub xor: Option<BinaryOp>,

    pub neg: Option<UnaryOp>,
    pub pos: Option<UnaryOp>,
    pub invert: Option<UnaryOp>,
    pub inc: Option<UnaryOp>,
    pub dec: Option<UnaryOp>,

    /// In-place variants. Returning the *same* object signals mutation in
    /// place, which makes the engine skip the following store instruction.
    pub inp_add: Option<BinaryOp>,
    pub inp_sub: Option<BinaryOp>,
}

/// Subscript access slots. A type implements any subset.
#[derive(Default)]
pub struct SubscriptSlots {
    pub get_item: Option<fn(&ObjRef, &ObjRef) -> OpResult>,
    pub set_item: Option<fn(&ObjRef, &ObjRef, &ObjRef) -> OpResult<()>>,
    pub get_slice: Option<fn(&ObjRef, &ObjRef) -> OpResult>,
    pub set_slice: Option<fn(&ObjRef, &ObjRef, &ObjRef) -> OpResult<()>>,
    pub item_in: Option<fn(&ObjRef, &ObjRef) -> OpResult<bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Read,
    Write,
}

/// Contiguous byte access.
///
/// Access is closure-scoped: the view is valid exactly for the duration of
/// the callback, which makes the mandatory release happen on every exit
/// path, panicking or not.
pub struct BufferSlots {
    pub read: fn(&ObjRef, &mut dyn FnMut(&[u8])) -> OpResult<()>,
    pub write: Option<fn(&ObjRef, &mut dyn FnMut(&mut Vec<u8>)) -> OpResult<()>>,
}

/// Iterator protocol slots.
pub struct IterSlots {
    /// Build an iterator over the object, optionally reversed.
    pub iter: fn(&ObjRef, bool) -> OpResult,
    /// Advance an iterator object. `Ok(None)` means exhausted.
    pub next: Option<fn(&ObjRef) -> OpResult<Option<ObjRef>>>,
}

pub struct TypeInfo {
    pub name: &'static str,
    /// Qualified name used in diagnostics. Owned because user types build it
    /// at runtime.
    pub qname: String,
    pub doc: &'static str,
    pub flags: TypeFlags,

    /// Declared bases (traits). Empty for built-in types.
    pub bases: Vec<TypeHandle>,
    /// C3-linearized method resolution order, self first. Computed once.
    mro: OnceLock<Vec<TypeHandle>>,

    /// Static and instance attributes (methods, constants) of this type.
    pub ns: Option<Arc<Namespace>>,

    pub hash: Option<fn(&ObjRef) -> OpResult<u64>>,
    /// Rich comparison. `None` means this type cannot compare with the
    /// operand in the given mode.
    pub compare: Option<fn(&ObjRef, &ObjRef, CompareMode) -> Option<OpResult>>,
    pub truth: Option<fn(&ObjRef) -> bool>,
    pub repr: Option<fn(&ObjRef) -> OpResult<String>>,

    pub iter: Option<&'static IterSlots>,
    pub subscript: Option<&'static SubscriptSlots>,
    pub buffer: Option<&'static BufferSlots>,
    pub ops: Option<&'static OpSlots>,
}

// === impl TypeInfo ===

impl TypeInfo {
    /// Descriptor for a built-in type; everything defaults to absent.
    pub fn builtin(name: &'static str) -> Self {
        Self {
            name,
            qname: name.to_string(),
            doc: "",
            flags: TypeFlags::BASE,
            bases: Vec::new(),
            mro: OnceLock::new(),
            ns: None,
            hash: None,
            compare: None,
            truth: None,
            repr: None,
            iter: None,
            subscript: None,
            buffer: None,
            ops: None,
        }
    }

    pub fn is_struct(&self) -> bool {
        self.flags.contains(TypeFlags::STRUCT)
    }

    pub fn is_trait(&self) -> bool {
        self.flags.contains(TypeFlags::TRAIT)
    }

    /// The C3-linearized MRO of this type. For slot-only built-ins this is
    /// just the type itself.
    pub fn mro(self: &Arc<Self>) -> &[TypeHandle] {
        self.mro.get_or_init(|| {
            c3_linearize(self).unwrap_or_else(|| vec![Arc::clone(self)])
        })
    }

    /// Whether `ancestor` appears in this type's MRO.
    pub fn derives_from(self: &Arc<Self>, ancestor: &TypeHandle) -> bool {
        self.mro().iter().any(|t| Arc::ptr_eq(t, ancestor))
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("qname", &self.qname)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// C3 linearization over the declared bases.
///
/// Returns `None` when the hierarchy is inconsistent (no valid
/// linearization exists).
pub fn c3_linearize(typ: &TypeHandle) -> Option<Vec<TypeHandle>> {
    let mut sequences: Vec<Vec<TypeHandle>> = typ
        .bases
        .iter()
        .map(|base| base.mro().to_vec())
        .collect();
    sequences.push(typ.bases.clone());

    let mut result = vec![Arc::clone(typ)];

    while sequences.iter().any(|s| !s.is_empty()) {
        // find the first head that appears in no other sequence's tail
        let mut candidate = None;
        for seq in &sequences {
            let Some(head) = seq.first() else { continue };

            let in_tail = sequences
                .iter()
                .any(|other| other.iter().skip(1).any(|t| Arc::ptr_eq(t, head)));

            if !in_tail {
                candidate = Some(Arc::clone(head));
                break;
            }
        }

        let candidate = candidate?;
        result.push(Arc::clone(&candidate));

        for seq in &mut sequences {
            if let Some(head) = seq.first()
                && Arc::ptr_eq(head, &candidate)
            {
                seq.remove(0);
            }
        }
    }

    Some(result)
}
