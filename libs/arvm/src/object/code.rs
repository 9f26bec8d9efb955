// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Code objects.
//!
//! A [`Code`] is the immutable unit the compiler hands to the runtime: the
//! instruction byte stream, the literal pool, the global-name table, the
//! closure plan and the declared frame sizes. It is produced once and shared
//! by every invocation.
//!
//! [`CodeBuilder`] is the emission API. It tracks the stack effect of each
//! appended instruction so the declared maximum depth comes out of the
//! emitter rather than being guessed by hand; the declared depth can still
//! be overridden for streams with data-dependent effects.

use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, Payload};
use crate::vm::opcode::{self, OpCode};

pub static CODE_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("code");
    typ.repr = Some(|obj| {
        let Payload::Code(code) = obj.payload() else {
            unreachable!("code repr on non-code payload")
        };
        Ok(format!("<code {}>", code.qname))
    });
    Arc::new(typ)
});

#[derive(Debug)]
pub struct Code {
    /// Opcode byte stream.
    pub instr: Vec<u8>,
    /// Literal pool referenced by index (`LSTATIC`, attribute keys, import
    /// names).
    pub statics: Vec<ObjRef>,
    /// Global variable names referenced by `LDGBL`/`STGBL`/`NGV`.
    pub names: Vec<String>,
    /// Enclosed (closure captured) variable names.
    pub enclosed: Vec<String>,
    /// Number of local slots a frame of this code needs.
    pub locals: usize,
    /// Declared maximum evaluation stack depth.
    pub max_stack: usize,
    /// Qualified name used in diagnostics.
    pub qname: String,
    /// Source location table: instruction offset to line number. Sorted by
    /// offset; diagnostics only.
    pub locations: Vec<(usize, u32)>,
}

// === impl Code ===

impl Code {
    /// The source line covering `offset`, if the compiler emitted a
    /// location table.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        let idx = self.locations.partition_point(|(o, _)| *o <= offset);
        idx.checked_sub(1).map(|i| self.locations[i].1)
    }

    pub fn into_object(self: Arc<Self>) -> ObjRef {
        Object::new(Arc::clone(&CODE_TYPE), Payload::Code(self))
    }
}

/// A forward-reference jump target handed out by [`CodeBuilder::label`].
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

#[derive(Debug)]
pub struct CodeBuilder {
    instr: Vec<u8>,
    statics: Vec<ObjRef>,
    names: Vec<String>,
    enclosed: Vec<String>,
    locals: usize,
    qname: String,
    locations: Vec<(usize, u32)>,

    depth: i64,
    max_depth: i64,
    declared_max: Option<usize>,
    /// (label, patch offset) pairs resolved at bind time.
    labels: Vec<Option<usize>>,
    patches: Vec<(usize, usize)>,
}

// === impl CodeBuilder ===

impl CodeBuilder {
    pub fn new(qname: impl Into<String>) -> Self {
        Self {
            instr: Vec::new(),
            statics: Vec::new(),
            names: Vec::new(),
            enclosed: Vec::new(),
            locals: 0,
            qname: qname.into(),
            locations: Vec::new(),
            depth: 0,
            max_depth: 0,
            declared_max: None,
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn offset(&self) -> usize {
        self.instr.len()
    }

    /// Intern a literal into the statics pool.
    pub fn static_ref(&mut self, obj: ObjRef) -> u32 {
        let idx = self.statics.len();
        self.statics.push(obj);
        u32::try_from(idx).expect("statics pool exceeds operand range")
    }

    /// Intern a global name.
    pub fn name_ref(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return u32::try_from(idx).expect("name pool exceeds operand range");
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        u32::try_from(idx).expect("name pool exceeds operand range")
    }

    /// Declare an enclosed variable, returning its slot.
    pub fn enclosed_ref(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.enclosed.iter().position(|n| n == name) {
            return u32::try_from(idx).expect("enclosed pool exceeds operand range");
        }
        let idx = self.enclosed.len();
        self.enclosed.push(name.to_string());
        u32::try_from(idx).expect("enclosed pool exceeds operand range")
    }

    pub fn locals(&mut self, count: usize) -> &mut Self {
        self.locals = self.locals.max(count);
        self
    }

    /// Override the tracked maximum stack depth.
    pub fn max_stack(&mut self, depth: usize) -> &mut Self {
        self.declared_max = Some(depth);
        self
    }

    /// Record the current offset as belonging to source `line`.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.locations.push((self.instr.len(), line));
        self
    }

    /// Emit a width-1 instruction.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        debug_assert_eq!(op.width(), 1, "{} carries an operand", op.mnemonic());
        self.instr.push(op as u8);
        self.track(op, 0);
        self
    }

    /// Emit a width-2 instruction with an 8-bit operand.
    pub fn op_arg(&mut self, op: OpCode, arg: u8) -> &mut Self {
        debug_assert_eq!(op.width(), 2, "{} is not a short-operand op", op.mnemonic());
        self.instr.push(op as u8);
        self.instr.push(arg);
        self.track(op, u32::from(arg));
        self
    }

    /// Emit a width-4 instruction with a 24-bit operand.
    #[expect(clippy::cast_possible_truncation, reason = "bytes are masked explicitly")]
    pub fn op_wide(&mut self, op: OpCode, arg: u32) -> &mut Self {
        debug_assert_eq!(op.width(), 4, "{} is not a wide op", op.mnemonic());
        debug_assert!(arg < (1 << 24), "operand exceeds 24 bits");
        self.instr.push(op as u8);
        self.instr.push((arg & 0xff) as u8);
        self.instr.push(((arg >> 8) & 0xff) as u8);
        self.instr.push(((arg >> 16) & 0xff) as u8);
        self.track(op, arg);
        self
    }

    /// Emit a width-4 instruction with a 16-bit argument and packed flags.
    pub fn op_flags(&mut self, op: OpCode, arg: u16, flags: u8) -> &mut Self {
        self.op_wide(op, u32::from(arg) | (u32::from(flags) << 16))
    }

    /// Allocate an unbound jump target.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Emit a jump-family instruction targeting `label`.
    pub fn jump(&mut self, op: OpCode, label: Label) -> &mut Self {
        debug_assert_eq!(op.width(), 4);
        self.patches.push((label.0, self.instr.len() + 1));
        self.op_wide(op, 0)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.instr.len());
        self
    }

    fn track(&mut self, op: OpCode, arg: u32) {
        match op {
            // stack trimmed to the operand depth
            OpCode::PopGt => self.depth = self.depth.min(i64::from(arg)),
            // result slot may be pushed onto an empty stack
            OpCode::Trap => self.depth = (self.depth).max(1),
            // conservative: assume the non-mutating path that keeps a result
            OpCode::IpAdd | OpCode::IpSub => self.depth -= 1,
            _ => {
                if let Some(delta) = opcode::stack_delta(op, arg) {
                    self.depth += delta;
                }
            }
        }
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Finalize into a shared code object.
    ///
    /// # Panics
    ///
    /// Panics when a label was used in a jump but never bound; that is a bug
    /// in the emitter, not a runtime condition.
    #[expect(clippy::cast_possible_truncation, reason = "bytes are masked explicitly")]
    pub fn build(mut self) -> Arc<Code> {
        for (label, at) in &self.patches {
            let target = self.labels[*label].expect("jump to unbound label");
            let target = u32::try_from(target).expect("jump target exceeds operand range");
            debug_assert!(target < (1 << 24));
            self.instr[*at] = (target & 0xff) as u8;
            self.instr[*at + 1] = ((target >> 8) & 0xff) as u8;
            self.instr[*at + 2] = ((target >> 16) & 0xff) as u8;
        }

        let tracked = usize::try_from(self.max_depth.max(0)).unwrap_or(0);

        Arc::new(Code {
            instr: self.instr,
            statics: self.statics,
            names: self.names,
            enclosed: self.enclosed,
            locals: self.locals,
            max_stack: self.declared_max.unwrap_or(tracked),
            qname: self.qname,
            locations: self.locations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::integer::integer;

    #[test]
    fn tracked_stack_depth_matches_static_deltas() {
        let mut b = CodeBuilder::new("test");
        let k1 = b.static_ref(integer(1));
        let k2 = b.static_ref(integer(2));
        b.op_wide(OpCode::LStatic, k1);
        b.op_wide(OpCode::LStatic, k2);
        b.op(OpCode::Add);
        b.op(OpCode::Ret);

        let code = b.build();
        assert_eq!(code.max_stack, 2);
    }

    #[test]
    fn labels_patch_forward_jumps() {
        let mut b = CodeBuilder::new("test");
        let end = b.label();
        b.op(OpCode::PshN);
        b.jump(OpCode::Jmp, end);
        b.op(OpCode::Pop);
        b.bind(end);
        b.op(OpCode::Ret);

        let code = b.build();
        // the jump lands on the final `ret`
        let instr = opcode::decode(&code.instr, 1).unwrap();
        assert_eq!(instr.op, OpCode::Jmp);
        assert_eq!(instr.arg_usize(), code.instr.len() - 1);
    }

    #[test]
    fn line_table_is_searchable() {
        let mut b = CodeBuilder::new("test");
        b.line(1);
        b.op(OpCode::PshN);
        b.line(2);
        b.op(OpCode::Ret);

        let code = b.build();
        assert_eq!(code.line_at(0), Some(1));
        assert_eq!(code.line_at(1), Some(2));
    }
}
