// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Call activations.
//!
//! A frame owns its evaluation stack and local slots, both sized from the
//! code object at entry. The stack never grows past the declared maximum;
//! that bound is a compiler contract checked with debug assertions in the
//! hot path.

use std::sync::Arc;

use crate::object::code::Code;
use crate::object::namespace::Namespace;
use crate::object::typeinfo::TypeHandle;
use crate::object::{ObjRef, Slot};
use crate::vm::opcode::CallMode;

/// A call recorded by `DFR`, run LIFO on frame exit.
pub struct DeferRecord {
    pub func: ObjRef,
    pub args: Vec<ObjRef>,
    pub mode: CallMode,
}

pub struct Frame {
    pub code: Arc<Code>,
    /// Byte offset of the next instruction within `code.instr`.
    pub ip: usize,
    stack: Vec<Slot>,
    pub locals: Vec<Slot>,
    /// Enclosed list installed from the function's captures (a list object).
    pub enclosed: Option<ObjRef>,
    pub globals: Arc<Namespace>,
    /// Receiver for method frames.
    pub instance: Option<ObjRef>,
    /// Visibility scope: the type whose code this frame executes.
    pub scope: Option<TypeHandle>,
    pub defers: Vec<DeferRecord>,
    /// Armed trap target, if any.
    pub trap_ip: Option<usize>,
    /// Panic-chain length captured when the trap was armed.
    pub panic_baseline: usize,
    /// Monitors held by enclosing `sync` blocks, release order is LIFO.
    pub sync_keys: Vec<ObjRef>,
    pub return_value: Slot,
    /// Generator owning this frame, when the frame is resumable.
    pub generator: Option<ObjRef>,
    /// Set once the frame has begun finalizing (draining defers).
    pub exiting: bool,
    pub qname: String,
}

// === impl Frame ===

impl Frame {
    pub fn new(code: Arc<Code>, globals: Arc<Namespace>, qname: String) -> Self {
        let locals = vec![None; code.locals];
        let stack = Vec::with_capacity(code.max_stack);

        Self {
            code,
            ip: 0,
            stack,
            locals,
            enclosed: None,
            globals,
            instance: None,
            scope: None,
            defers: Vec::new(),
            trap_ip: None,
            panic_baseline: 0,
            sync_keys: Vec::new(),
            return_value: None,
            generator: None,
            exiting: false,
            qname,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn push(&mut self, slot: Slot) {
        debug_assert!(
            self.stack.len() < self.code.max_stack || self.code.max_stack == 0,
            "evaluation stack overflow in {}",
            self.qname
        );
        self.stack.push(slot);
    }

    #[inline]
    pub fn pop(&mut self) -> Slot {
        debug_assert!(!self.stack.is_empty(), "evaluation stack underflow");
        self.stack.pop().flatten()
    }

    /// Top of stack; `None` both for an empty stack and the null sentinel.
    #[inline]
    pub fn top(&self) -> Option<&ObjRef> {
        self.stack.last().and_then(Option::as_ref)
    }

    #[inline]
    pub fn top_slot(&self) -> Option<&Slot> {
        self.stack.last()
    }

    /// Slot `k` positions from the top; `k = 0` is TOS.
    #[inline]
    pub fn slot_from_top(&self, k: usize) -> Option<&Slot> {
        let idx = self.stack.len().checked_sub(k + 1)?;
        self.stack.get(idx)
    }

    /// Slot `depth` positions below the top (0 is the slot under TOS).
    #[inline]
    pub fn peek(&self, depth: usize) -> Option<&ObjRef> {
        let idx = self.stack.len().checked_sub(depth + 2)?;
        self.stack[idx].as_ref()
    }

    #[inline]
    pub fn replace_top(&mut self, slot: Slot) {
        if let Some(top) = self.stack.last_mut() {
            *top = slot;
        } else {
            self.stack.push(slot);
        }
    }

    /// Trim the stack down to `depth` entries.
    pub fn truncate(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    /// Remove the top `n` slots.
    pub fn rewind(&mut self, n: usize) {
        let len = self.stack.len();
        self.stack.truncate(len.saturating_sub(n));
    }

    /// Drain the top `n` slots in stack order (deepest first), failing the
    /// caller-supplied error when a null sentinel is among them.
    pub fn drain_top(&mut self, n: usize) -> Vec<Slot> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    /// Rotate the item `n` slots below the top up to the top (`MTH`).
    pub fn rotate_up(&mut self, n: usize) {
        let len = self.stack.len();
        if n + 1 <= len {
            self.stack[len - n - 1..].rotate_left(1);
        }
    }

    /// Rotate the top item down `n` slots (`PBHEAD`).
    pub fn rotate_down(&mut self, n: usize) {
        let len = self.stack.len();
        if n + 1 <= len {
            self.stack[len - n - 1..].rotate_right(1);
        }
    }

    /// Duplicate the top `n` slots in order (`DUP`).
    pub fn dup(&mut self, n: usize) {
        let len = self.stack.len();
        debug_assert!(n <= len, "DUP past stack bottom");
        for i in len.saturating_sub(n)..len {
            self.stack.push(self.stack[i].clone());
        }
    }

    /// Current source line, when the code carries a location table.
    pub fn line(&self) -> Option<u32> {
        self.code.line_at(self.ip)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("qname", &self.qname)
            .field("ip", &self.ip)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}
