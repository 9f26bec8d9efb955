// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bytecode execution engine.
//!
//! [`eval`] runs one fiber until its last frame pops, it parks for I/O or a
//! synchronization object, or a generator yields control back. Dispatch is
//! a plain match over the opcode byte; every handler either advances the
//! instruction pointer itself or reports how the dispatch loop should
//! proceed through [`Step`].
//!
//! Panic propagation and frame finalization share one path, [`Machine::settle`]:
//! it drains the evaluation stack, runs deferred calls LIFO (each may panic
//! and extend the chain), releases `sync`-held monitors and pops the frame,
//! repeating until it finds an armed trap, hits the fiber's unwind limit or
//! empties the fiber.

use std::sync::Arc;

use crate::object::function::{self, FunctionFlags};
use crate::object::typeinfo::{CompareMode, OpSlots};
use crate::object::{
    self, ObjRef, OpResult, Payload, Slot, boolean, bounds::Bounds, chan::ChanOp, dict, error,
    future, list, monitor::Acquire, nil, result, set, string, structure, tuple,
};
use crate::vm::RuntimeInner;
use crate::vm::call::{self, Arity};
use crate::vm::fiber::{AsyncResult, FiberCore, FiberRef, FiberStatus};
use crate::vm::frame::{DeferRecord, Frame};
use crate::vm::generator::{self, Generator};
use crate::vm::native::{NativeCtx, NativeOutcome};
use crate::vm::opcode::{CallMode, Instr, OpCode, decode};

/// How a fiber left the engine.
pub enum FiberExit {
    /// The fiber ran to completion. `None` means it terminated panicking;
    /// the panic chain holds the error.
    Done(Option<ObjRef>),
    /// The fiber parked; its status says who will resume it.
    Suspended,
}

/// Execute the fiber's top frame until completion or suspension.
pub fn eval(rt: &Arc<RuntimeInner>, fiber: &FiberRef) -> FiberExit {
    let mut core = fiber.core.lock().unwrap();

    Machine {
        rt,
        fiber,
        core: &mut core,
    }
    .run()
}

/// Outcome of a single instruction.
enum Step {
    /// Keep dispatching; the handler adjusted the instruction pointer.
    Next,
    /// The current frame finished (explicit `RET` or fell off the end).
    FrameDone,
    /// Raise an error object as a panic.
    Panic(ObjRef),
    /// The fiber parked; hand control back to the scheduler.
    Suspend,
    /// A generator frame yielded this value.
    Yield(Slot),
}

enum Settle {
    /// Dispatch continues (a trap was entered, a defer frame was pushed or
    /// a call returned into its caller).
    Resume,
    /// The fiber has no live frames left.
    FiberDone(Option<ObjRef>),
}

struct Machine<'a> {
    rt: &'a Arc<RuntimeInner>,
    fiber: &'a FiberRef,
    core: &'a mut FiberCore,
}

impl Machine<'_> {
    fn run(&mut self) -> FiberExit {
        // a cancelled fiber resumes already panicking
        if self.core.panicking() && !self.core.frames.is_empty() {
            match self.settle() {
                Settle::Resume => {}
                Settle::FiberDone(result) => return FiberExit::Done(result),
            }
        }

        loop {
            let step = self.step();

            match step {
                Step::Next => {}
                Step::Suspend => return FiberExit::Suspended,
                Step::Panic(err) => {
                    self.core.raise(err);
                    match self.settle() {
                        Settle::Resume => {}
                        Settle::FiberDone(result) => return FiberExit::Done(result),
                    }
                }
                Step::FrameDone => match self.settle() {
                    Settle::Resume => {}
                    Settle::FiberDone(result) => return FiberExit::Done(result),
                },
                Step::Yield(value) => self.do_yield(value),
            }
        }
    }

    #[inline]
    fn top(&mut self) -> &mut Frame {
        self.core.frames.last_mut().expect("no live frame")
    }

    /// Dispatch one instruction of the top frame.
    fn step(&mut self) -> Step {
        let instr = {
            let Some(frame) = self.core.frames.last_mut() else {
                return Step::FrameDone;
            };

            if frame.ip >= frame.code.instr.len() {
                // fell off the end: implicit `return nil`
                return Step::FrameDone;
            }

            match decode(&frame.code.instr, frame.ip) {
                Some(instr) => instr,
                None => {
                    return Step::Panic(error::runtime_error(format!(
                        "unknown opcode 0x{:02x} at offset {}",
                        frame.code.instr[frame.ip], frame.ip
                    )));
                }
            }
        };

        tracing::trace!(
            fiber = self.fiber.id(),
            op = instr.op.mnemonic(),
            arg = instr.arg,
            "dispatch"
        );

        match instr.op {
            OpCode::Add => self.binop(|s| s.add, "+"),
            OpCode::Sub => self.binop(|s| s.sub, "-"),
            OpCode::Mul => self.binop(|s| s.mul, "*"),
            OpCode::Div => self.binop(|s| s.div, "/"),
            OpCode::IDiv => self.binop(|s| s.idiv, "//"),
            OpCode::Mod => self.binop(|s| s.rem, "%"),
            OpCode::Shl => self.binop(|s| s.shl, "<<"),
            OpCode::Shr => self.binop(|s| s.shr, ">>"),
            OpCode::LAnd => self.binop(|s| s.and, "&"),
            OpCode::LOr => self.binop(|s| s.or, "|"),
            OpCode::LXor => self.binop(|s| s.xor, "^"),

            OpCode::Neg => self.unop(|s| s.neg, "-"),
            OpCode::Pos => self.unop(|s| s.pos, "+"),
            OpCode::Inv => self.unop(|s| s.invert, "~"),
            OpCode::Inc => self.unop(|s| s.inc, "++"),
            OpCode::Dec => self.unop(|s| s.dec, "--"),

            OpCode::IpAdd => self.inplace(|s| s.inp_add, "+="),
            OpCode::IpSub => self.inplace(|s| s.inp_sub, "-="),

            OpCode::Not => {
                let frame = self.top();
                let truth = object::is_true(frame.top_slot().unwrap_or(&None));
                frame.replace_top(Some(boolean::boolean(!truth)));
                frame.ip += 1;
                Step::Next
            }

            OpCode::Cmp => self.compare_op(instr),
            OpCode::EqSt => self.eqst(instr),
            OpCode::Test => self.test(),
            OpCode::Cnt => self.contains(instr),

            OpCode::Pop => {
                let frame = self.top();
                frame.pop();
                frame.ip += 1;
                Step::Next
            }
            OpCode::PshN => {
                let frame = self.top();
                frame.push(None);
                frame.ip += 1;
                Step::Next
            }
            OpCode::Dup => {
                let frame = self.top();
                frame.dup(instr.arg_usize());
                frame.ip += 2;
                Step::Next
            }
            OpCode::Mth => {
                let frame = self.top();
                frame.rotate_up(instr.arg_usize());
                frame.ip += 2;
                Step::Next
            }
            OpCode::PbHead => {
                let frame = self.top();
                frame.rotate_down(instr.arg_usize());
                frame.ip += 2;
                Step::Next
            }
            OpCode::PopGt => {
                let frame = self.top();
                frame.truncate(instr.arg_usize());
                frame.ip += 2;
                Step::Next
            }

            OpCode::LStatic => {
                let frame = self.top();
                let Some(obj) = frame.code.statics.get(instr.arg_usize()).cloned() else {
                    return Step::Panic(error::runtime_error(format!(
                        "statics index {} out of range",
                        instr.arg
                    )));
                };
                frame.push(Some(obj));
                frame.ip += 4;
                Step::Next
            }

            OpCode::LdLc => {
                let frame = self.top();
                let slot = frame.locals.get(instr.arg_usize()).cloned().flatten();
                frame.push(slot);
                frame.ip += 2;
                Step::Next
            }
            OpCode::StLc => {
                let frame = self.top();
                let slot = frame.pop();
                let idx = instr.arg_usize();
                if idx >= frame.locals.len() {
                    return Step::Panic(error::runtime_error(format!(
                        "local slot {idx} out of range"
                    )));
                }
                frame.locals[idx] = slot;
                frame.ip += 2;
                Step::Next
            }

            OpCode::LdEnc => {
                let frame = self.top();
                let Some(enclosed) = frame.enclosed.clone() else {
                    return Step::Panic(error::runtime_error(
                        "no enclosed list installed".to_string(),
                    ));
                };
                let slot = list::list_get(&enclosed, instr.arg_usize());
                frame.push(slot);
                frame.ip += 2;
                Step::Next
            }
            OpCode::StEnc => {
                let (enclosed, value) = {
                    let frame = self.top();
                    (frame.enclosed.clone(), frame.pop())
                };
                let Some(enclosed) = enclosed else {
                    return Step::Panic(error::runtime_error(
                        "no enclosed list installed".to_string(),
                    ));
                };
                let Some(value) = value else {
                    return Step::Panic(error::runtime_error(
                        "cannot capture a null slot".to_string(),
                    ));
                };
                list::list_set(&enclosed, instr.arg_usize(), value);
                self.top().ip += 2;
                Step::Next
            }

            OpCode::LdGbl => self.load_global(instr),
            OpCode::StGbl => self.store_global(instr),
            OpCode::Ngv => self.new_global(instr),

            OpCode::LdAttr => self.load_attr(instr, false),
            OpCode::LdScope => self.load_attr(instr, true),
            OpCode::LdMeth => self.load_method(instr),
            OpCode::StAttr => self.store_attr(instr, false),
            OpCode::StScope => self.store_attr(instr, true),

            OpCode::Jmp => self.jump(instr.arg_usize()),
            OpCode::Jt => {
                let frame = self.top();
                let truth = object::is_true(frame.top_slot().unwrap_or(&None));
                frame.pop();
                if truth {
                    frame.ip = instr.arg_usize();
                } else {
                    frame.ip += 4;
                }
                Step::Next
            }
            OpCode::Jf => {
                let frame = self.top();
                let truth = object::is_true(frame.top_slot().unwrap_or(&None));
                frame.pop();
                if truth {
                    frame.ip += 4;
                } else {
                    frame.ip = instr.arg_usize();
                }
                Step::Next
            }
            OpCode::Jtop => {
                let frame = self.top();
                if object::is_true(frame.top_slot().unwrap_or(&None)) {
                    frame.ip = instr.arg_usize();
                } else {
                    frame.pop();
                    frame.ip += 4;
                }
                Step::Next
            }
            OpCode::Jfop => {
                let frame = self.top();
                if object::is_true(frame.top_slot().unwrap_or(&None)) {
                    frame.pop();
                    frame.ip += 4;
                } else {
                    frame.ip = instr.arg_usize();
                }
                Step::Next
            }
            OpCode::Jnil => {
                let frame = self.top();
                let is_nil = frame.top().is_some_and(nil::is_nil);
                if is_nil {
                    frame.ip = instr.arg_usize();
                } else {
                    frame.ip += 4;
                }
                Step::Next
            }
            OpCode::Jnn => {
                let frame = self.top();
                let is_nil = frame.top().is_some_and(nil::is_nil);
                if is_nil {
                    frame.ip += 4;
                } else {
                    frame.ip = instr.arg_usize();
                }
                Step::Next
            }

            OpCode::LdIter => {
                let tos = self.top().top().cloned();
                let Some(tos) = tos else {
                    return Step::Panic(error::type_error("cannot iterate null".to_string()));
                };

                if generator::as_generator(&tos).is_some() {
                    self.top().ip += 1;
                    return Step::Next;
                }

                match object::iter_get(&tos, false) {
                    Ok(iter) => {
                        let frame = self.top();
                        frame.replace_top(Some(iter));
                        frame.ip += 1;
                        Step::Next
                    }
                    Err(err) => Step::Panic(err),
                }
            }
            OpCode::Nxt => self.next(),
            OpCode::Jex => {
                let frame = self.top();
                let exhausted_gen = frame
                    .peek(0)
                    .and_then(generator::as_generator)
                    .is_some_and(Generator::is_exhausted);
                let null_top = matches!(frame.slot_from_top(0), Some(None));

                if exhausted_gen || null_top {
                    frame.pop();
                    frame.pop();
                    frame.ip = instr.arg_usize();
                } else {
                    frame.ip += 4;
                }
                Step::Next
            }

            OpCode::MkLt => self.make_list(instr),
            OpCode::MkTp => self.make_tuple(instr),
            OpCode::MkSt => self.make_set(instr),
            OpCode::MkDt => self.make_dict(instr),
            OpCode::Plt => {
                let (target, value) = {
                    let frame = self.top();
                    (frame.peek(0).cloned(), frame.top().cloned())
                };
                let (Some(target), Some(value)) = (target, value) else {
                    return Step::Panic(error::runtime_error(
                        "unexpected null in list construction".to_string(),
                    ));
                };
                if !matches!(target.payload(), Payload::List(_)) {
                    return Step::Panic(error::runtime_error(
                        "unexpected type in evaluation stack during PLT execution".to_string(),
                    ));
                }
                list::list_push(&target, value);
                let frame = self.top();
                frame.pop();
                frame.ip += 1;
                Step::Next
            }
            OpCode::Extd => {
                let (target, value) = {
                    let frame = self.top();
                    (frame.peek(0).cloned(), frame.top().cloned())
                };
                let (Some(target), Some(value)) = (target, value) else {
                    return Step::Panic(error::runtime_error(
                        "unexpected null in list extension".to_string(),
                    ));
                };
                if !matches!(target.payload(), Payload::List(_)) {
                    return Step::Panic(error::runtime_error(
                        "unexpected type in evaluation stack during EXTD execution".to_string(),
                    ));
                }
                if let Err(err) = list::list_extend(&target, &value) {
                    return Step::Panic(err);
                }
                let frame = self.top();
                frame.pop();
                frame.ip += 1;
                Step::Next
            }
            OpCode::DtMerge => {
                let (a, b) = {
                    let frame = self.top();
                    (frame.peek(0).cloned(), frame.top().cloned())
                };
                let (Some(a), Some(b)) = (a, b) else {
                    return Step::Panic(error::runtime_error(
                        "unexpected null in dict merge".to_string(),
                    ));
                };

                let merged = dict::dict_new();
                if let Err(err) =
                    dict::dict_merge(&merged, &a, false).and_then(|()| dict::dict_merge(&merged, &b, false))
                {
                    return Step::Panic(err);
                }

                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(merged));
                frame.ip += 1;
                Step::Next
            }
            OpCode::MkBnd => {
                let (start, stop) = {
                    let frame = self.top();
                    (frame.peek(0).cloned(), frame.top().cloned())
                };
                let (Some(start), Some(stop)) = (start, stop) else {
                    return Step::Panic(error::runtime_error(
                        "unexpected null in bounds construction".to_string(),
                    ));
                };
                match Bounds::new(&start, &stop) {
                    Ok(bounds) => {
                        let frame = self.top();
                        frame.pop();
                        frame.replace_top(Some(bounds));
                        frame.ip += 1;
                        Step::Next
                    }
                    Err(err) => Step::Panic(err),
                }
            }

            OpCode::Subscr => {
                let (obj, index) = {
                    let frame = self.top();
                    (frame.peek(0).cloned(), frame.top().cloned())
                };
                let (Some(obj), Some(index)) = (obj, index) else {
                    return Step::Panic(error::type_error("null is not subscriptable".to_string()));
                };
                match object::subscript_get(&obj, &index) {
                    Ok(value) => {
                        let frame = self.top();
                        frame.pop();
                        frame.replace_top(Some(value));
                        frame.ip += 1;
                        Step::Next
                    }
                    Err(err) => Step::Panic(err),
                }
            }
            OpCode::StSubscr => {
                let (obj, index, value) = {
                    let frame = self.top();
                    (
                        frame.peek(1).cloned(),
                        frame.peek(0).cloned(),
                        frame.top().cloned(),
                    )
                };
                let (Some(obj), Some(index), Some(value)) = (obj, index, value) else {
                    return Step::Panic(error::type_error("null is not subscriptable".to_string()));
                };
                match object::subscript_set(&obj, &index, &value) {
                    Ok(()) => {
                        let frame = self.top();
                        frame.rewind(3);
                        frame.ip += 1;
                        Step::Next
                    }
                    Err(err) => Step::Panic(err),
                }
            }

            OpCode::Unpack => self.unpack(instr),

            OpCode::MkFn => self.make_function(instr),
            OpCode::MkStruct => self.make_type(instr, false),
            OpCode::MkTrait => self.make_type(instr, true),
            OpCode::TStore => self.type_store(instr),
            OpCode::Init => self.init(instr),

            OpCode::Call => self.call(instr),
            OpCode::Dfr => self.defer(instr),
            OpCode::Spw => self.spawn(instr),

            OpCode::Ret => {
                let frame = self.top();
                frame.return_value = frame.pop();
                frame.ip += 1;
                Step::FrameDone
            }
            OpCode::Yld => {
                let frame = self.top();
                if frame.generator.is_none() {
                    return Step::Panic(error::runtime_error(
                        "yield outside of a generator".to_string(),
                    ));
                }
                let value = frame.pop();
                frame.ip += 1;
                Step::Yield(value)
            }

            OpCode::Panic => {
                let frame = self.top();
                let obj = frame.pop().unwrap_or_else(nil::nil);
                Step::Panic(obj)
            }
            OpCode::St => {
                let baseline = self.core.panics.len();
                let frame = self.top();
                frame.trap_ip = Some(instr.arg_usize());
                frame.panic_baseline = baseline;
                frame.ip += 4;
                Step::Next
            }
            OpCode::Trap => self.trap(instr),

            OpCode::ImpMod => self.import_module(instr),
            OpCode::ImpFrm => self.import_from(instr),
            OpCode::ImpAll => {
                let module = self.top().top().cloned();
                let Some(module) = module else {
                    return Step::Panic(error::type_error("expected a module".to_string()));
                };
                let Some(m) = crate::object::module::as_module(&module) else {
                    return Step::Panic(error::type_error(format!(
                        "expected 'module', got '{}'",
                        module.type_name()
                    )));
                };
                let frame = self.top();
                frame.globals.merge_public(&m.ns);
                frame.pop();
                frame.ip += 1;
                Step::Next
            }

            OpCode::Await => self.await_future(),
            OpCode::PshC => self.chan_write(),
            OpCode::PopC => self.chan_read(),
            OpCode::Sync => self.sync(),
            OpCode::UnSync => self.unsync(),
        }
    }

    // === arithmetic and comparison ===

    fn need2(&mut self) -> Result<(ObjRef, ObjRef), Step> {
        let frame = self.top();
        match (frame.peek(0).cloned(), frame.top().cloned()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Step::Panic(error::runtime_error(
                "operation on a null slot".to_string(),
            ))),
        }
    }

    fn binop(
        &mut self,
        select: fn(&OpSlots) -> Option<crate::object::typeinfo::BinaryOp>,
        symbol: &str,
    ) -> Step {
        let (a, b) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        match object::binary_op(&a, &b, select, symbol) {
            Ok(ret) => {
                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(ret));
                frame.ip += 1;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn unop(
        &mut self,
        select: fn(&OpSlots) -> Option<crate::object::typeinfo::UnaryOp>,
        symbol: &str,
    ) -> Step {
        let tos = self.top().top().cloned();
        let Some(tos) = tos else {
            return Step::Panic(error::runtime_error(
                "operation on a null slot".to_string(),
            ));
        };

        match object::unary_op(&tos, select, symbol) {
            Ok(ret) => {
                let frame = self.top();
                frame.replace_top(Some(ret));
                frame.ip += 1;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    /// `IPADD`/`IPSUB`: when the in-place slot mutated the receiver, the
    /// following store instruction is dead and gets skipped, dropping its
    /// stack operands.
    fn inplace(
        &mut self,
        select: fn(&OpSlots) -> Option<crate::object::typeinfo::BinaryOp>,
        symbol: &str,
    ) -> Step {
        let (a, b) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        let ret = match object::binary_op(&a, &b, select, symbol) {
            Ok(ret) => ret,
            Err(err) => return Step::Panic(err),
        };

        let frame = self.top();
        frame.pop();

        if !Arc::ptr_eq(&a, &ret) {
            frame.replace_top(Some(ret));
            frame.ip += 1;
            return Step::Next;
        }

        // mutated in place: skip the following store instruction
        frame.ip += 1;
        frame.pop();

        let Some(next) = decode(&frame.code.instr, frame.ip) else {
            return Step::Panic(error::runtime_error(
                "in-place assignment without a following store".to_string(),
            ));
        };

        match next.op {
            OpCode::StSubscr => {
                frame.pop();
                frame.pop();
            }
            OpCode::StAttr | OpCode::StScope => {
                frame.pop();
            }
            _ => {}
        }

        frame.ip += next.op.width();
        Step::Next
    }

    fn compare_op(&mut self, instr: Instr) -> Step {
        let Some(mode) = CompareMode::from_arg(instr.arg16()) else {
            return Step::Panic(error::runtime_error("invalid compare mode".to_string()));
        };

        let (a, b) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        match object::compare(&a, &b, mode) {
            Ok(ret) => {
                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(ret));
                frame.ip += 2;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn eqst(&mut self, instr: Instr) -> Step {
        let Some(mode) = CompareMode::from_arg(instr.arg16()) else {
            return Step::Panic(error::runtime_error("invalid compare mode".to_string()));
        };

        let (a, b) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        if !object::same_type(&a, &b) {
            let frame = self.top();
            frame.pop();
            frame.replace_top(Some(boolean::boolean(mode == CompareMode::Ne)));
            frame.ip += 2;
            return Step::Next;
        }

        match object::compare(&a, &b, mode) {
            Ok(ret) => {
                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(ret));
                frame.ip += 2;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    /// Equality probe that keeps the left operand on a miss.
    fn test(&mut self) -> Step {
        let (a, b) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        match object::equal(&a, &b) {
            Ok(true) => {
                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(boolean::boolean(true)));
                frame.ip += 1;
                Step::Next
            }
            Ok(false) => {
                let frame = self.top();
                frame.replace_top(Some(boolean::boolean(false)));
                frame.ip += 1;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn contains(&mut self, instr: Instr) -> Step {
        let (item, container) = match self.need2() {
            Ok(pair) => pair,
            Err(step) => return step,
        };

        match object::item_in(&container, &item) {
            Ok(found) => {
                let invert = instr.arg16() == 1;
                let frame = self.top();
                frame.pop();
                frame.replace_top(Some(boolean::boolean(found != invert)));
                frame.ip += 2;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    // === names ===

    fn global_name(&mut self, instr: Instr) -> Result<String, Step> {
        let frame = self.top();
        frame
            .code
            .names
            .get(instr.arg16() as usize)
            .cloned()
            .ok_or_else(|| {
                Step::Panic(error::runtime_error(format!(
                    "name index {} out of range",
                    instr.arg16()
                )))
            })
    }

    fn load_global(&mut self, instr: Instr) -> Step {
        let name = match self.global_name(instr) {
            Ok(name) => name,
            Err(step) => return step,
        };

        let globals = Arc::clone(&self.top().globals);
        let found = globals
            .lookup(&name)
            .or_else(|| self.rt.builtins.lookup(&name));

        let frame = self.top();
        match found {
            Some((value, _)) => {
                frame.push(Some(value));
                frame.ip += 4;
                Step::Next
            }
            None => {
                // keep the stack balanced so a trap handler can recover
                frame.push(None);
                Step::Panic(error::undeclared_error(&name))
            }
        }
    }

    fn store_global(&mut self, instr: Instr) -> Step {
        let name = match self.global_name(instr) {
            Ok(name) => name,
            Err(step) => return step,
        };

        let value = self.top().top().cloned();
        let Some(value) = value else {
            return Step::Panic(error::runtime_error(
                "cannot store a null slot".to_string(),
            ));
        };

        let frame = self.top();
        match frame.globals.set(&name, value) {
            Ok(()) => {
                frame.pop();
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn new_global(&mut self, instr: Instr) -> Step {
        let name = match self.global_name(instr) {
            Ok(name) => name,
            Err(step) => return step,
        };

        let value = self.top().top().cloned();
        let Some(value) = value else {
            return Step::Panic(error::runtime_error(
                "cannot declare a null slot".to_string(),
            ));
        };

        let flags =
            crate::object::namespace::AttributeFlags::from_bits_truncate(u16::from(instr.flags()));

        let frame = self.top();
        frame.globals.new_symbol(&name, value, flags);
        frame.pop();
        frame.ip += 4;
        Step::Next
    }

    // === attributes ===

    fn static_key(&mut self, instr: Instr) -> Result<String, Step> {
        let frame = self.top();
        let Some(key) = frame.code.statics.get(instr.arg_usize()) else {
            return Err(Step::Panic(error::runtime_error(format!(
                "statics index {} out of range",
                instr.arg
            ))));
        };

        match key.payload() {
            Payload::Str(s) => Ok(s.to_string()),
            Payload::Atom(s) => Ok(s.to_string()),
            _ => Err(Step::Panic(error::type_error(
                "attribute key is not a string".to_string(),
            ))),
        }
    }

    fn load_attr(&mut self, instr: Instr, static_scope: bool) -> Step {
        let key = match self.static_key(instr) {
            Ok(key) => key,
            Err(step) => return step,
        };

        let (target, scope) = {
            let frame = self.top();
            (frame.top().cloned(), frame.scope.clone())
        };
        let Some(target) = target else {
            return Step::Panic(error::type_error("null has no attributes".to_string()));
        };

        match structure::attr_load(&target, &key, static_scope, scope.as_ref()) {
            Ok(value) => {
                let frame = self.top();
                frame.replace_top(Some(value));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn load_method(&mut self, instr: Instr) -> Step {
        let key = match self.static_key(instr) {
            Ok(key) => key,
            Err(step) => return step,
        };

        let (target, scope) = {
            let frame = self.top();
            (frame.top().cloned(), frame.scope.clone())
        };
        let Some(target) = target else {
            return Step::Panic(error::type_error("null has no attributes".to_string()));
        };

        match structure::attr_load_method(&target, &key, scope.as_ref()) {
            Ok((value, is_method)) => {
                let frame = self.top();
                if is_method {
                    frame.replace_top(Some(value));
                    frame.push(Some(target));
                } else {
                    frame.replace_top(Some(value));
                    frame.push(None);
                }
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn store_attr(&mut self, instr: Instr, static_scope: bool) -> Step {
        let key = match self.static_key(instr) {
            Ok(key) => key,
            Err(step) => return step,
        };

        let (target, value, scope) = {
            let frame = self.top();
            (
                frame.peek(0).cloned(),
                frame.top().cloned(),
                frame.scope.clone(),
            )
        };
        let (Some(target), Some(value)) = (target, value) else {
            return Step::Panic(error::type_error("null has no attributes".to_string()));
        };

        match structure::attr_set(&target, &key, &value, static_scope, scope.as_ref()) {
            Ok(()) => {
                let frame = self.top();
                frame.rewind(2);
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    // === control flow ===

    fn jump(&mut self, target: usize) -> Step {
        self.top().ip = target;
        Step::Next
    }

    // === iteration ===

    fn next(&mut self) -> Step {
        let tos = self.top().top().cloned();
        let Some(tos) = tos else {
            return Step::Panic(error::type_error("cannot iterate null".to_string()));
        };

        if let Some(generator) = generator::as_generator(&tos) {
            let frame = match generator.take(self.fiber.id()) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // exhausted: behave like a drained iterator
                    let frame = self.top();
                    frame.push(None);
                    frame.ip += 1;
                    return Step::Next;
                }
                Err(err) => return Step::Panic(err),
            };

            let caller = self.top();
            caller.push(Some(Arc::clone(&tos)));
            caller.ip += 1;

            let mut frame = *frame;
            frame.generator = Some(Arc::clone(&tos));
            self.core.frames.push(frame);
            return Step::Next;
        }

        match object::iter_next(&tos) {
            Ok(item) => {
                let frame = self.top();
                frame.push(item);
                frame.ip += 1;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    // === composites ===

    fn take_objs(&mut self, n: usize) -> Result<Vec<ObjRef>, Step> {
        let frame = self.top();
        debug_assert!(frame.depth() >= n, "construction past stack bottom");

        let slots = frame.drain_top(n);
        let mut objs = Vec::with_capacity(n);
        for slot in slots {
            match slot {
                Some(obj) => objs.push(obj),
                None => {
                    return Err(Step::Panic(error::runtime_error(
                        "unexpected null in constructor".to_string(),
                    )));
                }
            }
        }
        Ok(objs)
    }

    fn make_list(&mut self, instr: Instr) -> Step {
        let items = match self.take_objs(instr.arg_usize()) {
            Ok(items) => items,
            Err(step) => return step,
        };
        let frame = self.top();
        frame.push(Some(list::list(items)));
        frame.ip += 4;
        Step::Next
    }

    fn make_tuple(&mut self, instr: Instr) -> Step {
        let items = match self.take_objs(instr.arg_usize()) {
            Ok(items) => items,
            Err(step) => return step,
        };
        let frame = self.top();
        frame.push(Some(tuple::tuple(items)));
        frame.ip += 4;
        Step::Next
    }

    fn make_set(&mut self, instr: Instr) -> Step {
        let items = match self.take_objs(instr.arg_usize()) {
            Ok(items) => items,
            Err(step) => return step,
        };

        let out = set::set_new();
        for item in items {
            if let Err(err) = set::set_add(&out, item) {
                return Step::Panic(err);
            }
        }

        let frame = self.top();
        frame.push(Some(out));
        frame.ip += 4;
        Step::Next
    }

    fn make_dict(&mut self, instr: Instr) -> Step {
        let items = match self.take_objs(instr.arg_usize()) {
            Ok(items) => items,
            Err(step) => return step,
        };

        if items.len() % 2 != 0 {
            return Step::Panic(error::runtime_error(
                "dict constructor expects key/value pairs".to_string(),
            ));
        }

        let out = dict::dict_new();
        for pair in items.chunks_exact(2) {
            if let Err(err) = dict::dict_insert(&out, pair[0].clone(), pair[1].clone()) {
                return Step::Panic(err);
            }
        }

        let frame = self.top();
        frame.push(Some(out));
        frame.ip += 4;
        Step::Next
    }

    fn unpack(&mut self, instr: Instr) -> Step {
        let n = instr.arg_usize();
        let iterable = self.top().top().cloned();
        let Some(iterable) = iterable else {
            return Step::Panic(error::type_error(
                "unpacking expression was expecting an iterable, not null".to_string(),
            ));
        };

        let iter = match object::iter_get(&iterable, false) {
            Ok(iter) => iter,
            Err(err) => return Step::Panic(err),
        };

        let mut items = Vec::with_capacity(n);
        loop {
            match object::iter_next(&iter) {
                Ok(Some(item)) => {
                    if items.len() == n {
                        break;
                    }
                    items.push(item);
                }
                Ok(None) => break,
                Err(err) => return Step::Panic(err),
            }
        }

        if items.len() != n {
            return Step::Panic(error::type_error(format!(
                "incompatible number of values to unpack (expected {n}, got {})",
                items.len()
            )));
        }

        let frame = self.top();
        frame.pop();
        for item in items.into_iter().rev() {
            frame.push(Some(item));
        }
        frame.ip += 2;
        Step::Next
    }

    // === functions and types ===

    fn make_function(&mut self, instr: Instr) -> Step {
        let flags = FunctionFlags::from_bits_truncate(instr.flags());
        let arity = instr.arg16() as usize;

        let (code_obj, defaults_obj, enclosed_obj, base_obj, globals) = {
            let frame = self.top();
            (
                frame.top().cloned(),
                frame.peek(0).cloned(),
                frame.peek(1).cloned(),
                frame.peek(2).cloned(),
                Arc::clone(&frame.globals),
            )
        };

        let Some(code_obj) = code_obj else {
            return Step::Panic(error::runtime_error(
                "function constructor without code".to_string(),
            ));
        };
        let Payload::Code(code) = code_obj.payload() else {
            return Step::Panic(error::type_error(format!(
                "expected 'code', got '{}'",
                code_obj.type_name()
            )));
        };

        let defaults = match defaults_obj {
            Some(obj) if matches!(obj.payload(), Payload::Tuple(_)) => {
                tuple::tuple_items(&obj).to_vec()
            }
            _ => Vec::new(),
        };

        let enclosed = enclosed_obj.filter(|obj| matches!(obj.payload(), Payload::List(_)));

        let base = if flags.contains(FunctionFlags::METHOD) || flags.contains(FunctionFlags::STATIC)
        {
            base_obj.as_ref().and_then(structure::as_type).cloned()
        } else {
            None
        };

        let func = function::function_new(
            Arc::clone(code),
            code.qname.clone(),
            arity,
            flags,
            defaults,
            enclosed,
            base,
            globals,
        );

        let frame = self.top();
        frame.rewind(2);
        frame.replace_top(Some(func));
        frame.ip += 4;
        Step::Next
    }

    fn make_type(&mut self, instr: Instr, is_trait: bool) -> Step {
        let trait_count = instr.arg_usize();

        let traits = match self.take_objs(trait_count) {
            Ok(objs) => objs,
            Err(step) => return step,
        };

        let mut bases = Vec::with_capacity(traits.len());
        for obj in &traits {
            let Some(typ) = structure::as_type(obj) else {
                return Step::Panic(error::type_error(format!(
                    "expected a trait, got '{}'",
                    obj.type_name()
                )));
            };
            if !typ.is_trait() {
                return Step::Panic(error::type_error(format!(
                    "'{}' is not a trait",
                    typ.qname
                )));
            }
            bases.push(Arc::clone(typ));
        }

        let (name, qname) = {
            let frame = self.top();
            let doc = frame.top().cloned();
            let qname = frame.peek(0).cloned();
            let name = frame.peek(1).cloned();
            let _ = doc;

            let Some(name) = name else {
                return Step::Panic(error::runtime_error(
                    "type constructor without a name".to_string(),
                ));
            };
            let Some(qname) = qname else {
                return Step::Panic(error::runtime_error(
                    "type constructor without a qualified name".to_string(),
                ));
            };

            (
                string::str_value(&name).to_string(),
                string::str_value(&qname).to_string(),
            )
        };

        let flags = if is_trait {
            crate::object::typeinfo::TypeFlags::TRAIT
        } else {
            crate::object::typeinfo::TypeFlags::STRUCT
        };

        let ns = Arc::new(crate::object::namespace::Namespace::new());
        match structure::type_new(&name, &qname, ns, bases, flags) {
            Ok(type_obj) => {
                let frame = self.top();
                // doc and qname
                frame.rewind(2);
                frame.replace_top(Some(type_obj));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn type_store(&mut self, instr: Instr) -> Step {
        let (type_obj, value, key) = {
            let frame = self.top();
            (
                frame.peek(1).cloned(),
                frame.peek(0).cloned(),
                frame.top().cloned(),
            )
        };

        let (Some(type_obj), Some(value), Some(key)) = (type_obj, value, key) else {
            return Step::Panic(error::runtime_error(
                "unexpected null during type construction".to_string(),
            ));
        };

        let Some(typ) = structure::as_type(&type_obj) else {
            return Step::Panic(error::runtime_error(
                "expected type in evaluation stack during TSTORE execution".to_string(),
            ));
        };

        let Some(ns) = &typ.ns else {
            return Step::Panic(error::runtime_error(
                "type under construction has no namespace".to_string(),
            ));
        };

        let flags = crate::object::namespace::AttributeFlags::from_bits_truncate(instr.arg16());
        ns.new_symbol(string::str_value(&key), value, flags);

        let frame = self.top();
        frame.rewind(2);
        frame.ip += 2;
        Step::Next
    }

    fn init(&mut self, instr: Instr) -> Step {
        let n = instr.arg16() as usize;
        let kw_init = crate::vm::opcode::InitMode::from_bits_truncate(instr.flags())
            .contains(crate::vm::opcode::InitMode::KW_INIT);

        let type_obj = {
            let frame = self.top();
            frame.slot_from_top(n).cloned().flatten()
        };
        let Some(type_obj) = type_obj else {
            return Step::Panic(error::type_error("null is not a type".to_string()));
        };
        let Some(typ) = structure::as_type(&type_obj).cloned() else {
            return Step::Panic(error::type_error(format!(
                "'{}' is not a type",
                type_obj.type_name()
            )));
        };

        let args = match self.take_objs(n) {
            Ok(args) => args,
            Err(step) => return step,
        };

        match structure::instance_new(&typ, &args, kw_init) {
            Ok(instance) => {
                let frame = self.top();
                frame.replace_top(Some(instance));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    // === calls ===

    fn call_cleanup(&mut self, stack_size: usize, result: Slot, width: usize) {
        let frame = self.top();
        frame.rewind(stack_size);
        frame.replace_top(result);
        frame.ip += width;
    }

    fn call(&mut self, instr: Instr) -> Step {
        let stack_size = instr.arg16() as usize;
        let mode = CallMode::from_bits_truncate(instr.flags());

        let call_args = {
            let frame = self.top();
            match call::gather(frame, stack_size, mode) {
                Ok(args) => args,
                Err(err) => return Step::Panic(err),
            }
        };

        // a struct type as callable constructs an instance
        if let Some(typ) = structure::as_type(&call_args.callable).cloned() {
            return match structure::instance_new(&typ, &call_args.args, false) {
                Ok(instance) => {
                    self.call_cleanup(stack_size, Some(instance), 4);
                    Step::Next
                }
                Err(err) => Step::Panic(err),
            };
        }

        let Some(func) = function::as_function(&call_args.callable) else {
            return Step::Panic(error::type_error(format!(
                "'{}' is not callable",
                call_args.callable.type_name()
            )));
        };

        let positional = call_args.args.len() + func.currying.len();
        match call::check_arity(func, positional, call_args.kwargs.is_some()) {
            Ok(Arity::Ok) => {}
            Ok(Arity::Curry) => {
                let curried = function::curry(func, &call_args.args);
                self.call_cleanup(stack_size, Some(curried), 4);
                return Step::Next;
            }
            Err(err) => return Step::Panic(err),
        }

        if let Some(native) = func.native {
            let mut ctx = NativeCtx {
                rt: self.rt,
                fiber: self.fiber,
            };

            // curried arguments precede the call's own positionals
            let mut full_args = func.currying.clone();
            full_args.extend(call_args.args.iter().cloned());

            return match native(&mut ctx, &full_args, call_args.kwargs.as_ref()) {
                Ok(NativeOutcome::Value(value)) => {
                    self.call_cleanup(stack_size, Some(value), 4);
                    Step::Next
                }
                Ok(NativeOutcome::Suspend) => {
                    // placeholder slot; the async result lands on resume
                    self.call_cleanup(stack_size, None, 4);
                    Step::Suspend
                }
                Err(err) => Step::Panic(err),
            };
        }

        if func.is_async() {
            return match self.spawn_fiber_for(func, &call_args) {
                Ok(future) => {
                    self.call_cleanup(stack_size, Some(future), 4);
                    Step::Next
                }
                Err(err) => Step::Panic(err),
            };
        }

        if func.is_generator() {
            let qname = func.qname.clone();
            return match call::bind_frame(func, &call_args.args, call_args.kwargs.as_ref()) {
                Ok(frame) => {
                    let generator = generator::generator_new(qname, frame);
                    self.call_cleanup(stack_size, Some(generator), 4);
                    Step::Next
                }
                Err(err) => Step::Panic(err),
            };
        }

        match call::bind_frame(func, &call_args.args, call_args.kwargs.as_ref()) {
            Ok(new_frame) => {
                {
                    let frame = self.top();
                    frame.rewind(stack_size);
                    // the callable slot stays; the return value replaces it
                    frame.ip += 4;
                }
                self.core.frames.push(new_frame);
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn defer(&mut self, instr: Instr) -> Step {
        let stack_size = instr.arg16() as usize;
        let mode = CallMode::from_bits_truncate(instr.flags());

        let call_args = {
            let frame = self.top();
            match call::gather(frame, stack_size, mode) {
                Ok(args) => args,
                Err(err) => return Step::Panic(err),
            }
        };

        let Some(func) = function::as_function(&call_args.callable) else {
            return Step::Panic(error::type_error(format!(
                "'{}' is not callable",
                call_args.callable.type_name()
            )));
        };

        if func.is_async() {
            return Step::Panic(error::type_error(format!(
                "unable to defer the async function '{}'",
                func.qname
            )));
        }
        if func.is_generator() {
            return Step::Panic(error::type_error(format!(
                "unable to defer the generator '{}'",
                func.qname
            )));
        }

        let positional = call_args.args.len() + func.currying.len();
        match call::check_arity(func, positional, call_args.kwargs.is_some()) {
            Ok(Arity::Ok) => {}
            Ok(Arity::Curry) => {
                return Step::Panic(error::type_error(format!(
                    "'{}' takes {} argument(s), got {}",
                    func.qname, func.arity, positional
                )));
            }
            Err(err) => return Step::Panic(err),
        }

        let record = DeferRecord {
            func: call_args.callable.clone(),
            args: call_args.args.to_vec(),
            mode,
        };

        let frame = self.top();
        frame.defers.push(record);
        frame.rewind(stack_size + 1);
        frame.ip += 4;
        Step::Next
    }

    fn spawn(&mut self, instr: Instr) -> Step {
        let stack_size = instr.arg16() as usize;
        let mode = CallMode::from_bits_truncate(instr.flags());

        let call_args = {
            let frame = self.top();
            match call::gather(frame, stack_size, mode) {
                Ok(args) => args,
                Err(err) => return Step::Panic(err),
            }
        };

        let Some(func) = function::as_function(&call_args.callable) else {
            return Step::Panic(error::type_error(format!(
                "'{}' is not callable",
                call_args.callable.type_name()
            )));
        };

        if func.is_generator() {
            return Step::Panic(error::type_error(format!(
                "unable to spawn the generator '{}'",
                func.qname
            )));
        }

        let positional = call_args.args.len() + func.currying.len();
        match call::check_arity(func, positional, call_args.kwargs.is_some()) {
            Ok(Arity::Ok) => {}
            Ok(Arity::Curry) => {
                return Step::Panic(error::type_error(format!(
                    "'{}' takes {} argument(s), got {}",
                    func.qname, func.arity, positional
                )));
            }
            Err(err) => return Step::Panic(err),
        }

        match self.spawn_fiber_for(func, &call_args) {
            Ok(fut) => {
                let frame = self.top();
                frame.rewind(stack_size);
                frame.replace_top(Some(fut));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    /// Allocate a fiber running `func`, enqueue it, and return its future.
    fn spawn_fiber_for(
        &mut self,
        func: &crate::object::function::Function,
        call_args: &call::CallArgs,
    ) -> OpResult {
        let new_frame = call::bind_frame(func, &call_args.args, call_args.kwargs.as_ref())?;

        let fiber = self.rt.alloc_fiber();
        let fut = future::future_new();
        fiber.attach_future(fut.clone());
        fiber.core.lock().unwrap().frames.push(new_frame);

        tracing::debug!(fiber = fiber.id(), func = %func.qname, "spawning fiber");
        self.rt.spawn_fiber(fiber);

        Ok(fut)
    }

    // === traps ===

    fn trap(&mut self, instr: Instr) -> Step {
        let handler = instr.arg_usize();

        let baseline = self.top().panic_baseline;
        let trapped = self.core.trap_above(baseline);

        let frame = self.top();
        frame.trap_ip = (handler > 0).then_some(handler);
        if handler == 0 {
            frame.panic_baseline = 0;
        }

        let res = match trapped {
            Some(err) => result::result_err(err),
            None => {
                let value = frame.top().cloned().unwrap_or_else(nil::nil);
                result::result_ok(value)
            }
        };

        if frame.depth() > 0 {
            frame.replace_top(Some(res));
        } else {
            frame.push(Some(res));
        }
        frame.ip += 4;
        Step::Next
    }

    // === imports ===

    fn import_module(&mut self, instr: Instr) -> Step {
        let name = match self.static_key(instr) {
            Ok(name) => name,
            Err(step) => return step,
        };

        match self.rt.load_module(&name) {
            Ok(module) => {
                let frame = self.top();
                frame.push(Some(module));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    fn import_from(&mut self, instr: Instr) -> Step {
        let key = match self.static_key(instr) {
            Ok(key) => key,
            Err(step) => return step,
        };

        let module = self.top().top().cloned();
        let Some(module) = module else {
            return Step::Panic(error::type_error("expected a module".to_string()));
        };

        match structure::import_from(&module, &key) {
            Ok(value) => {
                let frame = self.top();
                frame.push(Some(value));
                frame.ip += 4;
                Step::Next
            }
            Err(err) => Step::Panic(err),
        }
    }

    // === suspension points ===

    fn await_future(&mut self) -> Step {
        let tos = self.top().top().cloned();
        let Some(tos) = tos else {
            return Step::Panic(error::type_error("cannot await null".to_string()));
        };

        let Some(fut) = future::as_future(&tos) else {
            return Step::Panic(error::type_error(format!(
                "expected 'future', got '{}'",
                tos.type_name()
            )));
        };

        if let Some(result) = fut.result() {
            return match result {
                Ok(value) => {
                    let frame = self.top();
                    frame.replace_top(Some(value));
                    frame.ip += 1;
                    Step::Next
                }
                Err(err) => Step::Panic(err),
            };
        }

        self.fiber.set_status(FiberStatus::Blocked);
        if !fut.register(Arc::clone(self.fiber)) {
            // resolved between the check and registration: retry
            self.fiber.set_status(FiberStatus::Running);
            return Step::Next;
        }

        // the instruction pointer stays on AWAIT; it re-executes on resume
        Step::Suspend
    }

    fn chan_write(&mut self) -> Step {
        let (value, chan_obj) = {
            let frame = self.top();
            (frame.peek(0).cloned(), frame.top().cloned())
        };
        let (Some(value), Some(chan_obj)) = (value, chan_obj) else {
            return Step::Panic(error::runtime_error(
                "channel write on a null slot".to_string(),
            ));
        };

        let Some(chan) = crate::object::chan::as_chan(&chan_obj) else {
            return Step::Panic(error::type_error(format!(
                "expected 'chan', got '{}'",
                chan_obj.type_name()
            )));
        };

        match chan.write(&value, self.fiber) {
            ChanOp::Done { wake, .. } => {
                for fiber in wake {
                    self.rt.spawn_fiber(fiber);
                }
                let frame = self.top();
                // pop only the channel, the value stays on the stack
                frame.pop();
                frame.ip += 1;
                Step::Next
            }
            ChanOp::Park | ChanOp::ParkAndWake(_) => {
                // the write retries from scratch when the fiber resumes
                Step::Suspend
            }
        }
    }

    fn chan_read(&mut self) -> Step {
        let chan_obj = self.top().top().cloned();
        let Some(chan_obj) = chan_obj else {
            return Step::Panic(error::runtime_error(
                "channel read on a null slot".to_string(),
            ));
        };

        let Some(chan) = crate::object::chan::as_chan(&chan_obj) else {
            return Step::Panic(error::type_error(format!(
                "expected 'chan', got '{}'",
                chan_obj.type_name()
            )));
        };

        match chan.read(self.fiber) {
            ChanOp::Done { value, wake } => {
                for fiber in wake {
                    self.rt.spawn_fiber(fiber);
                }
                let frame = self.top();
                frame.replace_top(value);
                frame.ip += 1;
                Step::Next
            }
            ChanOp::Park => {
                // ip advances: the peer deposits the value in the
                // async-result slot and it replaces the channel on resume
                self.top().ip += 1;
                Step::Suspend
            }
            ChanOp::ParkAndWake(wake) => {
                self.top().ip += 1;
                for fiber in wake {
                    self.rt.spawn_fiber(fiber);
                }
                Step::Suspend
            }
        }
    }

    fn sync(&mut self) -> Step {
        let tos = self.top().top().cloned();
        let Some(tos) = tos else {
            return Step::Panic(error::runtime_error(
                "sync on a null slot".to_string(),
            ));
        };

        match tos.monitor().acquire(self.fiber) {
            Acquire::Acquired => {
                let frame = self.top();
                frame.sync_keys.push(Arc::clone(&tos));
                frame.pop();
                frame.ip += 1;
                Step::Next
            }
            Acquire::Park => Step::Suspend,
        }
    }

    fn unsync(&mut self) -> Step {
        let key = self.top().sync_keys.pop();
        let Some(key) = key else {
            return Step::Panic(error::runtime_error(
                "unsync without a held monitor".to_string(),
            ));
        };

        if let Some(waiter) = key.monitor().release(self.fiber) {
            self.rt.spawn_fiber(waiter);
        }

        self.top().ip += 1;
        Step::Next
    }

    // === yield and frame finalization ===

    fn do_yield(&mut self, value: Slot) {
        let frame = self.core.frames.pop().expect("yield without a frame");
        let generator = frame
            .generator
            .clone()
            .expect("yield from a frame without a generator");

        if let Some(generator) = generator::as_generator(&generator) {
            generator.park(Box::new(frame));
        }

        let caller = self.top();
        caller.replace_top(value.or_else(|| Some(nil::nil())));
    }

    /// Finalize frames until dispatch can resume.
    ///
    /// Handles both normal returns and panic unwinding: the evaluation stack
    /// is drained, deferred calls run LIFO (pushing frames as needed),
    /// monitors held by `sync` blocks are released, and the frame pops. An
    /// armed trap stops a panicking unwind; the unwind limit stops
    /// synchronous sub-evaluations.
    fn settle(&mut self) -> Settle {
        enum Action {
            Trap,
            RunDefer(DeferRecord),
            PopFrame,
        }

        loop {
            let panicking = self.core.panicking();

            let action = {
                let Some(frame) = self.core.frames.last_mut() else {
                    return Settle::FiberDone(None);
                };

                // a panic with an armed trap resumes at the handler
                if panicking
                    && !frame.exiting
                    && let Some(trap_ip) = frame.trap_ip
                {
                    frame.ip = trap_ip;
                    Action::Trap
                } else {
                    // begin (or continue) finalizing this frame
                    frame.exiting = true;
                    frame.truncate(0);

                    match frame.defers.pop() {
                        Some(defer) => Action::RunDefer(defer),
                        None => Action::PopFrame,
                    }
                }
            };

            match action {
                Action::Trap => return Settle::Resume,
                Action::RunDefer(defer) => {
                    let Some(func) = function::as_function(&defer.func) else {
                        continue;
                    };

                    if let Some(native) = func.native {
                        let mut ctx = NativeCtx {
                            rt: self.rt,
                            fiber: self.fiber,
                        };

                        let mut full_args = func.currying.clone();
                        full_args.extend(defer.args.iter().cloned());

                        if let Err(err) = native(&mut ctx, &full_args, None) {
                            self.core.raise(err);
                        }
                        continue;
                    }

                    match call::bind_frame(func, &defer.args, None) {
                        Ok(new_frame) => {
                            self.core.frames.push(new_frame);
                            return Settle::Resume;
                        }
                        Err(err) => {
                            self.core.raise(err);
                            continue;
                        }
                    }
                }
                Action::PopFrame => {}
            }

            // defers drained: release monitors and pop the frame
            let frame = self.core.frames.pop().expect("frame disappeared");

            for key in frame.sync_keys.iter().rev() {
                if let Some(waiter) = key.monitor().release(self.fiber) {
                    self.rt.spawn_fiber(waiter);
                }
            }

            if let Some(generator) = &frame.generator
                && let Some(generator) = generator::as_generator(generator)
            {
                generator.exhaust();
            }

            let panicking = self.core.panicking();
            let result = if panicking {
                None
            } else {
                frame.return_value.clone().or_else(|| Some(nil::nil()))
            };

            let at_limit = self
                .core
                .unwind_limit
                .is_some_and(|limit| self.core.frames.len() <= limit);

            if self.core.frames.is_empty() || at_limit {
                return Settle::FiberDone(result);
            }

            let caller = self.core.frames.last_mut().expect("caller disappeared");

            if caller.exiting {
                // we were a deferred call of the caller; keep finalizing it
                continue;
            }

            if panicking {
                // unwind into the caller; the loop head checks its trap
                continue;
            }

            // normal return: the result replaces the callable slot
            caller.replace_top(result);
            return Settle::Resume;
        }
    }
}

/// Install a pending async result into the fiber before resuming it.
///
/// The scheduler calls this when it picks a fiber up: a deposited value
/// replaces the top of the stack (the placeholder left at suspension); a
/// deposited error is raised so the fiber resumes panicking.
pub fn install_async_result(fiber: &FiberRef) {
    match fiber.take_async_result() {
        AsyncResult::None => {}
        AsyncResult::Value(value) => {
            let mut core = fiber.core.lock().unwrap();
            core.install_slot(Some(value));
        }
        AsyncResult::Error(err) => {
            let mut core = fiber.core.lock().unwrap();
            core.raise(err);
        }
    }
}
