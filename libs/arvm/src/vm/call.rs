// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Call machinery shared by `CALL`, `DFR` and `SPW`.
//!
//! The stack layout at a call site is `[callable, arg0, .., argN-1]` with
//! the arguments on top. A null sentinel in the first argument slot (left
//! by `LDMETH` for non-method values) is skipped. `REST_PARAMS` spreads a
//! single list argument into positionals; `KW_PARAMS` peels the trailing
//! dict off as keyword arguments.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::object::function::{Function, FunctionFlags};
use crate::object::{ObjRef, OpResult, Payload, dict, error, list};
use crate::vm::frame::Frame;
use crate::vm::opcode::CallMode;

/// Arguments gathered from a call site.
pub struct CallArgs {
    pub callable: ObjRef,
    pub args: SmallVec<[ObjRef; 8]>,
    pub kwargs: Option<ObjRef>,
}

/// Read (without popping) the callable and arguments for a call with
/// `stack_size` argument slots.
pub fn gather(frame: &Frame, stack_size: usize, mode: CallMode) -> OpResult<CallArgs> {
    debug_assert!(
        frame.depth() > stack_size,
        "call without a callable on the stack"
    );

    let Some(Some(callable)) = frame.slot_from_top(stack_size).map(Option::as_ref) else {
        return Err(error::type_error("call target is not callable".to_string()));
    };
    let callable = Arc::clone(callable);

    let mut slots: SmallVec<[ObjRef; 8]> = SmallVec::new();
    for i in 0..stack_size {
        // arg i sits stack_size - 1 - i slots below the top
        let slot = frame.slot_from_top(stack_size - 1 - i).map(Option::as_ref);
        match slot {
            Some(Some(obj)) => slots.push(Arc::clone(obj)),
            // a leading null (method marker left by LDMETH) is skipped
            Some(None) if i == 0 => {}
            _ => {
                return Err(error::runtime_error(
                    "null sentinel among call arguments".to_string(),
                ));
            }
        }
    }

    let mut kwargs = None;
    if mode.contains(CallMode::KW_PARAMS) {
        let Some(kw) = slots.pop() else {
            return Err(error::runtime_error(
                "keyword call without a keyword dict".to_string(),
            ));
        };

        if !matches!(kw.payload(), Payload::Dict(_)) {
            return Err(error::type_error(format!(
                "keyword arguments expect a 'dict', got '{}'",
                kw.type_name()
            )));
        }
        kwargs = Some(kw);
    }

    if mode.contains(CallMode::REST_PARAMS) {
        let Some(rest) = slots.first().cloned() else {
            return Err(error::runtime_error(
                "spread call without an argument list".to_string(),
            ));
        };

        let mut spread: SmallVec<[ObjRef; 8]> = SmallVec::new();
        spread.extend(list::list_snapshot(&rest));
        spread.extend(slots.into_iter().skip(1));
        slots = spread;
    }

    Ok(CallArgs {
        callable,
        args: slots,
        kwargs,
    })
}

/// Outcome of the arity check.
pub enum Arity {
    /// Counts line up; proceed with the call.
    Ok,
    /// Fewer positionals than declared: curry into a partial application.
    Curry,
}

/// Validate `positional` arguments against the function's declared arity.
pub fn check_arity(func: &Function, positional: usize, kwargs: bool) -> OpResult<Arity> {
    if kwargs && !func.is_kwargs() && !func.have_defaults() {
        return Err(error::type_error(format!(
            "'{}' does not accept keyword arguments",
            func.qname
        )));
    }

    let effective_min = func.arity.saturating_sub(func.defaults.len());

    if positional < effective_min {
        if positional == 0 {
            return Err(arity_error(func, positional));
        }
        return Ok(Arity::Curry);
    }

    if positional > func.arity && !func.is_variadic() {
        return Err(arity_error(func, positional));
    }

    Ok(Arity::Ok)
}

fn arity_error(func: &Function, positional: usize) -> ObjRef {
    error::type_error(format!(
        "'{}' takes {} argument(s), got {}",
        func.qname, func.arity, positional
    ))
}

/// Prepare a frame for a bytecode function call.
///
/// Binding: curried arguments first, then the call's own positionals, then
/// defaults for missing trailing parameters. The variadic slot collects
/// extras as a list; the kwargs slot collects the keyword dict.
pub fn bind_frame(
    func: &Function,
    args: &[ObjRef],
    kwargs: Option<&ObjRef>,
) -> OpResult<Frame> {
    let Some(code) = &func.code else {
        return Err(error::runtime_error(format!(
            "'{}' has no bytecode body",
            func.qname
        )));
    };

    let mut frame = Frame::new(Arc::clone(code), Arc::clone(&func.globals), func.qname.clone());

    let mut positional: SmallVec<[ObjRef; 8]> = SmallVec::new();
    positional.extend(func.currying.iter().cloned());
    positional.extend(args.iter().cloned());

    // defaults fill missing trailing parameters
    if positional.len() < func.arity {
        let missing = func.arity - positional.len();
        if missing <= func.defaults.len() {
            let at = func.defaults.len() - missing;
            positional.extend(func.defaults[at..].iter().cloned());
        } else {
            return Err(arity_error(func, positional.len()));
        }
    }

    debug_assert!(frame.locals.len() >= func.arity, "code declares too few locals");

    let mut slot = 0;
    for arg in positional.iter().take(func.arity) {
        frame.locals[slot] = Some(Arc::clone(arg));
        slot += 1;
    }

    if func.is_variadic() {
        let extras: Vec<ObjRef> = positional.iter().skip(func.arity).cloned().collect();
        frame.locals[slot] = Some(list::list(extras));
        slot += 1;
    }

    if func.is_kwargs() {
        let kw = kwargs.map_or_else(dict::dict_new, Arc::clone);
        frame.locals[slot] = Some(kw);
    }

    if func.flags.contains(FunctionFlags::METHOD) {
        frame.instance = positional.first().cloned();
    }

    frame.scope = func
        .base
        .clone()
        .or_else(|| frame.instance.as_ref().map(|i| Arc::clone(i.typ())));

    // install the enclosed list captured at MKFN time
    frame.enclosed = func.enclosed.clone();

    Ok(frame)
}
