// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builtin natives and modules.
//!
//! The builtin namespace is consulted by `LDGBL` after the frame's globals
//! miss. The `io` and `runtime` modules resolve through `IMPMOD`.

use std::sync::Arc;

use crate::evloop::socket;
use crate::object::function::{FunctionFlags, native_new};
use crate::object::namespace::{AttributeFlags, Namespace};
use crate::object::{
    self, ObjRef, Payload, boolean, bytes, chan, dict, error, integer, list, module, nil, set,
    string, structure,
};
use crate::vm::RuntimeInner;
use crate::vm::fiber::FiberStatus;
use crate::vm::native::{NativeCtx, NativeFn, NativeOutcome, NativeResult};

/// Install the builtin namespace and the builtin modules.
pub fn install(rt: &Arc<RuntimeInner>) {
    let ns = &rt.builtins;

    reg(ns, ns, "print", 0, FunctionFlags::VARIADIC, native_print);
    reg(ns, ns, "len", 1, FunctionFlags::empty(), native_len);
    reg(ns, ns, "type_of", 1, FunctionFlags::empty(), native_type_of);
    reg(ns, ns, "str", 1, FunctionFlags::empty(), native_str);
    reg(ns, ns, "now_ms", 0, FunctionFlags::empty(), native_now_ms);
    reg(ns, ns, "sleep_ms", 1, FunctionFlags::empty(), native_sleep_ms);
    reg(ns, ns, "chan", 1, FunctionFlags::empty(), native_chan);
    reg(ns, ns, "assert", 2, FunctionFlags::empty(), native_assert);
    reg(ns, ns, "yield_now", 0, FunctionFlags::empty(), native_yield_now);

    let io = Arc::new(Namespace::new());
    reg(&io, ns, "listen", 2, FunctionFlags::empty(), socket::native_listen);
    reg(&io, ns, "connect", 2, FunctionFlags::empty(), socket::native_connect);
    reg(&io, ns, "accept", 1, FunctionFlags::empty(), socket::native_accept);
    reg(&io, ns, "recv", 2, FunctionFlags::empty(), socket::native_recv);
    reg(&io, ns, "recv_all", 1, FunctionFlags::empty(), socket::native_recv_all);
    reg(&io, ns, "send", 2, FunctionFlags::empty(), socket::native_send);
    reg(&io, ns, "close", 1, FunctionFlags::empty(), socket::native_close);
    reg(&io, ns, "port", 1, FunctionFlags::empty(), socket::native_port);
    rt.register_module("io", module::module_new("io", io));

    let runtime = Arc::new(Namespace::new());
    reg(&runtime, ns, "vcores", 0, FunctionFlags::empty(), native_vcores);
    reg(&runtime, ns, "exit", 1, FunctionFlags::empty(), native_exit);
    reg(
        &runtime,
        ns,
        "lock_ost",
        0,
        FunctionFlags::empty(),
        native_lock_ost,
    );
    rt.register_module("runtime", module::module_new("runtime", runtime));
}

fn reg(
    target: &Arc<Namespace>,
    globals: &Arc<Namespace>,
    name: &str,
    arity: usize,
    flags: FunctionFlags,
    native: NativeFn,
) {
    let func = native_new(name, arity, flags, native, Arc::clone(globals));
    target.new_symbol(
        name,
        func,
        AttributeFlags::PUBLIC | AttributeFlags::CONST,
    );
}

fn native_print(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&object::repr(arg)?);
    }

    println!("{out}");
    Ok(NativeOutcome::Value(nil::nil()))
}

fn native_len(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let obj = &args[0];
    let len = match obj.payload() {
        Payload::Str(_) => string::str_len(obj),
        Payload::Bytes(_) => bytes::bytes_len(obj),
        Payload::Tuple(items) => items.len(),
        Payload::List(_) => list::list_len(obj),
        Payload::Dict(_) => dict::dict_len(obj),
        Payload::Set(_) => set::set_len(obj),
        _ => {
            return Err(error::type_error(format!(
                "'{}' has no length",
                obj.type_name()
            )));
        }
    };

    let len = i64::try_from(len).unwrap_or(i64::MAX);
    Ok(NativeOutcome::Value(integer::integer(len)))
}

fn native_type_of(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    Ok(NativeOutcome::Value(structure::type_of(&args[0])))
}

fn native_str(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    Ok(NativeOutcome::Value(string::string(object::repr(&args[0])?)))
}

fn native_now_ms(
    _ctx: &mut NativeCtx<'_>,
    _args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let now = i64::try_from(crate::evloop::now_ms()).unwrap_or(i64::MAX);
    Ok(NativeOutcome::Value(integer::integer(now)))
}

/// Park the fiber on an event-loop timer; it resumes with `nil`.
fn native_sleep_ms(
    ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let ms = integer::expect_int(&args[0], "sleep_ms")?;
    let ms = u64::try_from(ms)
        .map_err(|_| error::value_error("negative sleep duration".to_string()))?;

    ctx.rt.evloop.set_timeout(ctx.fiber, ms);
    Ok(NativeOutcome::Suspend)
}

fn native_chan(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let capacity = integer::expect_int(&args[0], "chan capacity")?;
    let capacity = usize::try_from(capacity)
        .map_err(|_| error::value_error("negative channel capacity".to_string()))?;

    Ok(NativeOutcome::Value(chan::chan_new(capacity)))
}

fn native_assert(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    if object::is_true(&Some(args[0].clone())) {
        return Ok(NativeOutcome::Value(boolean::boolean(true)));
    }

    let message = object::repr(&args[1])?;
    Err(error::error_new(error::KIND_ASSERTION, message))
}

/// Cooperative reschedule: the fiber goes to the back of the queue and
/// resumes with `nil`.
fn native_yield_now(
    ctx: &mut NativeCtx<'_>,
    _args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    ctx.fiber.set_status(FiberStatus::Suspended);
    ctx.fiber.set_async_value(nil::nil());
    Ok(NativeOutcome::Suspend)
}

fn native_vcores(
    ctx: &mut NativeCtx<'_>,
    _args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let n = i64::try_from(ctx.rt.sched.num_vcores()).unwrap_or(0);
    Ok(NativeOutcome::Value(integer::integer(n)))
}

/// Terminate the program; the CLI maps the error kind to the exit code.
fn native_exit(
    _ctx: &mut NativeCtx<'_>,
    args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    let code = integer::expect_int(&args[0], "exit code")?;
    Err(error::error_new(
        error::KIND_RUNTIME_EXIT,
        code.to_string(),
    ))
}

/// Pin the calling fiber to its current worker.
fn native_lock_ost(
    ctx: &mut NativeCtx<'_>,
    _args: &[ObjRef],
    _kwargs: Option<&ObjRef>,
) -> NativeResult {
    ctx.fiber.pin_to_ost(true);
    Ok(NativeOutcome::Value(nil::nil()))
}
