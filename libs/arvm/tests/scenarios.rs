// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end programs driven through the public eval pipeline: generator
//! iteration, deferred-call ordering, trap/panic conversion, closures,
//! spawn/await and event-loop timers.

use std::sync::Arc;
use std::time::Duration;

use arvm::object::function::FunctionFlags;
use arvm::object::{ObjRef, error, integer, list, nil, repr, string};
use arvm::{Code, CodeBuilder, Config, Namespace, OpCode, Runtime};

fn runtime() -> Runtime {
    Runtime::new(Config {
        vcores: 2,
        ..Config::default()
    })
    .expect("runtime setup")
}

fn run(code: Arc<Code>) -> Result<ObjRef, ObjRef> {
    let rt = runtime();
    let result = rt.eval_blocking(code, Arc::new(Namespace::new()));
    rt.shutdown(Duration::from_secs(5));
    result
}

/// Push `[enclosed, defaults, code]` and emit `MKFN`.
fn emit_mkfn(b: &mut CodeBuilder, code: Arc<Code>, arity: u16, flags: FunctionFlags) {
    let enc = b.static_ref(nil::nil());
    b.op_wide(OpCode::LStatic, enc);
    let def = b.static_ref(nil::nil());
    b.op_wide(OpCode::LStatic, def);
    let code = b.static_ref(code.into_object());
    b.op_wide(OpCode::LStatic, code);
    b.op_flags(OpCode::MkFn, arity, flags.bits());
}

fn push_int(b: &mut CodeBuilder, v: i64) {
    let idx = b.static_ref(integer::integer(v));
    b.op_wide(OpCode::LStatic, idx);
}

#[test]
fn counter_generator_sums_to_six() {
    // func gen() { yield 1; yield 2; yield 3 }
    let mut g = CodeBuilder::new("gen");
    for v in [1, 2, 3] {
        push_int(&mut g, v);
        g.op(OpCode::Yld);
    }
    let gen_code = g.build();

    // let s = 0; for v in gen() { s += v }; return s
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    push_int(&mut b, 0);
    b.op_arg(OpCode::StLc, 0);

    emit_mkfn(&mut b, gen_code, 0, FunctionFlags::GENERATOR);
    b.op_flags(OpCode::Call, 0, 0);
    b.op(OpCode::LdIter);

    let top = b.label();
    let end = b.label();
    b.bind(top);
    b.op(OpCode::Nxt);
    b.jump(OpCode::Jex, end);
    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Add);
    b.op_arg(OpCode::StLc, 0);
    b.jump(OpCode::Jmp, top);
    b.bind(end);

    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Ret);
    // iterator protocol peaks at [gen, value, operand]
    b.max_stack(4);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 6);
}

#[test]
fn deferred_calls_run_lifo_after_the_body() {
    // out is a shared list literal; app(x) appends x to it
    let out = list::list(Vec::new());

    let mut a = CodeBuilder::new("app");
    a.locals(1);
    let out_ref = a.static_ref(out.clone());
    a.op_wide(OpCode::LStatic, out_ref);
    a.op_arg(OpCode::LdLc, 0);
    a.op(OpCode::Plt);
    a.op(OpCode::PshN);
    a.op(OpCode::Ret);
    let app_code = a.build();

    // defer app("a"); defer app("b"); app("c")
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    emit_mkfn(&mut b, app_code, 1, FunctionFlags::empty());
    b.op_arg(OpCode::StLc, 0);

    for (text, op) in [("a", OpCode::Dfr), ("b", OpCode::Dfr), ("c", OpCode::Call)] {
        b.op_arg(OpCode::LdLc, 0);
        let s = b.static_ref(string::string(text));
        b.op_wide(OpCode::LStatic, s);
        b.op_flags(op, 1, 0);
        if op == OpCode::Call {
            b.op(OpCode::Pop);
        }
    }

    b.op(OpCode::PshN);
    b.op(OpCode::Ret);

    run(b.build()).expect("program succeeds");

    let order: Vec<String> = list::list_snapshot(&out)
        .iter()
        .map(|s| string::str_value(s).to_string())
        .collect();
    assert_eq!(order, ["c", "b", "a"]);
}

#[test]
fn trap_converts_a_panic_into_a_result() {
    // let r = trap (panic error("boom")); r.error.message
    let mut b = CodeBuilder::new("main");

    let handler = b.label();
    b.jump(OpCode::St, handler);

    let boom = b.static_ref(error::runtime_error("boom".to_string()));
    b.op_wide(OpCode::LStatic, boom);
    b.op(OpCode::Panic);

    b.bind(handler);
    b.op_arg(OpCode::PopGt, 0);
    b.op_wide(OpCode::Trap, 0);

    // r.value must be nil and r.error.message must be "boom"
    b.op_arg(OpCode::Dup, 1);
    let value_key = b.static_ref(string::string("value"));
    b.op_wide(OpCode::LdAttr, value_key);
    let nil_check = b.label();
    b.jump(OpCode::Jnil, nil_check);
    // non-nil value: report failure
    let bad = b.static_ref(string::string("value was not nil"));
    b.op_wide(OpCode::LStatic, bad);
    b.op(OpCode::Ret);

    b.bind(nil_check);
    b.op(OpCode::Pop);
    let error_key = b.static_ref(string::string("error"));
    b.op_wide(OpCode::LdAttr, error_key);
    let message_key = b.static_ref(string::string("message"));
    b.op_wide(OpCode::LdAttr, message_key);
    b.op(OpCode::Ret);
    b.max_stack(4);

    let result = run(b.build()).expect("trap recovers the panic");
    assert_eq!(string::str_value(&result), "boom");
}

#[test]
fn closures_capture_enclosed_bindings() {
    // func mk() { let x = 10; return func() { return x } }
    let mut inner = CodeBuilder::new("mk.inner");
    inner.op_arg(OpCode::LdEnc, 0);
    inner.op(OpCode::Ret);
    let inner_code = inner.build();

    let mut mk = CodeBuilder::new("mk");
    mk.locals(1);
    push_int(&mut mk, 10);
    mk.op_arg(OpCode::StLc, 0);

    // enclosed list, defaults, code
    mk.op_arg(OpCode::LdLc, 0);
    mk.op_wide(OpCode::MkLt, 1);
    let def = mk.static_ref(nil::nil());
    mk.op_wide(OpCode::LStatic, def);
    let code_ref = mk.static_ref(inner_code.into_object());
    mk.op_wide(OpCode::LStatic, code_ref);
    mk.op_flags(OpCode::MkFn, 0, FunctionFlags::CLOSURE.bits());
    mk.op(OpCode::Ret);
    let mk_code = mk.build();

    // let g = mk(); g()
    let mut b = CodeBuilder::new("main");
    emit_mkfn(&mut b, mk_code, 0, FunctionFlags::empty());
    b.op_flags(OpCode::Call, 0, 0);
    b.op_flags(OpCode::Call, 0, 0);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 10);
}

#[test]
fn spawned_fiber_publishes_through_its_future() {
    // let ft = spawn (func() => 42)(); await(ft)
    let mut w = CodeBuilder::new("worker");
    push_int(&mut w, 42);
    w.op(OpCode::Ret);
    let worker_code = w.build();

    let mut b = CodeBuilder::new("main");
    emit_mkfn(&mut b, worker_code, 0, FunctionFlags::empty());
    b.op_flags(OpCode::Spw, 0, 0);
    b.op(OpCode::Await);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 42);
}

#[test]
fn sleep_suspends_while_other_fibers_run() {
    // marks is shared; a spawned fiber appends while main sleeps
    let marks = list::list(Vec::new());

    let mut m = CodeBuilder::new("marker");
    let marks_ref = m.static_ref(marks.clone());
    m.op_wide(OpCode::LStatic, marks_ref);
    push_int(&mut m, 1);
    m.op(OpCode::Plt);
    m.op(OpCode::PshN);
    m.op(OpCode::Ret);
    let marker_code = m.build();

    // t0 = now_ms(); spawn marker(); sleep_ms(50); now_ms() - t0
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    let now = b.name_ref("now_ms");
    b.op_wide(OpCode::LdGbl, now);
    b.op_flags(OpCode::Call, 0, 0);
    b.op_arg(OpCode::StLc, 0);

    emit_mkfn(&mut b, marker_code, 0, FunctionFlags::empty());
    b.op_flags(OpCode::Spw, 0, 0);
    b.op(OpCode::Pop);

    let sleep = b.name_ref("sleep_ms");
    b.op_wide(OpCode::LdGbl, sleep);
    push_int(&mut b, 50);
    b.op_flags(OpCode::Call, 1, 0);
    b.op(OpCode::Pop);

    b.op_wide(OpCode::LdGbl, now);
    b.op_flags(OpCode::Call, 0, 0);
    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Sub);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert!(
        integer::int_value(&result) >= 50,
        "slept only {}ms",
        integer::int_value(&result)
    );
    assert_eq!(list::list_len(&marks), 1, "the marker fiber never ran");
}

#[test]
fn list_roundtrips_through_unpack() {
    let mut b = CodeBuilder::new("main");
    b.locals(3);

    for v in [1, 2, 3] {
        push_int(&mut b, v);
    }
    b.op_wide(OpCode::MkLt, 3);
    b.op_arg(OpCode::Unpack, 3);
    for slot in 0..3 {
        b.op_arg(OpCode::StLc, slot);
    }
    for slot in 0..3 {
        b.op_arg(OpCode::LdLc, slot);
    }
    b.op_wide(OpCode::MkLt, 3);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(repr(&result).unwrap(), "[1, 2, 3]");
}

#[test]
fn trap_without_a_panic_wraps_the_value() {
    let mut b = CodeBuilder::new("main");

    let handler = b.label();
    b.jump(OpCode::St, handler);
    push_int(&mut b, 7);
    b.bind(handler);
    b.op_wide(OpCode::Trap, 0);

    // Ok(7): value is 7, the result object is truthy
    let value_key = b.static_ref(string::string("value"));
    b.op_wide(OpCode::LdAttr, value_key);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 7);
}

#[test]
fn call_below_arity_curries() {
    // add2 = func(a, b) => a + b; add2(1)(2)
    let mut a = CodeBuilder::new("add2");
    a.locals(2);
    a.op_arg(OpCode::LdLc, 0);
    a.op_arg(OpCode::LdLc, 1);
    a.op(OpCode::Add);
    a.op(OpCode::Ret);
    let add2 = a.build();

    let mut b = CodeBuilder::new("main");
    emit_mkfn(&mut b, add2, 2, FunctionFlags::empty());
    push_int(&mut b, 1);
    b.op_flags(OpCode::Call, 1, 0);
    push_int(&mut b, 2);
    b.op_flags(OpCode::Call, 1, 0);
    b.op(OpCode::Ret);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 3);
}

#[test]
fn empty_iterables_emit_no_values() {
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    push_int(&mut b, 0);
    b.op_arg(OpCode::StLc, 0);

    b.op_wide(OpCode::MkLt, 0);
    b.op(OpCode::LdIter);

    let top = b.label();
    let end = b.label();
    b.bind(top);
    b.op(OpCode::Nxt);
    b.jump(OpCode::Jex, end);
    b.op(OpCode::Pop);
    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Inc);
    b.op_arg(OpCode::StLc, 0);
    b.jump(OpCode::Jmp, top);
    b.bind(end);

    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Ret);
    b.max_stack(3);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 0);
}

#[test]
fn inplace_list_append_skips_the_store() {
    // lst = []; lst += [5]; return lst
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    b.op_wide(OpCode::MkLt, 0);
    b.op_arg(OpCode::StLc, 0);

    b.op_arg(OpCode::LdLc, 0);
    push_int(&mut b, 5);
    b.op_wide(OpCode::MkLt, 1);
    b.op(OpCode::IpAdd);
    // skipped when the receiver mutates in place
    b.op_arg(OpCode::StLc, 0);

    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Ret);
    b.max_stack(3);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(repr(&result).unwrap(), "[5]");
}

#[test]
fn channel_rendezvous_hands_the_value_over() {
    // ch = chan(0); spawn producer(); <- ch
    let mut b = CodeBuilder::new("main");
    b.locals(2);

    let chan_name = b.name_ref("chan");
    b.op_wide(OpCode::LdGbl, chan_name);
    push_int(&mut b, 0);
    b.op_flags(OpCode::Call, 1, 0);
    b.op_arg(OpCode::StLc, 0);

    // producer captures the channel in its enclosed list
    let mut p = CodeBuilder::new("producer");
    push_int(&mut p, 42);
    p.op_arg(OpCode::LdEnc, 0);
    p.op(OpCode::PshC);
    p.op(OpCode::Pop);
    p.op(OpCode::PshN);
    p.op(OpCode::Ret);
    let producer = p.build();

    b.op_arg(OpCode::LdLc, 0);
    b.op_wide(OpCode::MkLt, 1);
    let def = b.static_ref(nil::nil());
    b.op_wide(OpCode::LStatic, def);
    let code_ref = b.static_ref(producer.into_object());
    b.op_wide(OpCode::LStatic, code_ref);
    b.op_flags(OpCode::MkFn, 0, FunctionFlags::CLOSURE.bits());
    b.op_flags(OpCode::Spw, 0, 0);
    b.op_arg(OpCode::StLc, 1);

    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::PopC);

    // make sure the producer finished before we return
    b.op_arg(OpCode::LdLc, 1);
    b.op(OpCode::Await);
    b.op(OpCode::Pop);

    b.op(OpCode::Ret);
    b.max_stack(4);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 42);
}

#[test]
fn monitors_serialize_sync_blocks() {
    let shared = list::list(Vec::new());

    // locker: sync(shared) { shared += [2] }
    let mut l = CodeBuilder::new("locker");
    let shared_ref = l.static_ref(shared.clone());
    l.op_wide(OpCode::LStatic, shared_ref);
    l.op(OpCode::Sync);
    let shared_ref = l.static_ref(shared.clone());
    l.op_wide(OpCode::LStatic, shared_ref);
    push_int(&mut l, 2);
    l.op(OpCode::Plt);
    l.op(OpCode::Pop);
    l.op(OpCode::UnSync);
    l.op(OpCode::PshN);
    l.op(OpCode::Ret);
    let locker = l.build();

    // main: sync(shared); spawn locker(); shared += [1]; unsync; await
    let mut b = CodeBuilder::new("main");
    b.locals(1);

    let shared_ref = b.static_ref(shared.clone());
    b.op_wide(OpCode::LStatic, shared_ref);
    b.op(OpCode::Sync);

    emit_mkfn(&mut b, locker, 0, FunctionFlags::empty());
    b.op_flags(OpCode::Spw, 0, 0);
    b.op_arg(OpCode::StLc, 0);

    // give the locker a chance to contend on the monitor
    let sleep = b.name_ref("sleep_ms");
    b.op_wide(OpCode::LdGbl, sleep);
    push_int(&mut b, 20);
    b.op_flags(OpCode::Call, 1, 0);
    b.op(OpCode::Pop);

    let shared_ref = b.static_ref(shared.clone());
    b.op_wide(OpCode::LStatic, shared_ref);
    push_int(&mut b, 1);
    b.op(OpCode::Plt);
    b.op(OpCode::Pop);

    b.op(OpCode::UnSync);

    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Await);
    b.op(OpCode::Ret);
    b.max_stack(4);

    run(b.build()).expect("program succeeds");

    let order: Vec<i64> = list::list_snapshot(&shared)
        .iter()
        .map(integer::int_value)
        .collect();
    assert_eq!(order, [1, 2], "the monitor failed to serialize the blocks");
}

#[test]
fn uncaught_panics_resolve_the_future_with_the_error() {
    let mut b = CodeBuilder::new("main");
    let boom = b.static_ref(error::value_error("unhandled".to_string()));
    b.op_wide(OpCode::LStatic, boom);
    b.op(OpCode::Panic);

    let rt = Runtime::new(Config {
        vcores: 1,
        stack_trace: false,
        ..Config::default()
    })
    .expect("runtime setup");
    let err = rt
        .eval_blocking(b.build(), Arc::new(Namespace::new()))
        .expect_err("the panic must surface");
    rt.shutdown(Duration::from_secs(5));

    assert!(error::error_is(&err, error::KIND_VALUE));
    assert_eq!(error::error_message(&err), Some("unhandled"));
}

#[test]
fn struct_types_construct_and_expose_fields() {
    // struct Point { x, y } instantiated positionally
    let mut b = CodeBuilder::new("main");

    // name, qname, doc
    for text in ["Point", "main.Point", ""] {
        let s = b.static_ref(string::string(text));
        b.op_wide(OpCode::LStatic, s);
    }
    b.op_wide(OpCode::MkStruct, 0);

    // field templates: x = nil, y = nil
    for field in ["x", "y"] {
        let nil_ref = b.static_ref(nil::nil());
        b.op_wide(OpCode::LStatic, nil_ref);
        let name_ref = b.static_ref(string::string(field));
        b.op_wide(OpCode::LStatic, name_ref);
        b.op_arg(OpCode::TStore, 1); // public
    }

    // Point(3, 4).y
    push_int(&mut b, 3);
    push_int(&mut b, 4);
    b.op_flags(OpCode::Init, 2, 0);
    let y_key = b.static_ref(string::string("y"));
    b.op_wide(OpCode::LdAttr, y_key);
    b.op(OpCode::Ret);
    b.max_stack(4);

    let result = run(b.build()).expect("program succeeds");
    assert_eq!(integer::int_value(&result), 4);
}
