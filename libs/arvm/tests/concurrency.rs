// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduler behavior under load: many concurrent fibers, cross-worker
//! wakeups and deterministic results regardless of interleaving.

use std::sync::Arc;
use std::time::Duration;

use arvm::object::function::FunctionFlags;
use arvm::object::{future, integer, nil};
use arvm::{Code, CodeBuilder, Config, Namespace, OpCode, Runtime};

fn fib_like_program(n: i64) -> Arc<Code> {
    // busy work with a deterministic result: sum 0..n via a loop
    let mut b = CodeBuilder::new(format!("sum{n}"));
    b.locals(2);

    let zero = b.static_ref(integer::integer(0));
    b.op_wide(OpCode::LStatic, zero);
    b.op_arg(OpCode::StLc, 0); // acc
    let zero = b.static_ref(integer::integer(0));
    b.op_wide(OpCode::LStatic, zero);
    b.op_arg(OpCode::StLc, 1); // i

    let top = b.label();
    let end = b.label();
    b.bind(top);

    // if i >= n goto end
    b.op_arg(OpCode::LdLc, 1);
    let limit = b.static_ref(integer::integer(n));
    b.op_wide(OpCode::LStatic, limit);
    b.op_arg(OpCode::Cmp, 5); // i >= n leaves the loop
    b.jump(OpCode::Jt, end);

    // acc += i; i += 1
    b.op_arg(OpCode::LdLc, 0);
    b.op_arg(OpCode::LdLc, 1);
    b.op(OpCode::Add);
    b.op_arg(OpCode::StLc, 0);
    b.op_arg(OpCode::LdLc, 1);
    b.op(OpCode::Inc);
    b.op_arg(OpCode::StLc, 1);
    b.jump(OpCode::Jmp, top);

    b.bind(end);
    b.op_arg(OpCode::LdLc, 0);
    b.op(OpCode::Ret);
    b.max_stack(3);

    b.build()
}

#[test]
fn many_concurrent_evals_all_complete() {
    let rt = Runtime::new(Config {
        vcores: 4,
        stack_trace: false,
        ..Config::default()
    })
    .expect("runtime setup");

    let mut futures = Vec::new();
    for i in 0..48 {
        let n = 100 + i;
        let fut = rt.eval(fib_like_program(n), Arc::new(Namespace::new()));
        futures.push((n, fut));
    }

    for (n, fut) in futures {
        let result = future::as_future(&fut)
            .expect("eval returns a future")
            .wait_blocking()
            .expect("program succeeds");
        assert_eq!(integer::int_value(&result), n * (n - 1) / 2);
    }

    rt.shutdown(Duration::from_secs(5));
}

#[test]
fn cmp_ge_branches_correctly() {
    // regression guard for the loop condition used above
    let code = fib_like_program(3);
    let rt = Runtime::new(Config {
        vcores: 1,
        ..Config::default()
    })
    .expect("runtime setup");

    let result = rt
        .eval_blocking(code, Arc::new(Namespace::new()))
        .expect("program succeeds");
    assert_eq!(integer::int_value(&result), 3);

    rt.shutdown(Duration::from_secs(5));
}

#[test]
fn host_spawn_is_fire_and_forget() {
    let rt = Runtime::new(Config {
        vcores: 2,
        ..Config::default()
    })
    .expect("runtime setup");

    // a function object built directly by the host
    let mut b = CodeBuilder::new("noop");
    let nil_ref = b.static_ref(nil::nil());
    b.op_wide(OpCode::LStatic, nil_ref);
    b.op(OpCode::Ret);

    let func = arvm::object::function::function_new(
        b.build(),
        "noop",
        0,
        FunctionFlags::empty(),
        Vec::new(),
        None,
        None,
        Arc::new(Namespace::new()),
    );

    for _ in 0..16 {
        rt.spawn(&func, &[]).expect("spawn accepts the function");
    }

    assert!(rt.shutdown(Duration::from_secs(5)), "workers drained");
}

#[test]
fn shutdown_is_idempotent() {
    let rt = Runtime::new(Config {
        vcores: 1,
        ..Config::default()
    })
    .expect("runtime setup");

    assert!(rt.shutdown(Duration::from_secs(1)));
    assert!(rt.shutdown(Duration::from_secs(1)));
}
