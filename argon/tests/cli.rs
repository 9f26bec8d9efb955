// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end runs of the `argon` executable against assembly programs.

use std::path::PathBuf;
use std::process::{Command, Output};

fn write_program(name: &str, source: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "argon-test-{}-{}.arasm",
        std::process::id(),
        name
    ));
    std::fs::write(&path, source).expect("write test program");
    path
}

fn run_program(name: &str, source: &str) -> Output {
    let path = write_program(name, source);
    let output = Command::new(env!("CARGO_BIN_EXE_argon"))
        .arg(&path)
        .output()
        .expect("spawn argon");
    std::fs::remove_file(&path).ok();
    output
}

#[test]
fn prints_and_exits_zero() {
    let output = run_program(
        "hello",
        r#"
        fn main
          ldgbl print
          const.s "hello world"
          call 1
          pop
          pshn
          ret
        end
        "#,
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello world\n");
}

#[test]
fn uncaught_panic_exits_one() {
    let output = run_program(
        "boom",
        r#"
        fn main
          const.s "boom"
          panic
        end
        "#,
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("boom"), "traceback missing: {stderr}");
}

#[test]
fn missing_file_exits_two() {
    let output = Command::new(env!("CARGO_BIN_EXE_argon"))
        .arg("/nonexistent/argon/program.arasm")
        .output()
        .expect("spawn argon");

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn assembly_errors_exit_two() {
    let output = run_program("bad", "fn main\n  frobnicate\nend\n");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn deferred_prints_run_in_reverse_order() {
    let output = run_program(
        "defer",
        r#"
        fn main
          ldgbl print
          const.s "a"
          dfr 1
          ldgbl print
          const.s "b"
          dfr 1
          ldgbl print
          const.s "c"
          call 1
          pop
          pshn
          ret
        end
        "#,
    );

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "c\nb\na\n");
}

#[test]
fn runtime_exit_sets_the_exit_code() {
    let output = run_program(
        "exitcode",
        r#"
        fn main
          impmod "runtime"
          ldattr "exit"
          const.i 7
          call 1
          ret
        end
        "#,
    );

    assert_eq!(output.status.code(), Some(7));
}

#[test]
fn sleep_observes_the_timer() {
    let output = run_program(
        "sleep",
        r#"
        fn main locals=1
          ldgbl now_ms
          call 0
          stlc 0
          ldgbl sleep_ms
          const.i 50
          call 1
          pop
          ldgbl assert
          ldgbl now_ms
          call 0
          ldlc 0
          sub
          const.i 50
          cmp ge
          const.s "slept too little"
          call 2
          pop
          pshn
          ret
        end
        "#,
    );

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[cfg(unix)]
#[test]
fn loopback_echo_roundtrip() {
    let output = run_program(
        "echo",
        r#"
        fn server arity=2 locals=4
          ; args: io(0), listener(1)
          ldlc 0
          ldattr "accept"
          ldlc 1
          call 1
          stlc 2
          ldlc 0
          ldattr "recv"
          ldlc 2
          const.i 5
          call 2
          stlc 3
          ldlc 0
          ldattr "send"
          ldlc 2
          ldlc 3
          call 2
          pop
          ldlc 0
          ldattr "close"
          ldlc 2
          call 1
          pop
          pshn
          ret
        end

        fn main locals=4
          impmod "io"
          stlc 0
          ldlc 0
          ldattr "listen"
          const.s "127.0.0.1"
          const.i 0
          call 2
          stlc 1
          ; spawn server(io, listener)
          const.nil
          const.nil
          const.code server
          mkfn 2
          ldlc 0
          ldlc 1
          spw 2
          stlc 2
          ; connect to the bound port
          ldlc 0
          ldattr "port"
          ldlc 1
          call 1
          stlc 3
          ldlc 0
          ldattr "connect"
          const.s "127.0.0.1"
          ldlc 3
          call 2
          stlc 3
          ; send the probe
          ldlc 0
          ldattr "send"
          ldlc 3
          const.s "hello"
          call 2
          pop
          ; read the echo back
          ldlc 0
          ldattr "recv"
          ldlc 3
          const.i 5
          call 2
          ; wait for the server fiber
          ldlc 2
          await
          pop
          ldgbl print
          mth 1
          call 1
          pop
          pshn
          ret
        end
        "#,
    );

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "b\"hello\"\n");
}
