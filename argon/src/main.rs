// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Argon host executable.
//!
//! Loads a textual-assembly program (see [`asm`]), hands it to the runtime
//! and maps the outcome to an exit code: 0 on success, 1 on an uncaught
//! panic, 2 on a usage or assembly error. `runtime.exit(n)` overrides the
//! panic code with `n`.

mod asm;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arvm::object::error;
use arvm::{Config, Namespace, Runtime};

#[derive(Parser, Debug)]
#[command(name = "argon", about = "The Argon runtime", version)]
struct Args {
    /// Program to run, in textual bytecode-assembly form.
    file: std::path::PathBuf,

    /// Number of virtual cores (0 = detected parallelism).
    #[arg(long, env = "ARGON_VCORES", default_value_t = 0)]
    vcores: usize,

    /// Hard cap on OS worker threads.
    #[arg(long, env = "ARGON_MAX_OST", default_value_t = 256)]
    max_ost: usize,

    /// Fiber shell pool size.
    #[arg(long, env = "ARGON_FIBER_POOL", default_value_t = 128)]
    fiber_pool: usize,

    /// Suppress stack traces of unhandled panics.
    #[arg(long, env = "ARGON_NO_STACK_TRACE")]
    no_stack_trace: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("argon: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let code = asm::assemble(&source)
        .with_context(|| format!("failed to assemble {}", args.file.display()))?;

    let runtime = Runtime::new(Config {
        vcores: args.vcores,
        max_ost: args.max_ost,
        fiber_pool: args.fiber_pool,
        stack_trace: !args.no_stack_trace,
        ..Config::default()
    })?;

    let globals = Arc::new(Namespace::new());
    let result = runtime.eval_blocking(code, globals);

    runtime.shutdown(Duration::from_secs(5));

    match result {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            // runtime.exit(n) carries its code in the error message
            if error::error_is(&err, error::KIND_RUNTIME_EXIT) {
                let code = error::error_message(&err)
                    .and_then(|m| m.parse::<u8>().ok())
                    .unwrap_or(1);
                return Ok(ExitCode::from(code));
            }

            Ok(ExitCode::from(1))
        }
    }
}
