// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime context.
//!
//! A [`Runtime`] owns the scheduler, the event loop, the builtin namespace
//! and the module registry. Evaluation always happens on scheduler workers;
//! host threads hand code objects in through [`Runtime::eval`] and block on
//! the returned future if they want the result.

pub mod call;
pub mod eval;
pub mod fiber;
pub mod frame;
pub mod generator;
pub mod native;
pub mod opcode;
pub mod panicking;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use hashbrown::HashMap;

use crate::evloop::EventLoop;
use crate::object::code::Code;
use crate::object::namespace::Namespace;
use crate::object::{ObjRef, OpResult, error, future};
use crate::sched::Scheduler;
use crate::vm::fiber::{Fiber, FiberRef};
use crate::vm::frame::Frame;

/// Tunables, all overridable from the environment by the host.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of virtual cores; 0 means detected hardware parallelism.
    pub vcores: usize,
    /// Hard cap on OS worker threads.
    pub max_ost: usize,
    /// Bounded per-VCore run queue length.
    pub vcore_queue: usize,
    /// Bounded fiber shell pool size.
    pub fiber_pool: usize,
    /// Print tracebacks of unhandled panics to stderr.
    pub stack_trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vcores: 0,
            max_ost: 256,
            vcore_queue: 256,
            fiber_pool: 128,
            stack_trace: true,
        }
    }
}

pub struct RuntimeInner {
    pub config: Config,
    pub sched: Scheduler,
    pub evloop: EventLoop,
    pub builtins: Arc<Namespace>,
    modules: Mutex<HashMap<String, ObjRef>>,
}

/// Owning handle; dropping it shuts the runtime down.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

// === impl RuntimeInner ===

impl RuntimeInner {
    /// Fetch a fiber shell from the pool or allocate a fresh one.
    pub fn alloc_fiber(&self) -> FiberRef {
        self.sched.alloc_fiber()
    }

    /// Mark `fiber` runnable and hand it to the scheduler.
    pub fn spawn_fiber(self: &Arc<Self>, fiber: FiberRef) {
        self.sched.spawn(fiber, self);
    }

    /// Resolve a module by name against the builtin registry.
    pub fn load_module(&self, name: &str) -> OpResult<ObjRef> {
        let modules = self.modules.lock().unwrap();
        modules
            .get(name)
            .cloned()
            .ok_or_else(|| error::value_error(format!("no module named '{name}'")))
    }

    pub fn register_module(&self, name: &str, module: ObjRef) {
        self.modules.lock().unwrap().insert(name.to_string(), module);
    }
}

// === impl Runtime ===

impl Runtime {
    /// Bring up a runtime: builtins, module registry and the event loop
    /// thread. Workers start on demand when fibers become runnable.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let inner = Arc::new_cyclic(|weak| RuntimeInner {
            sched: Scheduler::new(&config),
            evloop: EventLoop::new(weak.clone()),
            builtins: Arc::new(Namespace::new()),
            modules: Mutex::new(HashMap::new()),
            config,
        });

        crate::builtins::install(&inner);
        inner
            .evloop
            .start()
            .context("failed to start the event loop")?;

        Ok(Self { inner })
    }

    pub fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// Evaluate a code object against `globals` on a fresh fiber, returning
    /// the future publishing its terminal result.
    pub fn eval(&self, code: Arc<Code>, globals: Arc<Namespace>) -> ObjRef {
        let qname = code.qname.clone();
        let frame = Frame::new(code, globals, qname);

        let fiber = self.inner.alloc_fiber();
        let fut = future::future_new();
        fiber.attach_future(fut.clone());
        fiber.core.lock().unwrap().frames.push(frame);

        self.inner.spawn_fiber(fiber);
        fut
    }

    /// Evaluate and block the calling OS thread until the result is
    /// published.
    ///
    /// # Errors
    ///
    /// The error object of the uncaught panic that terminated the fiber.
    pub fn eval_blocking(
        &self,
        code: Arc<Code>,
        globals: Arc<Namespace>,
    ) -> Result<ObjRef, ObjRef> {
        let fut = self.eval(code, globals);
        future::as_future(&fut)
            .expect("eval returns a future")
            .wait_blocking()
    }

    /// Fire-and-forget: run `func` with `args` on a fresh fiber.
    ///
    /// # Errors
    ///
    /// `TypeError` when `func` is not a plain callable or the arguments do
    /// not satisfy its arity.
    pub fn spawn(&self, func: &ObjRef, args: &[ObjRef]) -> Result<(), ObjRef> {
        let Some(function) = crate::object::function::as_function(func) else {
            return Err(error::type_error(format!(
                "'{}' is not callable",
                func.type_name()
            )));
        };

        let frame = call::bind_frame(function, args, None)?;

        let fiber = self.inner.alloc_fiber();
        fiber.core.lock().unwrap().frames.push(frame);
        self.inner.spawn_fiber(fiber);
        Ok(())
    }

    /// Stop workers and the event loop, waiting up to `timeout` for the
    /// workers to drain.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.evloop.shutdown();
        self.inner.sched.shutdown(timeout)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

static_assertions::assert_impl_all!(Runtime: Send, Sync);
static_assertions::assert_impl_all!(Fiber: Send, Sync);
