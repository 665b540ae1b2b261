//! Program lifecycle on one event loop

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use nodus_engine::{EventLoop, Handle, LoopError, LoopHandle, Logger, Logging, UncaughtError, WorkerPool};
use nodus_sdk::{CallbackError, CallbackRef};
use nodus_stdlib::{Timers, Zlib};
use nodus_stdlib_posix::{Dns, Fs};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Program
// ============================================================================

/// Script-layer entry points the runtime drives
pub trait Program {
    /// Load the program and schedule its first work
    fn init(&mut self, cx: &mut Context<'_>) -> Result<(), CallbackError>;

    /// Runs once the loop is done, whether or not it failed (`process.exit`)
    fn finalize(&mut self, _cx: &mut Context<'_>) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Standard library modules bound to the runtime's loop
#[derive(Clone, Debug)]
pub struct Modules {
    /// `timers`
    pub timers: Timers,
    /// `zlib`
    pub zlib: Zlib,
    /// `fs`
    pub fs: Fs,
    /// `dns`
    pub dns: Dns,
}

impl Modules {
    fn new(event_loop: &EventLoop) -> Self {
        let handle = event_loop.handle();
        let logging = event_loop.logging();
        Self {
            timers: Timers::new(handle.clone(), logging),
            zlib: Zlib::new(handle.clone(), logging),
            fs: Fs::new(handle.clone(), logging),
            dns: Dns::new(handle, logging),
        }
    }
}

/// What a [`Program`] sees during init and finalization
pub struct Context<'a> {
    event_loop: &'a mut EventLoop,
    modules: &'a Modules,
    exit_code: &'a mut i32,
}

impl<'a> Context<'a> {
    /// The loop the program runs on
    pub fn event_loop(&mut self) -> &mut EventLoop {
        self.event_loop
    }

    /// Standard library modules
    pub fn modules(&self) -> &Modules {
        self.modules
    }

    /// Exit code reported when the run succeeds
    pub fn exit_code(&self) -> i32 {
        *self.exit_code
    }

    /// Set the exit code reported when the run succeeds (`process.exitCode`)
    pub fn set_exit_code(&mut self, code: i32) {
        *self.exit_code = code;
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Owns one event loop and drives a [`Program`] on it.
///
/// Not `Send`, like the loop inside it; use [`RuntimeCloser`] from other threads.
pub struct Runtime {
    config: RuntimeConfig,
    event_loop: EventLoop,
    modules: Modules,
    listener: Option<CallbackRef>,
    keep_alive: Option<Arc<Handle>>,
    closed: Arc<AtomicBool>,
    exit_code: i32,
    log: Logger,
}

impl Runtime {
    /// Create a runtime whose loop owns its worker pool
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let logging = Logging::new(config.verbose);
        let event_loop = EventLoop::new(config.loop_config(), &logging)?;
        Ok(Self::assemble(config, event_loop))
    }

    /// Create a runtime on a pool shared with other runtimes
    pub fn with_shared_pool(config: RuntimeConfig, pool: Arc<WorkerPool>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let logging = Logging::new(config.verbose);
        let event_loop = EventLoop::with_shared_pool(config.loop_config(), pool, &logging)?;
        Ok(Self::assemble(config, event_loop))
    }

    fn assemble(config: RuntimeConfig, event_loop: EventLoop) -> Self {
        // Embedded hosts close the runtime from their own thread
        let keep_alive = config.embedded.then(|| Arc::new(event_loop.acquire()));
        let log = event_loop.logging().get("runtime");
        let modules = Modules::new(&event_loop);
        Self {
            config,
            event_loop,
            modules,
            listener: None,
            keep_alive,
            closed: Arc::new(AtomicBool::new(false)),
            exit_code: 0,
            log,
        }
    }

    /// Notify `listener` with `started` and `stopped`
    pub fn with_listener(mut self, listener: CallbackRef) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The runtime's event loop
    pub fn event_loop(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    /// Thread-safe handle to the loop
    pub fn handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    /// Standard library modules
    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    /// Exit code of the last run (0 until something sets it)
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// A `Send` handle that ends an embedded runtime
    pub fn closer(&self) -> RuntimeCloser {
        RuntimeCloser {
            keep_alive: self.keep_alive.clone(),
            handle: self.event_loop.handle(),
            closed: self.closed.clone(),
        }
    }

    /// Run `program` to completion and return its exit code.
    ///
    /// Errors the uncaught-exception handler declines end the run with the
    /// first one as root cause; failures during finalization or in the
    /// `stopped` notification are attached to it as suppressed.
    pub fn run(&mut self, program: &mut dyn Program) -> Result<i32, RuntimeError> {
        self.log
            .debug(format_args!("starting {} on {}", self.config.name, self.event_loop));

        let outcome = self.run_program(program);
        self.event_loop.stop();
        let stopped = self.emit("stopped");

        let outcome = match (outcome, stopped) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(late)) => Err(LoopError::from(UncaughtError::new(late))),
            (Err(mut root), Err(late)) => {
                if let LoopError::Uncaught(uncaught) = &mut root {
                    uncaught.suppress(late);
                }
                Err(root)
            }
            (Err(root), Ok(())) => Err(root),
        };

        match outcome {
            Ok(()) => {
                self.log
                    .debug(format_args!("{} exited with {}", self.config.name, self.exit_code));
                Ok(self.exit_code)
            }
            Err(error) => {
                self.exit_code = error.exit_code();
                self.log
                    .debug(format_args!("{} failed with {}: {}", self.config.name, self.exit_code, error));
                Err(error.into())
            }
        }
    }

    fn run_program(&mut self, program: &mut dyn Program) -> Result<(), LoopError> {
        let init = program.init(&mut self.context());
        self.settle(init, program)?;
        let started = self.emit("started");
        self.settle(started, program)?;

        // A handled error leaves the loop running, timers may still fire
        let root = match self.event_loop.run() {
            Ok(()) => None,
            Err(LoopError::Uncaught(error)) => Some(error),
            Err(other) => {
                if let Err(late) = program.finalize(&mut self.context()) {
                    self.log
                        .warn(format_args!("finalization failed after {}: {}", other, late));
                }
                return Err(other);
            }
        };
        if root.is_some() {
            self.event_loop.stop();
        }

        match (program.finalize(&mut self.context()), root) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(root)) => Err(root.into()),
            (Err(late), Some(mut root)) => {
                root.suppress(late);
                Err(root.into())
            }
            (Err(late), None) => {
                if self.event_loop.handle_callback_exception(&late) {
                    Ok(())
                } else {
                    Err(UncaughtError::new(late).into())
                }
            }
        }
    }

    /// Offer a startup failure; an unhandled one finalizes and becomes the root cause
    fn settle(&mut self, result: Result<(), CallbackError>, program: &mut dyn Program) -> Result<(), LoopError> {
        let error = match result {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        if self.event_loop.handle_callback_exception(&error) {
            return Ok(());
        }
        let mut root = UncaughtError::new(error);
        if let Err(late) = program.finalize(&mut self.context()) {
            root.suppress(late);
        }
        Err(root.into())
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            event_loop: &mut self.event_loop,
            modules: &self.modules,
            exit_code: &mut self.exit_code,
        }
    }

    fn emit(&self, event: &str) -> Result<(), CallbackError> {
        match &self.listener {
            Some(listener) => listener.call(Some(event), &[]),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.config.name)
            .field("loop", &self.event_loop.instance())
            .field("embedded", &self.config.embedded)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

// ============================================================================
// RuntimeCloser
// ============================================================================

/// Ends an embedded runtime from any thread.
///
/// The first `close` releases the runtime's keep-alive handle and interrupts
/// the loop; later calls do nothing. A non-embedded runtime ignores it.
#[derive(Clone)]
pub struct RuntimeCloser {
    keep_alive: Option<Arc<Handle>>,
    handle: LoopHandle,
    closed: Arc<AtomicBool>,
}

impl RuntimeCloser {
    /// Stop the runtime
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(keep_alive) = &self.keep_alive {
            keep_alive.close();
            self.handle.interrupt();
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RuntimeCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeCloser")
            .field("loop", &self.handle.instance())
            .field("closed", &self.is_closed())
            .finish()
    }
}
