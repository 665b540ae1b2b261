//! The event loop
//!
//! [`EventLoop`] is owned by the thread that created it and runs there. Other
//! threads talk to it through a [`LoopHandle`], which only touches the
//! thread-safe parts: the event queue, the keep-alive counter, the wake channel
//! and the worker pool.

use super::domain::DomainRouter;
use super::event::Event;
use super::exception::{Disposition, ExceptionProtocol, RegistrationProbe};
use super::keep_alive::{Handle, KeepAliveRegistry};
use super::native::{
    DispatchHook, NativeCallback, NativeEvent, NativeHandleId, NativeLoop, Wakeup,
    NATIVE_LOOP_VERSION,
};
use super::pool::{TaskHandle, WorkerPool};
use super::queue::EventQueue;
use super::stats::LoopStats;
use super::InstanceScope;
use crate::config::LoopConfig;
use crate::error::{LoopError, UncaughtError, EXIT_HANDLER_FAILED};
use crate::logging::{Logger, Logging};
use crossbeam::channel::{self, Sender};
use nodus_sdk::{CallbackError, CallbackRef, DomainRef, Value};
use parking_lot::{Mutex, RwLock};
use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Longest sleep while waiting on pool work of other owners
const POOL_PARK: Duration = Duration::from_millis(50);

// ============================================================================
// Shared State
// ============================================================================

/// The part of a loop other threads may touch
struct LoopShared {
    instance: u32,
    events: EventQueue,
    keep_alive: KeepAliveRegistry,
    pool: Arc<WorkerPool>,
    shared_pool: bool,
    wake: Sender<Wakeup>,
    wake_pending: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    next_handle: AtomicU64,
    active_domain: Arc<Mutex<Option<DomainRef>>>,
    work_dir: RwLock<PathBuf>,
    main_thread: ThreadId,
    log: Logger,
}

impl LoopShared {
    fn wake(&self, wakeup: Wakeup) {
        // Only fails once the native loop is gone, when nobody needs waking
        let _ = self.wake.send(wakeup);
    }

    fn post(&self, event: Event) {
        self.events.push(event);
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            self.wake(Wakeup::Posted);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// One-shot; `true` for the call that actually stopped the loop
    fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if !self.shared_pool {
            self.pool.shutdown();
        }
        self.log.debug(format_args!("stopped"));
        true
    }

    fn has_outstanding_work(&self) -> bool {
        self.keep_alive.is_referenced() || !self.events.is_empty() || self.pool.is_busy()
    }

    /// Only pool jobs holding no token of this loop keep it running
    fn waits_on_pool_only(&self) -> bool {
        !self.keep_alive.is_referenced() && self.events.is_empty() && self.pool.is_busy()
    }

    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    fn register(&self, callback: Arc<dyn NativeCallback>, timer: bool) -> NativeHandleId {
        let id = NativeHandleId(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let domain = self.active_domain.lock().clone();
        self.wake(Wakeup::Register {
            id,
            callback,
            domain,
            timer,
        });
        id
    }

    fn stats(&self) -> LoopStats {
        LoopStats {
            instance: self.instance,
            hook_count: self.keep_alive.hooks(),
            scheduled_task_count: self.pool.queued_tasks_count(),
            active_task_count: self.pool.active_task_count(),
            thread_count: self.pool.thread_count(),
            pending_event_count: self.events.len(),
            pending_events: self.events.describe(cfg!(debug_assertions)),
        }
    }
}

// ============================================================================
// Loop Handle
// ============================================================================

/// Thread-safe access to a loop
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Instance number of the loop
    pub fn instance(&self) -> u32 {
        self.shared.instance
    }

    /// Queue an event for the loop thread
    pub fn post(&self, event: Event) {
        self.shared.post(event);
    }

    /// Queue an unnamed callback invocation
    pub fn post_callback(&self, callback: CallbackRef, args: Vec<Value>) {
        self.post(Event::anonymous(callback, args));
    }

    /// Run `callback` on the loop thread with no arguments
    pub fn next_tick(&self, callback: CallbackRef) {
        self.post(Event::anonymous(callback, Vec::new()));
    }

    /// Keep the loop alive until the returned handle is closed
    pub fn acquire(&self) -> Handle {
        self.shared.keep_alive.acquire()
    }

    /// Run blocking `work` on the worker pool.
    ///
    /// The job runs under this loop's identity (see
    /// [`current_instance`](super::current_instance)) and keeps the loop alive
    /// until it returns.
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>, LoopError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let instance = self.shared.instance;
        let token = self.acquire();
        self.shared.pool.submit(move || {
            let _scope = InstanceScope::enter(instance);
            let result = work();
            drop(token);
            result
        })
    }

    /// Stop the loop from any thread
    pub fn interrupt(&self) {
        self.shared.wake(Wakeup::Interrupt);
    }

    /// Whether the loop has been stopped
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Whether the calling thread is the loop thread
    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }

    /// Domain active on the loop thread right now
    pub fn current_domain(&self) -> Option<DomainRef> {
        self.shared.active_domain.lock().clone()
    }

    /// Register a native handle; it is ref'd and captures the active domain
    pub fn register_native(&self, callback: Arc<dyn NativeCallback>) -> NativeHandleId {
        self.shared.register(callback, false)
    }

    /// Register a timer handle and arm it
    pub fn start_timer(
        &self,
        callback: Arc<dyn NativeCallback>,
        timeout: Duration,
        repeat: Option<Duration>,
    ) -> NativeHandleId {
        let id = self.shared.register(callback, true);
        self.rearm_timer(id, timeout, repeat);
        id
    }

    /// Re-arm an existing timer handle
    pub fn rearm_timer(&self, id: NativeHandleId, timeout: Duration, repeat: Option<Duration>) {
        self.shared.wake(Wakeup::StartTimer { id, timeout, repeat });
    }

    /// Disarm a timer handle (it stays registered)
    pub fn stop_timer(&self, id: NativeHandleId) {
        self.shared.wake(Wakeup::StopTimer(id));
    }

    /// Whether the handle keeps the loop alive
    pub fn set_ref(&self, id: NativeHandleId, referenced: bool) {
        self.shared.wake(Wakeup::SetRef { id, referenced });
    }

    /// Unregister a native handle; pending events for it are dropped
    pub fn close_native(&self, id: NativeHandleId) {
        self.shared.wake(Wakeup::Close(id));
    }

    /// Deliver a native event to a registered handle
    pub fn emit(&self, id: NativeHandleId, event: NativeEvent) {
        self.shared.wake(Wakeup::Emit { id, event });
    }

    /// Directory relative paths resolve against
    pub fn work_dir(&self) -> PathBuf {
        self.shared.work_dir.read().clone()
    }

    /// Resolve `path` against the work directory
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.shared.work_dir.read().join(path)
        }
    }

    /// The pool work is submitted to
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    /// Snapshot of the loop's bookkeeping
    pub fn stats(&self) -> LoopStats {
        self.shared.stats()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("instance", &self.shared.instance)
            .finish()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Loop-thread state
struct MainState {
    router: DomainRouter,
    protocol: ExceptionProtocol,
    pending: Option<UncaughtError>,
    sync_events: bool,
    log_events: bool,
    log: Logger,
}

impl MainState {
    fn offer(&self, error: &CallbackError) -> Disposition {
        let in_domain = self.router.active().is_some();
        self.protocol.offer(error, in_domain, &self.log)
    }
}

/// Hybrid event loop.
///
/// Not `Send`: it is driven by the thread that created it.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    native: NativeLoop,
    main: MainState,
    logging: Logging,
    _not_send: PhantomData<Rc<()>>,
}

impl EventLoop {
    /// Create a loop with its own worker pool
    pub fn new(config: LoopConfig, logging: &Logging) -> Result<Self, LoopError> {
        let pool = WorkerPool::new(config.pool.clone(), logging.get("pool"))?;
        pool.prestart_core_thread()?;
        Self::build(config, Arc::new(pool), false, logging)
    }

    /// Create a loop on a pool shared with other loops; `stop` leaves it running
    pub fn with_shared_pool(
        config: LoopConfig,
        pool: Arc<WorkerPool>,
        logging: &Logging,
    ) -> Result<Self, LoopError> {
        Self::build(config, pool, true, logging)
    }

    fn build(
        config: LoopConfig,
        pool: Arc<WorkerPool>,
        shared_pool: bool,
        logging: &Logging,
    ) -> Result<Self, LoopError> {
        if let Some(expected) = &config.expected_native_version {
            if expected != NATIVE_LOOP_VERSION {
                return Err(LoopError::VersionMismatch {
                    expected: expected.clone(),
                    found: NATIVE_LOOP_VERSION.to_string(),
                });
            }
        }

        let work_dir = match config.work_dir {
            Some(dir) => dir,
            None => env::current_dir().map_err(|e| {
                LoopError::Config(format!("cannot determine working directory: {}", e))
            })?,
        };

        let (wake_tx, wake_rx) = channel::unbounded();
        let keep_alive = KeepAliveRegistry::new(wake_tx.clone());
        let stopped = Arc::new(AtomicBool::new(false));
        let wake_pending = Arc::new(AtomicBool::new(false));
        let active_domain = Arc::new(Mutex::new(None));
        let log = logging.get("eventloop");

        let native = NativeLoop::new(
            wake_rx,
            keep_alive.clone(),
            stopped.clone(),
            wake_pending.clone(),
            logging.get("native"),
        );

        log.debug(format_args!(
            "loop {} created, pool {}{}",
            config.instance,
            pool.describe_config(),
            if shared_pool { " (shared)" } else { "" }
        ));

        let shared = Arc::new(LoopShared {
            instance: config.instance,
            events: EventQueue::new(),
            keep_alive,
            pool,
            shared_pool,
            wake: wake_tx,
            wake_pending,
            stopped,
            next_handle: AtomicU64::new(0),
            active_domain: active_domain.clone(),
            work_dir: RwLock::new(work_dir),
            main_thread: thread::current().id(),
            log: log.clone(),
        });

        Ok(Self {
            shared,
            native,
            main: MainState {
                router: DomainRouter::new(active_domain),
                protocol: ExceptionProtocol::default(),
                pending: None,
                sync_events: config.sync_events,
                log_events: config.log_events,
                log,
            },
            logging: logging.clone(),
            _not_send: PhantomData,
        })
    }

    fn assert_main_thread(&self) {
        debug_assert!(
            self.shared.is_main_thread(),
            "event loop {} used from non-loop thread {:?}",
            self.shared.instance,
            thread::current().name()
        );
    }

    /// Thread-safe handle to this loop
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Instance number
    pub fn instance(&self) -> u32 {
        self.shared.instance
    }

    /// Engine version
    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Native loop version
    pub fn native_version(&self) -> &'static str {
        NATIVE_LOOP_VERSION
    }

    /// Logging context this loop was created with
    pub fn logging(&self) -> &Logging {
        &self.logging
    }

    /// The pool work is submitted to
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    /// Native loop diagnostics
    pub fn native(&self) -> &NativeLoop {
        &self.native
    }

    /// Directory relative paths resolve against
    pub fn work_dir(&self) -> PathBuf {
        self.shared.work_dir.read().clone()
    }

    /// Change the work directory
    pub fn set_work_dir(&self, dir: impl Into<PathBuf>) {
        *self.shared.work_dir.write() = dir.into();
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Queue an event
    pub fn post(&self, event: Event) {
        self.shared.post(event);
    }

    /// Queue an unnamed callback invocation
    pub fn post_callback(&self, callback: CallbackRef, args: Vec<Value>) {
        self.post(Event::anonymous(callback, args));
    }

    /// Run `callback` on a later pass with no arguments
    pub fn next_tick(&self, callback: CallbackRef) {
        self.post(Event::anonymous(callback, Vec::new()));
    }

    /// Run `callback` on a later pass inside `domain`
    pub fn next_tick_with_domain(&self, callback: CallbackRef, domain: Option<DomainRef>) {
        self.assert_main_thread();
        self.post(Event::anonymous(callback, Vec::new()).in_domain(domain));
    }

    /// Keep the loop alive until the returned handle is closed
    pub fn acquire(&self) -> Handle {
        self.shared.keep_alive.acquire()
    }

    /// Run blocking `work` on the worker pool
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>, LoopError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle().submit(work)
    }

    /// Stop the loop from any thread (through its handle)
    pub fn interrupt(&self) {
        self.shared.wake(Wakeup::Interrupt);
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Run until nothing is outstanding, the loop is stopped, or a callback
    /// error goes unhandled.
    pub fn run(&mut self) -> Result<(), LoopError> {
        self.assert_main_thread();
        let _scope = InstanceScope::enter(self.shared.instance);
        self.shared.pool.allow_core_thread_timeout(true);
        self.main.log.debug(format_args!("running {}", self));

        loop {
            if self.shared.is_stopped() {
                break;
            }

            Driver {
                shared: &self.shared,
                main: &mut self.main,
            }
            .process_queued_events()?;

            self.native.run(&mut Driver {
                shared: &self.shared,
                main: &mut self.main,
            });

            if let Some(error) = self.main.pending.take() {
                self.main
                    .log
                    .debug(format_args!("loop {} failed: {}", self.shared.instance, error));
                return Err(error.into());
            }

            if self.shared.is_stopped() || !self.shared.has_outstanding_work() {
                break;
            }
            if self.shared.waits_on_pool_only() {
                self.park_on_pool();
            }
        }

        self.main.log.debug(format_args!("finished {}", self));
        Ok(())
    }

    /// Sleep until the pool goes idle or something wakes the loop
    fn park_on_pool(&mut self) {
        let wake = self.shared.wake.clone();
        let _watch = self.shared.pool.watch_idle(Box::new(move || {
            let _ = wake.send(Wakeup::PoolIdle);
        }));
        // The last job may have finished before the watch was in place
        if self.shared.pool.is_busy() {
            self.native.park(POOL_PARK);
        }
    }

    /// Dispatch queued events on the loop thread.
    ///
    /// Drains the whole queue, or a single event when synchronous processing
    /// is disabled. Events of disposed domains are dropped.
    pub fn process_queued_events(&mut self) -> Result<(), LoopError> {
        self.assert_main_thread();
        Driver {
            shared: &self.shared,
            main: &mut self.main,
        }
        .process_queued_events()?;
        Ok(())
    }

    /// Whether `process_queued_events` drains everything (`true`) or one event
    pub fn enable_sync_events_processing(&mut self, enable: bool) {
        self.assert_main_thread();
        self.main.sync_events = enable;
    }

    /// Stop the loop: shut down an owned pool and close every native handle
    pub fn stop(&mut self) {
        self.assert_main_thread();
        if self.shared.stop() {
            self.native.close();
        }
    }

    /// Whether the loop has been stopped
    pub fn stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Forget every keep-alive handle and, with an owned pool, every queued task
    pub fn release(&self) {
        self.shared.keep_alive.reset();
        if !self.shared.shared_pool {
            self.shared.pool.clear_queued_tasks();
        }
    }

    /// Whether the calling thread is the loop thread
    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }

    // ------------------------------------------------------------------------
    // Uncaught Exceptions
    // ------------------------------------------------------------------------

    /// Install the listener probe and the uncaught-exception handler
    pub fn set_uncaught_exception_handler(&mut self, probe: RegistrationProbe, handler: CallbackRef) {
        self.assert_main_thread();
        self.main.protocol.install(probe, handler);
    }

    /// Offer `error` to the script layer; `true` if it was handled
    pub fn handle_callback_exception(&mut self, error: &CallbackError) -> bool {
        self.assert_main_thread();
        self.main.offer(error).is_handled()
    }

    // ------------------------------------------------------------------------
    // Domains
    // ------------------------------------------------------------------------

    /// Set the ambient domain
    pub fn set_domain(&mut self, domain: Option<DomainRef>) {
        self.assert_main_thread();
        self.main.router.set_active(domain);
    }

    /// Active domain
    pub fn domain(&self) -> Option<DomainRef> {
        self.main.router.active().cloned()
    }

    /// Whether `domain` was disposed
    pub fn is_disposed(&self, domain: &DomainRef) -> bool {
        self.main.router.is_disposed(domain)
    }

    /// Enter `domain`
    pub fn enter_domain(&mut self, domain: &DomainRef) {
        self.assert_main_thread();
        self.main.router.enter(domain);
    }

    /// Exit `domain`
    pub fn exit_domain(&mut self, domain: &DomainRef) {
        self.assert_main_thread();
        self.main.router.exit(domain);
    }

    /// Keep-alive counter and pulse diagnostics
    pub fn keep_alive(&self) -> &KeepAliveRegistry {
        &self.shared.keep_alive
    }

    /// Snapshot of the loop's bookkeeping
    pub fn stats(&self) -> LoopStats {
        self.shared.stats()
    }
}

impl fmt::Display for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.stats())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("instance", &self.shared.instance)
            .field("stopped", &self.stopped())
            .field("native", &self.native)
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if !self.shared.shared_pool {
            self.shared.pool.shutdown();
        }
    }
}

// ============================================================================
// Dispatch Envelope
// ============================================================================

/// Borrow of the loop-thread state lent to the native loop for one run
struct Driver<'a> {
    shared: &'a LoopShared,
    main: &'a mut MainState,
}

impl Driver<'_> {
    fn process_queued_events(&mut self) -> Result<(), UncaughtError> {
        while let Some(event) = self.shared.events.pop() {
            if let Some(domain) = event.domain() {
                if self.main.router.is_disposed(domain) {
                    self.main
                        .log
                        .trace(format_args!("dropping {} (domain disposed)", event));
                    continue;
                }
            }
            self.process_event(&event)?;
            if !self.main.sync_events {
                break;
            }
        }
        Ok(())
    }

    fn process_event(&mut self, event: &Event) -> Result<(), UncaughtError> {
        if self.main.log_events {
            self.main.log.debug(format_args!("dispatching {}", event));
        }
        let domain = event.domain();
        if let Some(domain) = domain {
            self.main.router.enter(domain);
        }
        // Route while the domain is still active so it can claim the error
        let result = match event.invoke() {
            Ok(()) => Ok(()),
            Err(error) => self.route(error),
        };
        if let Some(domain) = domain {
            self.main.router.exit(domain);
        }
        result
    }

    /// Offer a callback error; unhandled errors stop the loop
    fn route(&mut self, error: CallbackError) -> Result<(), UncaughtError> {
        match self.main.offer(&error) {
            Disposition::Handled => Ok(()),
            Disposition::Unhandled => {
                self.shared.stop();
                Err(UncaughtError::new(error))
            }
            Disposition::HandlerFailed(handler_error) => {
                self.shared.stop();
                let mut uncaught = UncaughtError::new(error);
                uncaught.suppress(handler_error);
                uncaught.exit_code = EXIT_HANDLER_FAILED;
                Err(uncaught)
            }
        }
    }

    fn stash(&mut self, error: UncaughtError) {
        if let Some(pending) = self.main.pending.as_mut() {
            pending.suppress(error.root);
            pending.suppressed.extend(error.suppressed);
            return;
        }
        self.main.pending = Some(error);
    }
}

impl DispatchHook for Driver<'_> {
    fn dispatch(&mut self, callback: &dyn NativeCallback, domain: Option<&DomainRef>, event: &NativeEvent) {
        if let Some(domain) = domain {
            if self.main.router.is_disposed(domain) {
                return;
            }
            self.main.router.enter(domain);
        }
        let result = match callback.on_event(event) {
            Ok(()) => Ok(()),
            Err(error) => self.route(error),
        };
        if let Some(domain) = domain {
            self.main.router.exit(domain);
        }
        match result {
            Ok(()) => self.drain(),
            Err(error) => self.stash(error),
        }
    }

    fn drain(&mut self) {
        if let Err(error) = self.process_queued_events() {
            self.stash(error);
        }
    }

    fn has_deferred(&self) -> bool {
        !self.main.sync_events && !self.shared.events.is_empty()
    }

    fn interrupt(&mut self) {
        self.shared.stop();
    }
}
