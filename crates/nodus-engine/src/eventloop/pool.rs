//! Worker pool for blocking work
//!
//! Thread-pool-executor semantics:
//! 1. Fewer than `core_threads` threads: start a new thread for the job
//! 2. Otherwise enqueue the job
//! 3. Queue full and fewer than `max_threads`: start a new thread for the job
//! 4. Otherwise run the job on the submitting thread (caller-runs)
//!
//! Jobs are never dropped for lack of capacity. Idle threads above the core
//! count exit after `keep_alive`; once core timeout is allowed, all idle
//! threads do.
//!
//! Loops waiting on pool work they hold no keep-alive token for register an
//! [`IdleWatch`] and are notified when the last running job finishes.

use crate::config::PoolConfig;
use crate::error::{LoopError, TaskError};
use crate::logging::Logger;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Re-poll interval for threads that may not time out
const IDLE_POLL: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Called when the pool runs out of work
pub(crate) type IdleNotify = Box<dyn Fn() + Send + Sync + 'static>;

/// Pool of named worker threads
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    keep_alive: Duration,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    state: Mutex<PoolState>,
    terminated: Condvar,
    active: AtomicUsize,
    core_timeout: AtomicBool,
    next_thread: AtomicUsize,
    idle_watchers: Mutex<Vec<(u64, IdleNotify)>>,
    next_watcher: AtomicU64,
    log: Logger,
}

#[derive(Default)]
struct PoolState {
    threads: usize,
}

impl WorkerPool {
    /// Create a pool; no thread is started until work arrives
    pub fn new(config: PoolConfig, log: Logger) -> Result<Self, LoopError> {
        config.validate()?;
        let (sender, receiver) = match config.queue_size {
            Some(capacity) => channel::bounded(capacity),
            None => channel::unbounded(),
        };
        log.debug(format_args!("starting pool {}", describe(&config)));
        Ok(Self {
            inner: Arc::new(PoolInner {
                keep_alive: config.keep_alive(),
                config,
                sender: Mutex::new(Some(sender)),
                receiver,
                state: Mutex::new(PoolState::default()),
                terminated: Condvar::new(),
                active: AtomicUsize::new(0),
                core_timeout: AtomicBool::new(false),
                next_thread: AtomicUsize::new(0),
                idle_watchers: Mutex::new(Vec::new()),
                next_watcher: AtomicU64::new(0),
                log,
            }),
        })
    }

    /// Run `work` on a pool thread (or on the caller when saturated).
    ///
    /// Fails only when the pool has been shut down.
    pub fn submit<F, T>(&self, work: F) -> Result<TaskHandle<T>, LoopError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(TaskSlot::new());
        let completer = Completer {
            slot: slot.clone(),
            done: false,
        };
        self.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            completer.complete(result);
        }))?;
        Ok(TaskHandle { slot })
    }

    fn execute(&self, job: Job) -> Result<(), LoopError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let sender = match inner.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Err(LoopError::PoolShutdown),
        };

        if state.threads < inner.config.core_threads {
            if let Err((_, Some(job))) = self.spawn_worker(&mut state, Some(job)) {
                drop(state);
                self.run_on_caller(job);
            }
            return Ok(());
        }

        match sender.try_send(job) {
            Ok(()) => {
                if state.threads == 0 {
                    // No core threads configured; someone has to drain the queue
                    let _ = self.spawn_worker(&mut state, None);
                }
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                if state.threads < inner.config.max_threads() {
                    if let Err((_, Some(job))) = self.spawn_worker(&mut state, Some(job)) {
                        drop(state);
                        self.run_on_caller(job);
                    }
                } else {
                    let threads = state.threads;
                    drop(state);
                    inner.log.warn(format_args!(
                        "pool saturated ({} threads, {} queued), running task on caller",
                        threads,
                        inner.receiver.len()
                    ));
                    self.run_on_caller(job);
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(LoopError::PoolShutdown),
        }
    }

    /// Start a worker, optionally handing it its first job.
    ///
    /// On spawn failure the first job is handed back.
    fn spawn_worker(
        &self,
        state: &mut PoolState,
        first: Option<Job>,
    ) -> Result<(), (io::Error, Option<Job>)> {
        let n = self.inner.next_thread.fetch_add(1, Ordering::Relaxed);
        // A handed-off job is active from now, not from when the thread starts
        let counted = first.is_some();
        if counted {
            self.inner.active.fetch_add(1, Ordering::AcqRel);
        }
        let handoff = Arc::new(Mutex::new(first));
        let thread_handoff = handoff.clone();
        let inner = self.inner.clone();

        let spawned = thread::Builder::new()
            .name(format!("nodus-task-{}", n))
            .spawn(move || {
                let first = thread_handoff.lock().take();
                worker_loop(inner, first);
            });

        match spawned {
            Ok(_) => {
                state.threads += 1;
                Ok(())
            }
            Err(e) => {
                self.inner
                    .log
                    .error(format_args!("failed to spawn pool thread: {}", e));
                let job = handoff.lock().take();
                if counted {
                    self.inner.active.fetch_sub(1, Ordering::AcqRel);
                }
                Err((e, job))
            }
        }
    }

    /// Start a core thread ahead of the first job.
    ///
    /// Returns `false` when all core threads are already running.
    pub fn prestart_core_thread(&self) -> Result<bool, LoopError> {
        let mut state = self.inner.state.lock();
        if state.threads >= self.inner.config.core_threads || self.is_shutdown() {
            return Ok(false);
        }
        self.spawn_worker(&mut state, None)
            .map(|()| true)
            .map_err(|(e, _)| LoopError::Spawn(e))
    }

    fn run_on_caller(&self, job: Job) {
        job();
    }

    /// Whether a job is running right now
    pub fn has_active_tasks(&self) -> bool {
        self.active_task_count() > 0
    }

    /// Number of jobs running right now
    pub fn active_task_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether jobs are waiting for a thread
    pub fn has_queued_tasks(&self) -> bool {
        !self.inner.receiver.is_empty()
    }

    /// Number of jobs waiting for a thread
    pub fn queued_tasks_count(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Free queue slots (`usize::MAX` when unbounded)
    pub fn queued_tasks_remaining_capacity(&self) -> usize {
        match self.inner.config.queue_size {
            Some(capacity) => capacity.saturating_sub(self.inner.receiver.len()),
            None => usize::MAX,
        }
    }

    /// Queue capacity (`None` when unbounded)
    pub fn task_queue_size(&self) -> Option<usize> {
        self.inner.config.queue_size
    }

    /// Live worker threads
    pub fn thread_count(&self) -> usize {
        self.inner.state.lock().threads
    }

    /// Drop every queued job; their handles resolve to `Cancelled`
    pub fn clear_queued_tasks(&self) -> usize {
        let mut cleared = 0;
        while self.inner.receiver.try_recv().is_ok() {
            cleared += 1;
        }
        if cleared > 0 {
            self.inner
                .log
                .debug(format_args!("cleared {} queued tasks", cleared));
        }
        cleared
    }

    /// Refuse new work. Queued jobs still run, then the threads exit.
    pub fn shutdown(&self) {
        if self.inner.sender.lock().take().is_some() {
            self.inner.log.debug(format_args!("pool shut down"));
        }
    }

    /// Whether `shutdown` was called
    pub fn is_shutdown(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Call `notify` each time the pool goes idle, until the watch is dropped
    pub(crate) fn watch_idle(&self, notify: IdleNotify) -> IdleWatch {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner.idle_watchers.lock().push((id, notify));
        IdleWatch {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Whether jobs are running or waiting
    pub fn is_busy(&self) -> bool {
        self.has_active_tasks() || self.has_queued_tasks()
    }

    /// Let idle core threads time out as well
    pub fn allow_core_thread_timeout(&self, allow: bool) {
        self.inner.core_timeout.store(allow, Ordering::Release);
    }

    /// Wait until every worker thread has exited; `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.threads > 0 {
            if self.inner.terminated.wait_until(&mut state, deadline).timed_out() {
                return state.threads == 0;
            }
        }
        true
    }

    /// Pool sizing
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// One-line sizing summary
    pub fn describe_config(&self) -> String {
        describe(&self.inner.config)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("active", &self.active_task_count())
            .field("queued", &self.queued_tasks_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn describe(config: &PoolConfig) -> String {
    fn bound(n: Option<usize>) -> String {
        n.map_or_else(|| "unbounded".to_string(), |n| n.to_string())
    }
    format!(
        "{{coreThreads: {}, maxThreads: {}, threadTimeout: {}s, queueSize: {}}}",
        config.core_threads,
        bound(config.max_threads),
        config.keep_alive_secs,
        bound(config.queue_size)
    )
}

// ============================================================================
// Worker Loop
// ============================================================================

fn worker_loop(inner: Arc<PoolInner>, first: Option<Job>) {
    if let Some(job) = first {
        inner.finish_job(job);
    }

    loop {
        let wait = if inner.may_time_out() {
            inner.keep_alive
        } else {
            inner.keep_alive.max(IDLE_POLL)
        };

        match inner.receiver.recv_timeout(wait) {
            Ok(job) => inner.run_job(job),
            Err(RecvTimeoutError::Timeout) => {
                let mut state = inner.state.lock();
                let surplus = state.threads > inner.config.core_threads
                    || inner.core_timeout.load(Ordering::Acquire);
                if surplus && inner.receiver.is_empty() {
                    state.threads -= 1;
                    inner.terminated.notify_all();
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let mut state = inner.state.lock();
                state.threads -= 1;
                inner.terminated.notify_all();
                return;
            }
        }
    }
}

impl PoolInner {
    fn may_time_out(&self) -> bool {
        self.core_timeout.load(Ordering::Acquire) || self.state.lock().threads > self.config.core_threads
    }

    fn run_job(&self, job: Job) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.finish_job(job);
    }

    /// Run a job already counted as active
    fn finish_job(&self, job: Job) {
        job();
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 && self.receiver.is_empty() {
            for (_, notify) in self.idle_watchers.lock().iter() {
                notify();
            }
        }
    }
}

/// Registration made by [`WorkerPool::watch_idle`]; dropping it unregisters
pub(crate) struct IdleWatch {
    inner: Arc<PoolInner>,
    id: u64,
}

impl Drop for IdleWatch {
    fn drop(&mut self) {
        self.inner.idle_watchers.lock().retain(|(id, _)| *id != self.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Task Handles
// ============================================================================

enum SlotState<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
}

struct TaskSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> TaskSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        }
    }

    fn finish(&self, result: Result<T, TaskError>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Ready(result);
            self.ready.notify_all();
        }
    }
}

/// Resolves the slot exactly once; a job dropped unrun resolves it as cancelled
struct Completer<T> {
    slot: Arc<TaskSlot<T>>,
    done: bool,
}

impl<T> Completer<T> {
    fn complete(mut self, result: Result<T, TaskError>) {
        self.slot.finish(result);
        self.done = true;
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.slot.finish(Err(TaskError::Cancelled));
        }
    }
}

/// Result of a submitted job
pub struct TaskHandle<T> {
    slot: Arc<TaskSlot<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the job finished
    pub fn wait(self) -> Result<T, TaskError> {
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            self.slot.ready.wait(&mut state);
        }
        take(&mut state)
    }

    /// Block up to `timeout`; `None` if the job is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out()
                && matches!(*state, SlotState::Pending)
            {
                return None;
            }
        }
        Some(take(&mut state))
    }

    /// Take the result if the job finished
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        let mut state = self.slot.state.lock();
        if matches!(*state, SlotState::Pending) {
            None
        } else {
            Some(take(&mut state))
        }
    }

    /// Whether the job finished (or was cancelled)
    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending)
    }
}

fn take<T>(state: &mut SlotState<T>) -> Result<T, TaskError> {
    match std::mem::replace(state, SlotState::Taken) {
        SlotState::Ready(result) => result,
        _ => Err(TaskError::Cancelled),
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool(core: usize, max: Option<usize>, queue: Option<usize>) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                core_threads: core,
                max_threads: max,
                keep_alive_secs: 1,
                queue_size: queue,
            },
            Logger::quiet("pool"),
        )
        .unwrap()
    }

    #[test]
    fn test_submit_and_wait() {
        let pool = pool(2, None, None);
        let handle = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn test_runs_on_named_thread() {
        let pool = pool(1, None, None);
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .unwrap()
            .wait()
            .unwrap();
        assert!(name.unwrap().starts_with("nodus-task-"));
    }

    #[test]
    fn test_panic_is_reported_and_worker_survives() {
        let pool = pool(1, Some(1), None);
        let handle = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(handle.wait(), Err(TaskError::Panicked("boom".into())));
        assert_eq!(pool.submit(|| 1).unwrap().wait(), Ok(1));
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_caller_runs_when_saturated() {
        let pool = pool(1, Some(1), Some(1));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let blocker = pool
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let queued = pool.submit(|| thread::current().id()).unwrap();
        assert_eq!(pool.queued_tasks_count(), 1);
        assert_eq!(pool.queued_tasks_remaining_capacity(), 0);

        let caller = thread::current().id();
        let overflow = pool.submit(|| thread::current().id()).unwrap();
        assert!(overflow.is_done());
        assert_eq!(overflow.wait(), Ok(caller));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        assert_ne!(queued.wait().unwrap(), caller);
    }

    #[test]
    fn test_clear_queued_tasks_cancels_them() {
        let pool = pool(1, Some(1), Some(4));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = pool
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let a = pool.submit(|| 1).unwrap();
        let b = pool.submit(|| 2).unwrap();
        assert!(pool.has_queued_tasks());

        assert_eq!(pool.clear_queued_tasks(), 2);
        assert_eq!(a.wait(), Err(TaskError::Cancelled));
        assert_eq!(b.try_take(), Some(Err(TaskError::Cancelled)));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
    }

    #[test]
    fn test_shutdown_drains_queue_then_refuses() {
        let pool = pool(1, Some(1), None);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = pool
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let queued = pool.submit(|| "ran").unwrap();

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(pool.submit(|| ()), Err(LoopError::PoolShutdown)));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        assert_eq!(queued.wait(), Ok("ran"));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_core_threads_time_out_when_allowed() {
        let pool = pool(2, None, None);
        pool.submit(|| ()).unwrap().wait().unwrap();
        assert_eq!(pool.thread_count(), 1);
        pool.allow_core_thread_timeout(true);
        assert!(pool.await_termination(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_timeout() {
        let pool = pool(1, None, None);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = pool
            .submit(move || {
                let _ = release_rx.recv();
                5
            })
            .unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(!handle.is_done());
        release_tx.send(()).unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(Ok(5)));
    }

    #[test]
    fn test_idle_watch_fires_until_dropped() {
        let pool = pool(1, None, None);
        let (idle_tx, idle_rx) = channel::unbounded();
        let watch = pool.watch_idle(Box::new(move || {
            let _ = idle_tx.send(());
        }));

        pool.submit(|| thread::sleep(Duration::from_millis(10))).unwrap();
        assert!(idle_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(!pool.is_busy());

        drop(watch);
        pool.submit(|| ()).unwrap().wait().unwrap();
        assert!(idle_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_prestart_core_thread() {
        let pool = pool(1, None, None);
        assert!(pool.prestart_core_thread().unwrap());
        assert!(!pool.prestart_core_thread().unwrap());
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_describe_config() {
        let pool = pool(3, None, Some(10));
        assert_eq!(
            pool.describe_config(),
            "{coreThreads: 3, maxThreads: unbounded, threadTimeout: 1s, queueSize: 10}"
        );
    }
}
