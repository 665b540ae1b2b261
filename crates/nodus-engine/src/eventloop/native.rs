//! Native loop
//!
//! The poll/dispatch half of the event loop, running on the loop thread:
//! - a registry of native handles, each with a callback and the domain that
//!   was active when it was registered
//! - a timer min-heap (one-shot and repeating, ref'd or unref'd)
//! - a wake channel carrying keep-alive pulses, interrupts, posted-event
//!   wakeups, handle commands and externally emitted native events
//!
//! [`NativeLoop::run`] runs until nothing keeps the loop alive or the loop is
//! stopped. Every callback goes through the caller's [`DispatchHook`], which
//! owns the dispatch envelope (domain bracket, exception routing and the
//! queue drain that follows each callback).

use super::keep_alive::KeepAliveRegistry;
use crate::logging::Logger;
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use nodus_sdk::{CallbackError, DomainRef, ErrorValue, Value};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Version of the native loop compiled into this crate
pub const NATIVE_LOOP_VERSION: &str = "1.4.0";

/// Shortest timer period
const MIN_TIMER: Duration = Duration::from_millis(1);

/// Identifies a registered native handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandleId(pub(crate) u64);

impl NativeHandleId {
    /// Raw id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native#{}", self.0)
    }
}

/// Readiness or completion delivered to a native handle
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    /// Timer expired
    Timer,
    /// Check phase
    Check,
    /// Idle phase
    Idle,
    /// Async handle was signalled
    Async { status: i32 },
    /// Signal received
    Signal { signum: i32 },
    /// Data read from a stream (empty at EOF)
    StreamRead { data: Vec<u8> },
    /// Write finished
    StreamWrite { status: i32 },
    /// Outgoing connection finished
    Connect { status: i32 },
    /// Incoming connection on a listening handle
    Connection { status: i32 },
    /// Handle closed
    Close,
    /// Filesystem request finished
    FileCompletion {
        op: String,
        result: Result<Value, ErrorValue>,
    },
    /// Child process exited
    ProcessExit { status: i64, signal: i32 },
    /// Datagram received
    UdpRecv { data: Vec<u8>, from: String },
}

impl NativeEvent {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            NativeEvent::Timer => "timer",
            NativeEvent::Check => "check",
            NativeEvent::Idle => "idle",
            NativeEvent::Async { .. } => "async",
            NativeEvent::Signal { .. } => "signal",
            NativeEvent::StreamRead { .. } => "read",
            NativeEvent::StreamWrite { .. } => "write",
            NativeEvent::Connect { .. } => "connect",
            NativeEvent::Connection { .. } => "connection",
            NativeEvent::Close => "close",
            NativeEvent::FileCompletion { .. } => "fs",
            NativeEvent::ProcessExit { .. } => "exit",
            NativeEvent::UdpRecv { .. } => "udp",
        }
    }
}

/// Callback attached to a native handle
pub trait NativeCallback: Send + Sync {
    /// Handle one native event
    fn on_event(&self, event: &NativeEvent) -> Result<(), CallbackError>;
}

impl<F> NativeCallback for F
where
    F: Fn(&NativeEvent) -> Result<(), CallbackError> + Send + Sync,
{
    fn on_event(&self, event: &NativeEvent) -> Result<(), CallbackError> {
        self(event)
    }
}

/// Wrap a closure as a native callback
pub fn native_callback<F>(f: F) -> Arc<dyn NativeCallback>
where
    F: Fn(&NativeEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Messages on the native loop's wake channel
pub(crate) enum Wakeup {
    /// Keep-alive counter crossed zero; re-read it
    Pulse,
    /// Events were posted to the queue
    Posted,
    /// Stop the loop from the loop thread
    Interrupt,
    /// The worker pool ran out of work
    PoolIdle,
    Register {
        id: NativeHandleId,
        callback: Arc<dyn NativeCallback>,
        domain: Option<DomainRef>,
        timer: bool,
    },
    Close(NativeHandleId),
    StartTimer {
        id: NativeHandleId,
        timeout: Duration,
        repeat: Option<Duration>,
    },
    StopTimer(NativeHandleId),
    SetRef {
        id: NativeHandleId,
        referenced: bool,
    },
    Emit {
        id: NativeHandleId,
        event: NativeEvent,
    },
}

/// Per-callback glue the owner of the native loop provides
pub trait DispatchHook {
    /// Run one native callback inside the dispatch envelope
    fn dispatch(&mut self, callback: &dyn NativeCallback, domain: Option<&DomainRef>, event: &NativeEvent);

    /// Drain posted events
    fn drain(&mut self);

    /// Whether posted events are waiting for the idle phase
    fn has_deferred(&self) -> bool;

    /// An interrupt arrived; stop the loop
    fn interrupt(&mut self);
}

struct NativeHandle {
    callback: Arc<dyn NativeCallback>,
    domain: Option<DomainRef>,
    referenced: bool,
    is_timer: bool,
    timer: Option<TimerState>,
}

impl NativeHandle {
    fn is_active(&self) -> bool {
        !self.is_timer || self.timer.is_some()
    }
}

struct TimerState {
    repeat: Option<Duration>,
    generation: u64,
}

/// Timer heap entry (min-heap by deadline, then arming order)
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: NativeHandleId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse for min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

// ============================================================================
// Native Loop
// ============================================================================

/// Handle registry, timers and the blocking wait of the loop thread
pub struct NativeLoop {
    wake_rx: Receiver<Wakeup>,
    keep_alive: KeepAliveRegistry,
    stopped: Arc<AtomicBool>,
    wake_pending: Arc<AtomicBool>,

    handles: FxHashMap<NativeHandleId, NativeHandle>,
    timers: BinaryHeap<TimerEntry>,
    ready: VecDeque<(NativeHandleId, NativeEvent)>,

    keep_alive_ref: bool,
    keep_alive_closed: bool,
    posted: bool,
    interrupted: bool,
    seq: u64,
    iterations: u64,
    log: Logger,
}

impl NativeLoop {
    pub(crate) fn new(
        wake_rx: Receiver<Wakeup>,
        keep_alive: KeepAliveRegistry,
        stopped: Arc<AtomicBool>,
        wake_pending: Arc<AtomicBool>,
        log: Logger,
    ) -> Self {
        Self {
            wake_rx,
            keep_alive,
            stopped,
            wake_pending,
            handles: FxHashMap::default(),
            timers: BinaryHeap::new(),
            ready: VecDeque::new(),
            keep_alive_ref: false,
            keep_alive_closed: false,
            posted: false,
            interrupted: false,
            seq: 0,
            iterations: 0,
            log,
        }
    }

    /// Poll and dispatch until the loop is no longer alive or is stopped
    pub fn run(&mut self, hook: &mut dyn DispatchHook) {
        loop {
            if self.is_stopped() {
                self.close();
                return;
            }
            self.iterations += 1;
            self.collect_wakeups();

            if self.interrupted {
                self.interrupted = false;
                self.log.debug(format_args!("interrupted"));
                hook.interrupt();
                continue;
            }

            if self.posted {
                self.posted = false;
                hook.drain();
                if self.is_stopped() {
                    continue;
                }
            }

            self.run_timers(hook);
            if self.is_stopped() {
                continue;
            }

            self.run_ready(hook);
            if self.is_stopped() {
                continue;
            }

            // Idle phase: events left behind when sync processing is off
            if hook.has_deferred() {
                hook.drain();
                if self.is_stopped() {
                    continue;
                }
            }

            // Callbacks above may have queued commands; look before deciding
            self.collect_wakeups();
            if self.interrupted || self.posted || !self.ready.is_empty() {
                continue;
            }
            if !self.is_alive(hook) {
                return;
            }
            if !self.wait(self.next_timeout(hook)) {
                self.log.error(format_args!("wake channel disconnected"));
                return;
            }
        }
    }

    /// Block for one wakeup or until `timeout` passes
    pub(crate) fn park(&mut self, timeout: Duration) {
        if !self.wait(Some(timeout)) {
            self.log.error(format_args!("wake channel disconnected"));
        }
    }

    /// Close the keep-alive primitive and drop every handle and timer
    pub fn close(&mut self) {
        if !self.keep_alive_closed {
            self.log.trace(format_args!(
                "closing {} handles, {} timers",
                self.handles.len(),
                self.timers.len()
            ));
        }
        self.keep_alive_closed = true;
        self.handles.clear();
        self.timers.clear();
        self.ready.clear();
    }

    /// Whether the loop has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::Acquire)
    }

    /// Number of registered handles
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of armed timers
    pub fn active_timers(&self) -> usize {
        self.handles.values().filter(|h| h.timer.is_some()).count()
    }

    /// Poll iterations run so far
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn is_alive(&self, hook: &dyn DispatchHook) -> bool {
        (self.keep_alive_ref && !self.keep_alive_closed)
            || self.handles.values().any(|h| h.referenced && h.is_active())
            || !self.ready.is_empty()
            || hook.has_deferred()
    }

    fn next_timeout(&self, hook: &dyn DispatchHook) -> Option<Duration> {
        if hook.has_deferred() || !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Block for one wakeup; `false` if the channel is gone
    fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let received = match timeout {
            Some(timeout) => self.wake_rx.recv_timeout(timeout),
            None => self.wake_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(wakeup) => {
                self.apply(wakeup);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn collect_wakeups(&mut self) {
        loop {
            match self.wake_rx.try_recv() {
                Ok(wakeup) => self.apply(wakeup),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn apply(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Pulse => {
                self.keep_alive_ref = self.keep_alive.is_referenced();
            }
            Wakeup::Posted => {
                self.wake_pending.store(false, AtomicOrdering::Release);
                self.posted = true;
            }
            Wakeup::Interrupt => self.interrupted = true,
            Wakeup::PoolIdle => {}
            Wakeup::Register {
                id,
                callback,
                domain,
                timer,
            } => {
                self.handles.insert(
                    id,
                    NativeHandle {
                        callback,
                        domain,
                        referenced: true,
                        is_timer: timer,
                        timer: None,
                    },
                );
            }
            Wakeup::Close(id) => {
                self.handles.remove(&id);
            }
            Wakeup::StartTimer { id, timeout, repeat } => {
                if let Some(handle) = self.handles.get_mut(&id) {
                    self.seq += 1;
                    handle.timer = Some(TimerState {
                        repeat: repeat.map(|r| r.max(MIN_TIMER)),
                        generation: self.seq,
                    });
                    self.timers.push(TimerEntry {
                        deadline: Instant::now() + timeout,
                        seq: self.seq,
                        id,
                    });
                }
            }
            Wakeup::StopTimer(id) => {
                if let Some(handle) = self.handles.get_mut(&id) {
                    handle.timer = None;
                }
            }
            Wakeup::SetRef { id, referenced } => {
                if let Some(handle) = self.handles.get_mut(&id) {
                    handle.referenced = referenced;
                }
            }
            Wakeup::Emit { id, event } => self.ready.push_back((id, event)),
        }
    }

    fn run_timers(&mut self, hook: &mut dyn DispatchHook) {
        let now = Instant::now();
        while let Some(id) = self.pop_due_timer(now) {
            self.dispatch(id, NativeEvent::Timer, hook);
            if self.is_stopped() {
                return;
            }
            // A callback may have stopped a timer that is also due
            self.collect_wakeups();
        }
    }

    fn pop_due_timer(&mut self, now: Instant) -> Option<NativeHandleId> {
        loop {
            if self.timers.peek()?.deadline > now {
                return None;
            }
            let entry = self.timers.pop()?;
            let Some(handle) = self.handles.get_mut(&entry.id) else {
                continue;
            };
            let Some(timer) = handle.timer.as_mut() else {
                continue;
            };
            if timer.generation != entry.seq {
                continue;
            }
            match timer.repeat {
                Some(repeat) => {
                    self.seq += 1;
                    timer.generation = self.seq;
                    self.timers.push(TimerEntry {
                        deadline: now + repeat,
                        seq: self.seq,
                        id: entry.id,
                    });
                }
                None => handle.timer = None,
            }
            return Some(entry.id);
        }
    }

    fn run_ready(&mut self, hook: &mut dyn DispatchHook) {
        for _ in 0..self.ready.len() {
            let Some((id, event)) = self.ready.pop_front() else {
                return;
            };
            self.dispatch(id, event, hook);
            if self.is_stopped() {
                return;
            }
        }
    }

    fn dispatch(&mut self, id: NativeHandleId, event: NativeEvent, hook: &mut dyn DispatchHook) {
        let Some(handle) = self.handles.get(&id) else {
            self.log
                .trace(format_args!("dropping {} event for closed {}", event.kind(), id));
            return;
        };
        let callback = handle.callback.clone();
        let domain = handle.domain.clone();
        self.log.trace(format_args!("{} on {}", event.kind(), id));
        hook.dispatch(callback.as_ref(), domain.as_ref(), &event);
    }
}

impl fmt::Debug for NativeLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLoop")
            .field("handles", &self.handles.len())
            .field("timers", &self.active_timers())
            .field("keep_alive_ref", &self.keep_alive_ref)
            .field("iterations", &self.iterations)
            .finish()
    }
}
