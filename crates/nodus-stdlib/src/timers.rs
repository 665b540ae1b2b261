//! Timers module
//!
//! `setTimeout`/`setInterval` ride on native loop timer handles so an armed,
//! referenced timer keeps the loop alive. `setImmediate` posts straight onto the
//! event queue and is skipped at dispatch time once cleared.

use nodus_engine::{native_callback, Event, LoopHandle, Logger, Logging, NativeHandleId};
use nodus_sdk::{callback, CallbackRef, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Largest delay a timer accepts; anything above fires after 1ms (2^31 - 1)
pub const TIMEOUT_MAX: f64 = 2_147_483_647.0;

/// Identifier returned by the `set*` functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Numeric value handed to scripts
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Default)]
struct TimerTable {
    next_id: u64,
    timers: FxHashMap<TimerId, NativeHandleId>,
    immediates: FxHashMap<TimerId, Arc<AtomicBool>>,
}

impl TimerTable {
    fn next(&mut self) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }
}

/// Timer functions bound to one loop
#[derive(Clone)]
pub struct Timers {
    handle: LoopHandle,
    table: Arc<Mutex<TimerTable>>,
    log: Logger,
}

/// Normalize a script delay: non-finite, below 1 or above [`TIMEOUT_MAX`] means 1ms
pub fn clamp_delay(delay_ms: f64) -> Duration {
    if !(1.0..=TIMEOUT_MAX).contains(&delay_ms) {
        return Duration::from_millis(1);
    }
    Duration::from_millis(delay_ms as u64)
}

impl Timers {
    /// Create the timer functions for the loop behind `handle`
    pub fn new(handle: LoopHandle, logging: &Logging) -> Self {
        Self {
            handle,
            table: Arc::new(Mutex::new(TimerTable::default())),
            log: logging.get("timers"),
        }
    }

    /// Call `callback(args)` once after `delay_ms`
    pub fn set_timeout(&self, delay_ms: f64, callback: CallbackRef, args: Vec<Value>) -> TimerId {
        self.schedule(delay_ms, false, callback, args)
    }

    /// Call `callback(args)` every `delay_ms` until cleared
    pub fn set_interval(&self, delay_ms: f64, callback: CallbackRef, args: Vec<Value>) -> TimerId {
        self.schedule(delay_ms, true, callback, args)
    }

    fn schedule(&self, delay_ms: f64, repeat: bool, user: CallbackRef, args: Vec<Value>) -> TimerId {
        let delay = clamp_delay(delay_ms);
        let mut table = self.table.lock();
        let id = table.next();

        let shared = self.table.clone();
        let handle = self.handle.clone();
        let on_fire = native_callback(move |_| {
            if !repeat {
                let native = shared.lock().timers.remove(&id);
                if let Some(native) = native {
                    handle.close_native(native);
                }
            }
            user.call(Some("timer"), &args)
        });

        // The table stays locked until the id is recorded, so a fire on the
        // loop thread cannot miss it.
        let native = self
            .handle
            .start_timer(on_fire, delay, repeat.then_some(delay));
        table.timers.insert(id, native);
        self.log.trace(format_args!(
            "{} armed on {} ({:?}{})",
            id,
            native,
            delay,
            if repeat { ", repeating" } else { "" }
        ));
        id
    }

    /// Cancel a timeout or interval; unknown ids are ignored
    pub fn clear_timer(&self, id: TimerId) {
        let native = self.table.lock().timers.remove(&id);
        if let Some(native) = native {
            self.handle.stop_timer(native);
            self.handle.close_native(native);
            self.log.trace(format_args!("{} cleared", id));
        }
    }

    /// Let a timer keep the loop alive again
    pub fn ref_timer(&self, id: TimerId) {
        self.set_ref(id, true);
    }

    /// Stop a timer from keeping the loop alive on its own
    pub fn unref_timer(&self, id: TimerId) {
        self.set_ref(id, false);
    }

    fn set_ref(&self, id: TimerId, referenced: bool) {
        let native = self.table.lock().timers.get(&id).copied();
        if let Some(native) = native {
            self.handle.set_ref(native, referenced);
        }
    }

    /// Call `callback(args)` on the next pass over the event queue
    pub fn set_immediate(&self, user: CallbackRef, args: Vec<Value>) -> TimerId {
        let cleared = Arc::new(AtomicBool::new(false));
        let id = {
            let mut table = self.table.lock();
            let id = table.next();
            table.immediates.insert(id, cleared.clone());
            id
        };

        let shared = self.table.clone();
        let run = callback(move |name, args| {
            if cleared.load(Ordering::Acquire) {
                return Ok(());
            }
            shared.lock().immediates.remove(&id);
            user.call(name, args)
        });
        self.handle.post(Event::new("timers.immediate", run, args));
        id
    }

    /// Cancel a pending immediate; it is dropped when its turn comes
    pub fn clear_immediate(&self, id: TimerId) {
        if let Some(cleared) = self.table.lock().immediates.remove(&id) {
            cleared.store(true, Ordering::Release);
        }
    }

    /// Timers and immediates not yet fired or cleared
    pub fn active_count(&self) -> usize {
        let table = self.table.lock();
        table.timers.len() + table.immediates.len()
    }
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Timers")
            .field("loop", &self.handle.instance())
            .field("timers", &table.timers.len())
            .field("immediates", &table.immediates.len())
            .finish()
    }
}
