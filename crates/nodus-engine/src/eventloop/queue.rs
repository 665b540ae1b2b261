//! Cross-thread FIFO of pending events

use super::event::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Thread-safe FIFO; any thread pushes, only the loop thread pops.
#[derive(Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    /// Remove the oldest event
    pub fn pop(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop every pending event, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let n = events.len();
        events.clear();
        n
    }

    /// Diagnostic rendering of every pending event, oldest first
    pub fn describe(&self, verbose: bool) -> Vec<String> {
        self.events.lock().iter().map(|e| e.describe(verbose)).collect()
    }
}
