//! Loop statistics

use serde::Serialize;
use std::fmt;

/// Point-in-time snapshot of a loop's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStats {
    /// Loop instance number
    pub instance: u32,
    /// Open keep-alive handles
    pub hook_count: usize,
    /// Pool tasks waiting for a thread
    pub scheduled_task_count: usize,
    /// Pool tasks running
    pub active_task_count: usize,
    /// Live pool threads
    pub thread_count: usize,
    /// Events waiting in the queue
    pub pending_event_count: usize,
    /// Descriptions of the waiting events, oldest first
    pub pending_events: Vec<String>,
}

impl LoopStats {
    /// Whether nothing is outstanding
    pub fn is_idle(&self) -> bool {
        self.hook_count == 0
            && self.scheduled_task_count == 0
            && self.active_task_count == 0
            && self.pending_event_count == 0
    }

    /// JSON rendering for diagnostics endpoints
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for LoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventLoop.{} {{hooks: {}, events: {}, tasks: {}, activeTasks: {}, threads: {}}}",
            self.instance,
            self.hook_count,
            self.pending_event_count,
            self.scheduled_task_count,
            self.active_task_count,
            self.thread_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_json() {
        let stats = LoopStats {
            instance: 2,
            hook_count: 1,
            scheduled_task_count: 0,
            active_task_count: 3,
            thread_count: 4,
            pending_event_count: 1,
            pending_events: vec!["fs.stat".into()],
        };
        assert!(!stats.is_idle());
        assert_eq!(
            stats.to_string(),
            "EventLoop.2 {hooks: 1, events: 1, tasks: 0, activeTasks: 3, threads: 4}"
        );
        let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(json["hookCount"], 1);
        assert_eq!(json["pendingEvents"][0], "fs.stat");
    }
}
