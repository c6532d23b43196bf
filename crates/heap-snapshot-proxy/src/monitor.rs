//! Detection of calls that stay pending across polling ticks.

use std::collections::HashSet;

use crate::protocol::CallId;

/// Tracks which calls were pending at the previous tick.
///
/// A call that was pending at one tick and is still pending at the next marks
/// the worker as busy. The verdict is advisory; nothing is cancelled.
#[derive(Debug, Default)]
pub struct LongRunningCallMonitor {
    previous: HashSet<CallId>,
}

impl LongRunningCallMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one tick against the currently pending calls and return whether any
    /// call survived since the previous tick.
    pub fn check(&mut self, current: &HashSet<CallId>) -> bool {
        self.previous.retain(|call_id| current.contains(call_id));
        let busy = !self.previous.is_empty();
        self.previous.extend(current.iter().copied());
        busy
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }
}
