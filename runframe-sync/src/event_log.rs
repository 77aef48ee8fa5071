//! Capped rolling log of observed remote events.

use std::collections::VecDeque;

use runframe_core::RemoteEvent;

/// Most-recent-N event log. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<RemoteEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Append events in the order given, evicting the oldest past capacity.
    pub fn extend<I: IntoIterator<Item = RemoteEvent>>(&mut self, events: I) {
        for event in events {
            if self.events.len() == self.capacity {
                self.events.pop_front();
            }
            self.events.push_back(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<RemoteEvent> {
        self.events.iter().cloned().collect()
    }
}
