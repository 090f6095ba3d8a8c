//! Bounded per-user event history used to resume interrupted streams.
//!
//! Holds the most recent `capacity` stored events in append order. Anything
//! evicted past that horizon can no longer be replayed.

use std::collections::VecDeque;

use crate::events::ProgressEvent;

/// Default number of events kept per user.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug)]
pub struct UserHistory {
    events: VecDeque<ProgressEvent>,
    capacity: usize,
    next_sequence: u64,
}

impl UserHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 1,
        }
    }

    /// Stamp `event` with the next sequence number and store it, evicting the
    /// oldest entries until the buffer is back at capacity.
    pub fn append(&mut self, mut event: ProgressEvent) -> ProgressEvent {
        event.event_id = self.next_sequence.to_string();
        self.next_sequence += 1;

        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        event
    }

    /// Events stored strictly after the one identified by `last_event_id`.
    ///
    /// Returns nothing when the id is unknown (never issued, malformed or
    /// already evicted) or names the newest stored event.
    pub fn replay_after(&self, last_event_id: &str) -> Vec<ProgressEvent> {
        let Some(index) = self.events.iter().position(|e| e.event_id == last_event_id) else {
            return Vec::new();
        };
        self.events.iter().skip(index + 1).cloned().collect()
    }

    /// Backlog for a client resuming from `last_event_id`.
    ///
    /// `"0"` is the cursor a heartbeat carries before any event was stored; a
    /// client resuming from it has seen nothing and gets every held event.
    /// Any other id follows [`UserHistory::replay_after`].
    pub fn resume_after(&self, last_event_id: &str) -> Vec<ProgressEvent> {
        if last_event_id == "0" {
            return self.events_since(0);
        }
        self.replay_after(last_event_id)
    }

    /// Every stored event with a sequence greater than `sequence`, whether or
    /// not `sequence` itself is still held. Used for lag recovery.
    pub fn events_since(&self, sequence: u64) -> Vec<ProgressEvent> {
        self.events
            .iter()
            .filter(|e| e.sequence().is_some_and(|s| s > sequence))
            .cloned()
            .collect()
    }

    /// Sequence number of the newest stored event (0 when nothing was stored yet).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
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

    pub fn iter(&self) -> impl Iterator<Item = &ProgressEvent> {
        self.events.iter()
    }
}

impl Default for UserHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
