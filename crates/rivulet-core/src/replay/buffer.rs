//! Bounded FIFO of sequenced messages.

use std::collections::VecDeque;

use crate::protocol::Entry;

/// One recorded state change.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedMessage {
    /// Sequence number assigned by the hub.
    pub seq: u64,
    /// The change as sent to live sinks.
    pub entry: Entry,
}

/// Retains the newest `capacity` messages, oldest evicted first.
#[derive(Debug)]
pub struct ReplayBuffer {
    messages: VecDeque<SequencedMessage>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Creates an empty buffer. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Appends a message, evicting the oldest when full. Sequences must be
    /// pushed in increasing order.
    pub fn push(&mut self, seq: u64, entry: Entry) {
        debug_assert!(self.newest_seq().map_or(true, |newest| seq > newest));
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(SequencedMessage { seq, entry });
    }

    /// Sequence of the oldest retained message.
    #[must_use]
    pub fn oldest_seq(&self) -> Option<u64> {
        self.messages.front().map(|m| m.seq)
    }

    /// Sequence of the newest retained message.
    #[must_use]
    pub fn newest_seq(&self) -> Option<u64> {
        self.messages.back().map(|m| m.seq)
    }

    /// Returns `true` if every message after `since` is still retained,
    /// given that `current` is the newest sequence ever assigned.
    #[must_use]
    pub fn covers(&self, since: u64, current: u64) -> bool {
        if since == 0 || since > current {
            return false;
        }
        match self.oldest_seq() {
            Some(oldest) => since >= oldest - 1,
            None => since == current,
        }
    }

    /// Messages with a sequence strictly greater than `since`, oldest first.
    pub fn after(&self, since: u64) -> impl Iterator<Item = &SequencedMessage> {
        // Sequences are contiguous, so the first match is found by offset.
        let skip = match self.oldest_seq() {
            Some(oldest) if since >= oldest => usize::try_from(since - oldest + 1).unwrap_or(usize::MAX),
            _ => 0,
        };
        self.messages.iter().skip(skip).filter(move |m| m.seq > since)
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Maximum number of retained messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every retained message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
