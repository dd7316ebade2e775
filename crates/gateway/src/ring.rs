// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;

use chrono::Utc;

use crate::event::{BufferedEvent, SessionEvent};

/// Bounded in-memory append log of session events, indexed by a monotone
/// sequence number.
///
/// Each push assigns the next sequence and accounts the event's serialized
/// byte cost against a fixed budget; eviction is strictly from the oldest
/// end. Sequence numbers never reset, even across eviction or `clear`, so
/// a reconnecting consumer can always express "everything after N".
#[derive(Debug)]
pub struct RingBuffer {
    entries: VecDeque<BufferedEvent>,
    budget: usize,
    bytes: usize,
    next_seq: u64,
}

/// Counters reported by [`RingBuffer::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub count: usize,
    pub bytes: usize,
    pub oldest_seq: Option<u64>,
    pub newest_seq: Option<u64>,
}

impl RingBuffer {
    /// Create a new ring buffer with the given byte budget.
    pub fn new(budget: usize) -> Self {
        Self { entries: VecDeque::new(), budget, bytes: 0, next_seq: 1 }
    }

    /// Append an event, assigning and returning its sequence number.
    ///
    /// Evicts from the front until the byte budget is honored. An event
    /// larger than the whole budget is assigned a sequence and immediately
    /// evicted — the sequence space stays contiguous either way.
    pub fn push(&mut self, event: SessionEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let bytes = serde_json::to_string(&event).map(|s| s.len()).unwrap_or(0);
        self.entries.push_back(BufferedEvent { seq, ts: Utc::now(), bytes, event });
        self.bytes += bytes;

        while self.bytes > self.budget {
            match self.entries.pop_front() {
                Some(evicted) => self.bytes -= evicted.bytes,
                None => break,
            }
        }

        seq
    }

    /// All resident entries with `entry.seq > seq`, in order.
    ///
    /// If `seq` predates the oldest resident entry the caller gets only
    /// what remains — consumers must accept gaps after reconnecting across
    /// an eviction.
    pub fn get_from(&self, seq: u64) -> Vec<BufferedEvent> {
        self.entries.iter().filter(|e| e.seq > seq).cloned().collect()
    }

    /// The most recently assigned sequence number (0 if nothing was ever
    /// pushed).
    pub fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Sequence of the oldest resident entry, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> RingStats {
        RingStats {
            count: self.entries.len(),
            bytes: self.bytes,
            oldest_seq: self.entries.front().map(|e| e.seq),
            newest_seq: self.entries.back().map(|e| e.seq),
        }
    }

    /// Drop all resident entries without resetting the sequence counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
