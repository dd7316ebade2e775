// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client outbound queue.
//!
//! Broadcasting must never block on a slow client: session `event` traffic
//! is drop-oldest on overflow, while lifecycle/fleet/commander messages
//! wait briefly for space and report failure so the caller can close the
//! offending client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use super::ws::msg::ServerMessage;

pub struct OutboundQueue {
    inner: parking_lot::Mutex<VecDeque<ServerMessage>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    /// Signalled when a message is pushed or the queue is closed.
    readable: Notify,
    /// Signalled when space frees up.
    writable: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue a session event. On overflow the oldest queued message is
    /// dropped; the write itself never waits.
    pub fn push_event(&self, msg: ServerMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.lock();
            while queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(msg);
        }
        self.readable.notify_one();
    }

    /// Enqueue a message that must not be dropped. Waits up to `timeout`
    /// for space; returns false on expiry (caller should close the
    /// client) or when the queue is closed.
    pub async fn push_critical(&self, msg: ServerMessage, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut msg = Some(msg);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            {
                let mut queue = self.inner.lock();
                if queue.len() < self.capacity {
                    if let Some(msg) = msg.take() {
                        queue.push_back(msg);
                    }
                    drop(queue);
                    self.readable.notify_one();
                    return true;
                }
            }
            let wait = self.writable.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return false;
            }
        }
    }

    /// Dequeue the next message, waiting as needed. Returns `None` once
    /// the queue is closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut queue = self.inner.lock();
                if let Some(msg) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return Some(msg);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.readable.notified().await;
        }
    }

    /// Close the queue: pending messages are still drained by `pop`, then
    /// it yields `None`. Further pushes are ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of session events dropped to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;
