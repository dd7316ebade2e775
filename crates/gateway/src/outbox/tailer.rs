// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::{OutboxEvent, OutboxStore};

/// Listener invoked for each newly-tailed outbox event, in strictly
/// increasing id order. May be invoked again for the same event after a
/// daemon restart — listeners must be idempotent.
pub type OutboxListener = Arc<dyn Fn(&OutboxEvent) + Send + Sync>;

const BATCH_LIMIT: usize = 100;

/// Polls the outbox store and fans new events out to subscribers.
///
/// The cursor starts at the store's current latest id, so a fresh daemon
/// only broadcasts events inserted after it came up; older events remain
/// available through [`events_after`](Self::events_after) replay.
pub struct OutboxTailer {
    store: Arc<OutboxStore>,
    interval: Duration,
    cursor: AtomicU64,
    subscribers: parking_lot::Mutex<HashMap<u64, OutboxListener>>,
    next_sub_id: AtomicU64,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Handle returned by [`OutboxTailer::subscribe`]; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving events.
pub struct OutboxSubscription {
    tailer: Arc<OutboxTailer>,
    id: u64,
}

impl OutboxSubscription {
    pub fn unsubscribe(self) {
        self.tailer.subscribers.lock().remove(&self.id);
    }
}

impl OutboxTailer {
    pub fn new(store: Arc<OutboxStore>, interval: Duration) -> Self {
        let cursor = store.latest_id();
        Self {
            store,
            interval,
            cursor: AtomicU64::new(cursor),
            subscribers: parking_lot::Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    /// Register a listener for tailed events.
    pub fn subscribe(self: &Arc<Self>, listener: OutboxListener) -> OutboxSubscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, listener);
        OutboxSubscription { tailer: Arc::clone(self), id }
    }

    /// Start the poll loop. Idempotent: a second call while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut cancel_slot = self.cancel.lock();
        if cancel_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let tailer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tailer.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tailer.tick();
            }
            debug!("outbox tailer stopped");
        });
    }

    /// Stop the poll loop between ticks.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }

    /// One poll: read, broadcast in id order, advance cursor, mark
    /// delivered. A tick with no new events does nothing.
    fn tick(&self) {
        let cursor = self.cursor.load(Ordering::Acquire);
        let batch = self.store.events_after(cursor, BATCH_LIMIT);
        if batch.is_empty() {
            return;
        }

        let listeners: Vec<OutboxListener> = self.subscribers.lock().values().cloned().collect();
        let mut last_id = cursor;
        for event in &batch {
            for listener in &listeners {
                listener(event);
            }
            last_id = event.event_id;
            self.cursor.store(last_id, Ordering::Release);
        }

        if let Err(e) = self.store.mark_delivered_through(last_id) {
            warn!(err = %e, "failed to persist outbox delivered watermark");
        }
    }

    /// Catch-up replay for a just-connected client. Does not move the
    /// tailer cursor and does not re-mark events delivered.
    pub fn events_after(&self, cursor: u64, limit: usize) -> Vec<OutboxEvent> {
        self.store.events_after(cursor, limit)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn tick_for_test(&self) {
        self.tick();
    }
}

#[cfg(test)]
#[path = "tailer_tests.rs"]
mod tests;
