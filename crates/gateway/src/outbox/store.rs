// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable outbox: a monotone-id event log used as a push+replay broadcast
//! channel.
//!
//! Events are appended as JSONL lines to `outbox.jsonl`; the delivered
//! watermark lives in a sidecar `outbox.cursor` file. Ids are assigned by
//! the store and never decrease. Delivery is at-least-once: after a crash
//! between broadcast and watermark persist, events are re-broadcast.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row of the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub briefing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_level: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// An event to append; the store assigns id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewOutboxEvent {
    pub kind: String,
    pub project_id: Option<String>,
    pub briefing_id: Option<String>,
    pub broadcast_level: Option<String>,
    pub payload: Value,
}

struct Inner {
    rows: Vec<OutboxEvent>,
    next_id: u64,
    delivered_through: u64,
}

/// Repository over the outbox files. Hand a clone of the `Arc<OutboxStore>`
/// to every subsystem that inserts or tails — there is no global instance.
pub struct OutboxStore {
    path: PathBuf,
    cursor_path: PathBuf,
    inner: parking_lot::Mutex<Inner>,
}

impl OutboxStore {
    /// Open (or create) the outbox under `base`. Malformed lines are
    /// skipped; the id counter resumes above the highest id seen.
    pub fn open(base: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)
            .with_context(|| format!("create outbox dir {}", base.display()))?;
        let path = base.join("outbox.jsonl");
        let cursor_path = base.join("outbox.cursor");

        let mut rows: Vec<OutboxEvent> = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            for line in contents.lines() {
                if let Ok(event) = serde_json::from_str::<OutboxEvent>(line) {
                    rows.push(event);
                }
            }
        }
        rows.sort_by_key(|e| e.event_id);

        let next_id = rows.last().map(|e| e.event_id + 1).unwrap_or(1);
        let delivered_through = std::fs::read_to_string(&cursor_path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Self {
            path,
            cursor_path,
            inner: parking_lot::Mutex::new(Inner { rows, next_id, delivered_through }),
        })
    }

    /// Append a new event, assigning the next id. One append is one atomic
    /// statement: the line is written and flushed before the id is visible
    /// to readers.
    pub fn append(&self, event: NewOutboxEvent) -> anyhow::Result<OutboxEvent> {
        let mut inner = self.inner.lock();
        let row = OutboxEvent {
            event_id: inner.next_id,
            ts: Utc::now(),
            kind: event.kind,
            project_id: event.project_id,
            briefing_id: event.briefing_id,
            broadcast_level: event.broadcast_level,
            payload: event.payload,
        };

        let mut line = serde_json::to_string(&row)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open outbox {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        inner.next_id += 1;
        inner.rows.push(row.clone());
        Ok(row)
    }

    /// Up to `limit` events with `event_id > cursor`, in increasing id
    /// order. Pure read: neither the tailer cursor nor the delivered
    /// watermark moves.
    pub fn events_after(&self, cursor: u64, limit: usize) -> Vec<OutboxEvent> {
        let inner = self.inner.lock();
        inner.rows.iter().filter(|e| e.event_id > cursor).take(limit).cloned().collect()
    }

    /// Highest id assigned so far (0 when empty).
    pub fn latest_id(&self) -> u64 {
        self.inner.lock().next_id - 1
    }

    pub fn delivered_through(&self) -> u64 {
        self.inner.lock().delivered_through
    }

    /// Advance the delivered watermark. Monotone: a lower id is a no-op.
    pub fn mark_delivered_through(&self, event_id: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if event_id <= inner.delivered_through {
            return Ok(());
        }
        inner.delivered_through = event_id;
        std::fs::write(&self.cursor_path, format!("{event_id}\n"))
            .with_context(|| format!("persist outbox cursor {}", self.cursor_path.display()))
    }

    /// Delete delivered rows older than `retention`, rewriting the log.
    /// Returns the number of rows dropped.
    pub fn sweep(&self, retention: Duration) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
        let delivered_through = inner.delivered_through;

        let before = inner.rows.len();
        inner.rows.retain(|e| e.event_id > delivered_through || e.ts > cutoff);
        let dropped = before - inner.rows.len();
        if dropped == 0 {
            return Ok(0);
        }

        let mut contents = String::new();
        for row in &inner.rows {
            contents.push_str(&serde_json::to_string(row)?);
            contents.push('\n');
        }
        std::fs::write(&self.path, contents)
            .with_context(|| format!("rewrite outbox {}", self.path.display()))?;
        Ok(dropped)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
