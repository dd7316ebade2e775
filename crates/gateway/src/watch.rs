// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem watchers: externally-written session status files and the
//! transcript directory watched to learn the commander's conversation id.
//!
//! Both use `notify` for wake-ups with a polling fallback, since editors
//! and network filesystems do not reliably deliver events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::SessionStatus;
use crate::session_store::{SessionStore, SessionUpdate, StatusBlock};

const FALLBACK_POLL: Duration = Duration::from_secs(5);

/// On-disk status file: `{status, task?, summary?, blockers?, next_steps?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusFile {
    pub status: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// Parse a status file body into the store's representation.
pub fn parse_status_file(contents: &str) -> Option<(SessionStatus, StatusBlock)> {
    let file: StatusFile = serde_json::from_str(contents).ok()?;
    let status = SessionStatus::from_external(&file.status);
    let block = StatusBlock {
        task: file.task,
        summary: file.summary,
        blockers: file.blockers,
        next_steps: file.next_steps,
    };
    Some((status, block))
}

/// Set up a `notify` watcher on a directory, waking `wake_tx` on any event.
/// Returns the watcher handle (must be kept alive), or `None` when notify
/// is unavailable — the poll fallback still covers us.
fn dir_watcher(dir: &Path, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;
    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

/// Watches the status directory and feeds parsed updates into the session
/// store. Files are named `<session_or_conversation_id>.json`; ids not
/// yet tracked are registered as watcher-discovered sessions.
pub struct StatusDirWatcher {
    dir: PathBuf,
    store: Arc<SessionStore>,
    poll_interval: Duration,
    applied: HashMap<String, (SessionStatus, StatusBlock)>,
}

impl StatusDirWatcher {
    pub fn new(dir: PathBuf, store: Arc<SessionStore>) -> Self {
        Self { dir, store, poll_interval: FALLBACK_POLL, applied: HashMap::new() }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _ = std::fs::create_dir_all(&self.dir);
        let _watcher = dir_watcher(&self.dir, wake_tx);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }
            self.scan();
        }
    }

    /// One pass over the directory, applying changed files to the store.
    pub fn scan(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                continue;
            };
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Some((status, block)) = parse_status_file(&contents) else {
                debug!(path = %path.display(), "unparseable status file");
                continue;
            };

            let current = (status, block.clone());
            if self.applied.get(&id) == Some(&current) {
                continue;
            }
            self.applied.insert(id.clone(), current);

            if self.store.get(&id).is_some() {
                self.store.update(
                    &id,
                    SessionUpdate { status: Some(status), status_block: Some(block) },
                );
            } else {
                self.store.add_from_watcher(&id, status, Some(block));
            }
        }
    }
}

/// Wait for a new `.jsonl` file to appear in `dir` and return its stem.
///
/// Files already present when the wait starts are ignored: the caller
/// wants the transcript created by the subprocess it just spawned.
/// Returns `None` when cancelled.
pub async fn await_new_jsonl(
    dir: &Path,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Option<String> {
    let _ = std::fs::create_dir_all(dir);
    let initial: Vec<PathBuf> = list_jsonl(dir);

    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let _watcher = dir_watcher(dir, wake_tx);
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = wake_rx.recv() => {}
            _ = poll.tick() => {}
        }

        for path in list_jsonl(dir) {
            if initial.contains(&path) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                return Some(stem.to_owned());
            }
        }
    }
}

fn list_jsonl(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect()
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
