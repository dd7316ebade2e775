// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified registry of tracked sessions: PTY-owned ones the bridge
//! controls and watcher-discovered ones known only by their files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::SessionStatus;

/// How a tracked session entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Spawned and controlled by the PTY bridge.
    Pty,
    /// Discovered via its files; no local process to control.
    Watcher,
}

/// Structured status block parsed from an external status file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
}

/// One tracked session.
#[derive(Debug, Clone)]
pub struct TrackedSession {
    pub session_id: String,
    pub origin: SessionOrigin,
    pub project_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub status_block: Option<StatusBlock>,
}

/// Partial update applied to a tracked session.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub status_block: Option<StatusBlock>,
}

/// Notifications emitted to session-store subscribers.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Discovered { session: TrackedSession },
    Updated { session_id: String, update: SessionUpdate },
    Removed { session_id: String },
}

pub type SessionObserver = Arc<dyn Fn(&SessionNotice) + Send + Sync>;

/// Unsubscribe handle for a session-store observer.
pub struct SessionSubscription {
    store: Arc<SessionStore>,
    id: u64,
}

impl SessionSubscription {
    pub fn unsubscribe(self) {
        self.store.observers.lock().remove(&self.id);
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: parking_lot::RwLock<HashMap<String, TrackedSession>>,
    observers: parking_lot::Mutex<HashMap<u64, SessionObserver>>,
    next_observer_id: AtomicU64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a PTY-owned session (bridge ingress).
    pub fn add_from_pty(
        &self,
        session_id: &str,
        project_id: &str,
        cwd: PathBuf,
        pid: u32,
    ) -> TrackedSession {
        let session = TrackedSession {
            session_id: session_id.to_owned(),
            origin: SessionOrigin::Pty,
            project_id: Some(project_id.to_owned()),
            cwd: Some(cwd),
            pid: Some(pid),
            status: SessionStatus::Working,
            last_activity: Utc::now(),
            status_block: None,
        };
        self.sessions.write().insert(session_id.to_owned(), session.clone());
        self.emit(&SessionNotice::Discovered { session: session.clone() });
        session
    }

    /// Register a watcher-discovered session (file ingress).
    pub fn add_from_watcher(
        &self,
        session_id: &str,
        status: SessionStatus,
        status_block: Option<StatusBlock>,
    ) -> TrackedSession {
        let session = TrackedSession {
            session_id: session_id.to_owned(),
            origin: SessionOrigin::Watcher,
            project_id: None,
            cwd: None,
            pid: None,
            status,
            last_activity: Utc::now(),
            status_block,
        };
        self.sessions.write().insert(session_id.to_owned(), session.clone());
        self.emit(&SessionNotice::Discovered { session: session.clone() });
        session
    }

    /// Apply a partial update. Unknown ids are ignored (returns false).
    pub fn update(&self, session_id: &str, update: SessionUpdate) -> bool {
        {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(session_id) else {
                return false;
            };
            if let Some(status) = update.status {
                session.status = status;
            }
            if let Some(ref block) = update.status_block {
                session.status_block = Some(block.clone());
            }
            session.last_activity = Utc::now();
        }
        self.emit(&SessionNotice::Updated { session_id: session_id.to_owned(), update });
        true
    }

    /// Remove a session (PTY exit or file deletion).
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            self.emit(&SessionNotice::Removed { session_id: session_id.to_owned() });
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<TrackedSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<TrackedSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Subscribe to notices. The returned handle unsubscribes; dropping it
    /// keeps the observer alive for the store's lifetime.
    pub fn subscribe(self: &Arc<Self>, observer: SessionObserver) -> SessionSubscription {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(id, observer);
        SessionSubscription { store: Arc::clone(self), id }
    }

    /// Deliver a notice to a snapshot of the observer list, so observers
    /// may unsubscribe (themselves or others) during delivery.
    fn emit(&self, notice: &SessionNotice) {
        let observers: Vec<SessionObserver> = self.observers.lock().values().cloned().collect();
        for observer in observers {
            observer(notice);
        }
    }
}

#[cfg(test)]
#[path = "session_store_tests.rs"]
mod tests;
