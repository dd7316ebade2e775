// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The commander: a single stateful meta-agent conversation driven one
//! prompt at a time, even though the underlying CLI is re-spawned per
//! prompt and resumed by conversation id.

pub mod prelude;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::SessionStatus;
use crate::outbox::OutboxStore;
use crate::pty::{CreateSession, PtyBridge};
use crate::session_store::{SessionNotice, SessionStore, SessionSubscription};
use crate::watch::await_new_jsonl;

/// Project id the commander's PTY sessions are created under.
pub const COMMANDER_PROJECT: &str = "commander";

const TRANSCRIPT_POLL: Duration = Duration::from_millis(500);

/// Commander-facing status, reduced from the richer session statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommanderStatus {
    Idle,
    Working,
    WaitingForInput,
}

impl CommanderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::WaitingForInput => "waiting_for_input",
        }
    }
}

impl From<SessionStatus> for CommanderStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Working => Self::Working,
            SessionStatus::WaitingForInput | SessionStatus::WaitingForApproval => {
                Self::WaitingForInput
            }
            SessionStatus::Idle | SessionStatus::Completed | SessionStatus::Error => Self::Idle,
        }
    }
}

/// A prompt waiting its turn.
#[derive(Debug, Clone)]
pub struct QueuedPrompt {
    pub prompt: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Notifications the server fans out to commander-category clients.
#[derive(Debug, Clone)]
pub enum CommanderNotice {
    Queued { position: usize },
    StatusChanged { status: CommanderStatus },
}

/// Point-in-time view of the commander.
#[derive(Debug, Clone)]
pub struct CommanderSnapshot {
    pub status: CommanderStatus,
    pub pty_session_id: Option<String>,
    pub external_id: Option<String>,
    pub queue_len: usize,
    pub turns: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    external_id: Option<String>,
}

struct Inner {
    status: CommanderStatus,
    pty_session_id: Option<String>,
    external_id: Option<String>,
    queue: VecDeque<QueuedPrompt>,
    /// Serializes queue draining: at most one drain in flight.
    draining: bool,
    first_turn_done: bool,
    fleet_cursor: u64,
    turns: u64,
    watcher_cancel: Option<CancellationToken>,
}

pub struct CommanderManager {
    bridge: Arc<PtyBridge>,
    outbox: Arc<OutboxStore>,
    sessions: Arc<SessionStore>,
    agent_bin: String,
    /// External tool's transcript directory, watched to learn the
    /// conversation id.
    project_dir: PathBuf,
    cwd: PathBuf,
    state_path: PathBuf,
    inner: parking_lot::Mutex<Inner>,
    notice_tx: broadcast::Sender<CommanderNotice>,
    store_sub: parking_lot::Mutex<Option<SessionSubscription>>,
}

impl CommanderManager {
    pub fn new(
        bridge: Arc<PtyBridge>,
        outbox: Arc<OutboxStore>,
        sessions: Arc<SessionStore>,
        agent_bin: impl Into<String>,
        project_dir: PathBuf,
        cwd: PathBuf,
        state_path: PathBuf,
    ) -> Self {
        let (notice_tx, _) = broadcast::channel(64);
        let fleet_cursor = outbox.latest_id();
        Self {
            bridge,
            outbox,
            sessions,
            agent_bin: agent_bin.into(),
            project_dir,
            cwd,
            state_path,
            inner: parking_lot::Mutex::new(Inner {
                status: CommanderStatus::Idle,
                pty_session_id: None,
                external_id: None,
                queue: VecDeque::new(),
                draining: false,
                first_turn_done: false,
                fleet_cursor,
                turns: 0,
                watcher_cancel: None,
            }),
            notice_tx,
            store_sub: parking_lot::Mutex::new(None),
        }
    }

    /// Load persisted conversation state and subscribe to session-store
    /// updates for readiness detection.
    pub fn initialize(self: &Arc<Self>) {
        if let Ok(contents) = std::fs::read_to_string(&self.state_path) {
            if let Ok(state) = serde_json::from_str::<PersistedState>(&contents) {
                if let Some(ref id) = state.external_id {
                    info!(external_id = %id, "resuming commander conversation");
                }
                self.inner.lock().external_id = state.external_id;
            }
        }

        let weak = Arc::downgrade(self);
        let sub = self.sessions.subscribe(Arc::new(move |notice: &SessionNotice| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            match notice {
                SessionNotice::Updated { session_id, update } => {
                    if let Some(status) = update.status {
                        manager.handle_external_status(session_id, status);
                    }
                }
                SessionNotice::Discovered { session } => {
                    manager.handle_external_status(&session.session_id, session.status);
                }
                SessionNotice::Removed { .. } => {}
            }
        }));
        *self.store_sub.lock() = Some(sub);
    }

    /// Subscribe to queue/status notices.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<CommanderNotice> {
        self.notice_tx.subscribe()
    }

    /// Send a prompt: runs immediately when the commander is not working,
    /// otherwise joins the queue.
    pub async fn send_prompt(self: &Arc<Self>, prompt: impl Into<String>) -> anyhow::Result<()> {
        let prompt = prompt.into();
        let queued_position = {
            let mut inner = self.inner.lock();
            if inner.status == CommanderStatus::Working {
                inner.queue.push_back(QueuedPrompt { prompt: prompt.clone(), enqueued_at: Utc::now() });
                Some(inner.queue.len())
            } else {
                inner.status = CommanderStatus::Working;
                inner.turns += 1;
                None
            }
        };

        match queued_position {
            Some(position) => {
                debug!(position, "commander busy, prompt queued");
                self.notify(CommanderNotice::Queued { position });
                Ok(())
            }
            None => {
                self.notify(CommanderNotice::StatusChanged { status: CommanderStatus::Working });
                self.launch(prompt).await
            }
        }
    }

    /// Build the full prompt and spawn one CLI turn in a PTY. Caller has
    /// already claimed the `Working` status.
    async fn launch(self: &Arc<Self>, prompt: String) -> anyhow::Result<()> {
        let (full_prompt, resume) = {
            let mut inner = self.inner.lock();
            let mut parts: Vec<String> = Vec::new();
            if !inner.first_turn_done {
                inner.first_turn_done = true;
                parts.push(prelude::reminder_block(prelude::SYSTEM_FRAMING));
            }
            if let Some(delta) = prelude::fleet_delta(&self.outbox, inner.fleet_cursor) {
                parts.push(prelude::reminder_block(&delta));
            }
            inner.fleet_cursor = self.outbox.latest_id();
            parts.push(prompt);
            (parts.join("\n\n"), inner.external_id.clone())
        };

        if resume.is_none() {
            self.spawn_transcript_watcher();
        }

        let mut command = vec![
            self.agent_bin.clone(),
            "-p".to_owned(),
            full_prompt,
            "--dangerously-skip-permissions".to_owned(),
        ];
        if let Some(ref external_id) = resume {
            command.push("--resume".to_owned());
            command.push(external_id.clone());
        }

        let created = self.bridge.create(CreateSession {
            project_id: COMMANDER_PROJECT.to_owned(),
            cwd: self.cwd.clone(),
            command: Some(command),
            ..Default::default()
        });

        match created {
            Ok(info) => {
                self.inner.lock().pty_session_id = Some(info.session_id.clone());
                self.sessions.add_from_pty(
                    &info.session_id,
                    COMMANDER_PROJECT,
                    info.cwd.clone(),
                    info.pid,
                );
                Ok(())
            }
            Err(e) => {
                warn!(err = %e, "commander subprocess spawn failed");
                self.set_status(CommanderStatus::Idle);
                Err(e)
            }
        }
    }

    /// Readiness signal from either source: the PTY session's updates or
    /// the status file keyed by the external conversation id.
    fn handle_external_status(self: &Arc<Self>, session_id: &str, status: SessionStatus) {
        let relevant = {
            let inner = self.inner.lock();
            inner.pty_session_id.as_deref() == Some(session_id)
                || inner.external_id.as_deref() == Some(session_id)
        };
        if !relevant {
            return;
        }

        let mapped = CommanderStatus::from(status);
        self.set_status(mapped);
        if matches!(mapped, CommanderStatus::WaitingForInput | CommanderStatus::Idle) {
            self.maybe_drain();
        }
    }

    /// PTY exit for our active subprocess: back to idle, then drain.
    pub fn handle_pty_exit(self: &Arc<Self>, session_id: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.pty_session_id.as_deref() != Some(session_id) {
                return;
            }
            inner.pty_session_id = None;
        }
        self.set_status(CommanderStatus::Idle);
        self.maybe_drain();
    }

    /// Pop and run the queue head if the commander is ready and no drain
    /// is already in flight.
    fn maybe_drain(self: &Arc<Self>) {
        let next = {
            let mut inner = self.inner.lock();
            if inner.draining
                || inner.queue.is_empty()
                || inner.status == CommanderStatus::Working
            {
                return;
            }
            inner.draining = true;
            inner.queue.pop_front()
        };
        let Some(next) = next else {
            return;
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            debug!("draining queued commander prompt");
            if let Err(e) = manager.send_prompt(next.prompt).await {
                warn!(err = %e, "queued commander prompt failed");
            }
            manager.inner.lock().draining = false;
        });
    }

    /// Abort the in-flight turn. Queued prompts are kept; the PTY exit
    /// path drives the next drain.
    pub async fn cancel(self: &Arc<Self>) {
        let pty_id = self.inner.lock().pty_session_id.clone();
        if let Some(ref id) = pty_id {
            info!(session_id = %id, "cancelling commander turn");
            self.bridge.stop(id).await;
        }
    }

    /// Full teardown: stop the subprocess, close watchers, clear all state
    /// including the queue and the persisted conversation id.
    pub async fn reset(self: &Arc<Self>) {
        let (pty_id, watcher) = {
            let mut inner = self.inner.lock();
            let pty_id = inner.pty_session_id.take();
            let watcher = inner.watcher_cancel.take();
            inner.queue.clear();
            inner.external_id = None;
            inner.first_turn_done = false;
            inner.draining = false;
            inner.turns = 0;
            inner.fleet_cursor = self.outbox.latest_id();
            (pty_id, watcher)
        };

        if let Some(cancel) = watcher {
            cancel.cancel();
        }
        if let Some(ref id) = pty_id {
            self.bridge.stop(id).await;
        }
        if let Err(e) = std::fs::remove_file(&self.state_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(err = %e, "failed to remove commander state file");
            }
        }
        self.set_status(CommanderStatus::Idle);
        info!("commander reset");
    }

    /// Daemon shutdown: stop the subprocess and watchers but keep the
    /// persisted conversation id for resumption.
    pub async fn shutdown(self: &Arc<Self>) {
        let (pty_id, watcher) = {
            let mut inner = self.inner.lock();
            (inner.pty_session_id.take(), inner.watcher_cancel.take())
        };
        if let Some(cancel) = watcher {
            cancel.cancel();
        }
        if let Some(ref id) = pty_id {
            self.bridge.stop(id).await;
        }
    }

    pub fn state(&self) -> CommanderSnapshot {
        let inner = self.inner.lock();
        CommanderSnapshot {
            status: inner.status,
            pty_session_id: inner.pty_session_id.clone(),
            external_id: inner.external_id.clone(),
            queue_len: inner.queue.len(),
            turns: inner.turns,
        }
    }

    pub fn pty_session_id(&self) -> Option<String> {
        self.inner.lock().pty_session_id.clone()
    }

    /// Whether `session_id` is the commander's active PTY session.
    pub fn owns_session(&self, session_id: &str) -> bool {
        self.inner.lock().pty_session_id.as_deref() == Some(session_id)
    }

    fn set_status(&self, status: CommanderStatus) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.status == status {
                false
            } else {
                inner.status = status;
                true
            }
        };
        if changed {
            self.notify(CommanderNotice::StatusChanged { status });
        }
    }

    fn notify(&self, notice: CommanderNotice) {
        let _ = self.notice_tx.send(notice);
    }

    /// Watch the external tool's project directory for the transcript file
    /// that names our conversation. Replaces any previous watcher.
    fn spawn_transcript_watcher(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.watcher_cancel.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let weak = Arc::downgrade(self);
        let project_dir = self.project_dir.clone();
        tokio::spawn(async move {
            let Some(stem) = await_new_jsonl(&project_dir, TRANSCRIPT_POLL, cancel).await else {
                return;
            };
            let Some(manager) = weak.upgrade() else {
                return;
            };
            info!(external_id = %stem, "captured commander conversation id");
            manager.inner.lock().external_id = Some(stem.clone());
            let state = PersistedState { external_id: Some(stem) };
            match serde_json::to_string(&state) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&manager.state_path, json) {
                        warn!(err = %e, "failed to persist commander state");
                    }
                }
                Err(e) => warn!(err = %e, "failed to serialize commander state"),
            }
        });
    }
}

#[cfg(test)]
#[path = "commander_tests.rs"]
mod tests;
