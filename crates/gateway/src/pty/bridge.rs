// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::spawn::PtyChild;
use crate::event::PtySignal;

/// Immutable description of a PTY-backed session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_id: String,
    pub cwd: PathBuf,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
}

/// Request to create a new PTY-backed session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub project_id: String,
    pub cwd: PathBuf,
    pub command: Option<Vec<String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub env: Vec<(String, String)>,
}

/// A PTY session recovered from a stale recovery file whose process is
/// still alive. Discoverable but not reattachable — the master fd died
/// with the previous daemon.
#[derive(Debug, Clone)]
pub struct RecoveredOrphan {
    pub session_id: String,
    pub project_id: String,
    pub pid: u32,
}

/// On-disk recovery record, one JSON object per PTY.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveryFile {
    pid: u32,
    session_id: String,
    project_id: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
}

/// Inter-signal waits used by [`PtyBridge::stop`]. Injectable so tests can
/// exercise the full escalation ladder quickly.
#[derive(Debug, Clone, Copy)]
pub struct EscalationTiming {
    pub int_wait: Duration,
    pub term_wait: Duration,
    pub kill_wait: Duration,
}

impl Default for EscalationTiming {
    fn default() -> Self {
        Self {
            int_wait: Duration::from_secs(3),
            term_wait: Duration::from_secs(5),
            kill_wait: Duration::from_secs(1),
        }
    }
}

/// Fires for every output chunk of any session.
pub type OutputCallback = Arc<dyn Fn(&str, Bytes) + Send + Sync>;
/// Fires exactly once per session, after the recovery file is deleted.
pub type ExitCallback = Arc<dyn Fn(&str, Option<i32>, Option<i32>) + Send + Sync>;

struct PtyEntry {
    info: SessionInfo,
    input_tx: mpsc::Sender<Bytes>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    cols: AtomicU16,
    rows: AtomicU16,
    exited: Arc<AtomicBool>,
}

/// Owns every local pseudo-terminal: spawn, I/O, resize, signal
/// escalation, and crash recovery via per-session PID files.
pub struct PtyBridge {
    sessions: parking_lot::RwLock<HashMap<String, Arc<PtyEntry>>>,
    orphans: parking_lot::Mutex<Vec<RecoveredOrphan>>,
    recovery_dir: PathBuf,
    default_command: Vec<String>,
    default_cols: u16,
    default_rows: u16,
    escalation: EscalationTiming,
    on_output: OutputCallback,
    on_exit: ExitCallback,
}

impl PtyBridge {
    pub fn new(
        recovery_dir: PathBuf,
        default_command: Vec<String>,
        default_cols: u16,
        default_rows: u16,
        on_output: OutputCallback,
        on_exit: ExitCallback,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&recovery_dir)
            .with_context(|| format!("create recovery dir {}", recovery_dir.display()))?;
        Ok(Self {
            sessions: parking_lot::RwLock::new(HashMap::new()),
            orphans: parking_lot::Mutex::new(Vec::new()),
            recovery_dir,
            default_command,
            default_cols,
            default_rows,
            escalation: EscalationTiming::default(),
            on_output,
            on_exit,
        })
    }

    /// Override the stop-escalation waits (tests).
    pub fn with_escalation(mut self, timing: EscalationTiming) -> Self {
        self.escalation = timing;
        self
    }

    /// Spawn a new PTY session. Failure is reported synchronously.
    pub fn create(self: &Arc<Self>, req: CreateSession) -> anyhow::Result<SessionInfo> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let cols = req.cols.unwrap_or(self.default_cols);
        let rows = req.rows.unwrap_or(self.default_rows);
        let command = match req.command {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => self.default_command.clone(),
        };

        // Resolve up front so a missing binary fails here, not as a
        // confusing instant exit inside the child.
        if !command_resolves(&command[0]) {
            anyhow::bail!("command not found: {}", command[0]);
        }

        let mut env = req.env;
        env.push(("PADDOCK_SESSION_ID".to_owned(), session_id.clone()));

        let child = PtyChild::spawn(&command, &req.cwd, cols, rows, &env)
            .with_context(|| format!("spawn {command:?}"))?;
        let pid = child.pid();

        let info = SessionInfo {
            session_id: session_id.clone(),
            project_id: req.project_id,
            cwd: req.cwd,
            pid: pid.as_raw() as u32,
            cols,
            rows,
            created_at: Utc::now(),
        };

        self.write_recovery_file(&info)?;

        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);
        let exited = Arc::new(AtomicBool::new(false));

        let entry = Arc::new(PtyEntry {
            info: info.clone(),
            input_tx,
            resize_tx,
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            exited: Arc::clone(&exited),
        });
        self.sessions.write().insert(session_id.clone(), entry);

        let bridge = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            let io = tokio::spawn(child.run(output_tx, input_rx, resize_rx));

            while let Some(chunk) = output_rx.recv().await {
                (bridge.on_output)(&id, chunk);
            }

            let status = match io.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(session_id = %id, err = %e, "pty io error");
                    super::ExitStatus { code: Some(1), signal: None }
                }
                Err(e) => {
                    warn!(session_id = %id, err = %e, "pty task panicked");
                    super::ExitStatus { code: Some(1), signal: None }
                }
            };

            exited.store(true, Ordering::Release);
            bridge.remove_recovery_file(&id);
            bridge.sessions.write().remove(&id);
            debug!(session_id = %id, code = ?status.code, signal = ?status.signal, "pty exited");
            (bridge.on_exit)(&id, status.code, status.signal);
        });

        info!(session_id = %session_id, pid = info.pid, "pty session created");
        Ok(info)
    }

    /// Write stdin bytes to a session's PTY. Returns false for a missing
    /// session or a closed input channel.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        entry.input_tx.send(Bytes::copy_from_slice(data)).await.is_ok()
    }

    /// Resize a session's terminal. Returns false for a missing session.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        entry.cols.store(cols, Ordering::Relaxed);
        entry.rows.store(rows, Ordering::Relaxed);
        entry.resize_tx.try_send((cols, rows)).is_ok()
    }

    /// Deliver a signal to a session's process group. Failure is logged
    /// but non-fatal.
    pub fn signal(&self, session_id: &str, sig: PtySignal) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        signal_group(entry.info.pid, sig.to_nix());
        true
    }

    /// Stop a session with signal escalation: SIGINT, then SIGTERM, then
    /// SIGKILL, each gated by a wait. Later stages are skipped once the
    /// child is observed dead.
    pub async fn stop(&self, session_id: &str) {
        let Some(entry) = self.entry(session_id) else {
            return;
        };
        let pid = entry.info.pid;

        signal_group(pid, Signal::SIGINT);
        if self.wait_for_death(&entry, self.escalation.int_wait).await {
            return;
        }

        debug!(session_id, "still alive after SIGINT, sending SIGTERM");
        signal_group(pid, Signal::SIGTERM);
        if self.wait_for_death(&entry, self.escalation.term_wait).await {
            return;
        }

        warn!(session_id, "still alive after SIGTERM, sending SIGKILL");
        signal_group(pid, Signal::SIGKILL);
        if self.wait_for_death(&entry, self.escalation.kill_wait).await {
            return;
        }

        // Unkillable (e.g. uninterruptible sleep). Drop our bookkeeping so
        // the id is not left dangling; the io task finishes whenever the
        // kernel lets go.
        warn!(session_id, pid, "process survived SIGKILL, forcing cleanup");
        self.remove_recovery_file(session_id);
        self.sessions.write().remove(session_id);
    }

    /// Stop every session in parallel.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop(id));
        futures_util::future::join_all(stops).await;
    }

    /// Scan the recovery directory for sessions left behind by a previous
    /// daemon. Live PIDs are registered as orphans; stale files are
    /// deleted.
    pub fn recover_orphans(&self) -> anyhow::Result<Vec<RecoveredOrphan>> {
        let mut recovered = Vec::new();
        let entries = match std::fs::read_dir(&self.recovery_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(recovered),
            Err(e) => return Err(e.into()),
        };

        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(record) = read_recovery_file(&path) else {
                debug!(path = %path.display(), "unreadable recovery file, deleting");
                let _ = std::fs::remove_file(&path);
                continue;
            };

            if is_process_alive(record.pid) {
                info!(
                    session_id = %record.session_id,
                    pid = record.pid,
                    "recovered orphan pty session"
                );
                recovered.push(RecoveredOrphan {
                    session_id: record.session_id,
                    project_id: record.project_id,
                    pid: record.pid,
                });
            } else {
                debug!(session_id = %record.session_id, "stale recovery file, deleting");
                let _ = std::fs::remove_file(&path);
            }
        }

        self.orphans.lock().clone_from(&recovered);
        Ok(recovered)
    }

    /// Orphans found by the last [`recover_orphans`](Self::recover_orphans)
    /// scan. Internal-only: never exposed as attachable sessions.
    pub fn orphans(&self) -> Vec<RecoveredOrphan> {
        self.orphans.lock().clone()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.entry(session_id).map(|e| {
            let mut info = e.info.clone();
            info.cols = e.cols.load(Ordering::Relaxed);
            info.rows = e.rows.load(Ordering::Relaxed);
            info
        })
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    fn entry(&self, session_id: &str) -> Option<Arc<PtyEntry>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Poll for child death until `timeout`. True if the child died.
    async fn wait_for_death(&self, entry: &PtyEntry, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if entry.exited.load(Ordering::Acquire) || !is_process_alive(entry.info.pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn recovery_path(&self, session_id: &str) -> PathBuf {
        self.recovery_dir.join(format!("{session_id}.pid"))
    }

    fn write_recovery_file(&self, info: &SessionInfo) -> anyhow::Result<()> {
        let record = RecoveryFile {
            pid: info.pid,
            session_id: info.session_id.clone(),
            project_id: info.project_id.clone(),
            cwd: info.cwd.clone(),
            created_at: info.created_at,
        };
        let json = serde_json::to_string(&record)?;
        std::fs::write(self.recovery_path(&info.session_id), json)
            .with_context(|| format!("write recovery file for {}", info.session_id))
    }

    fn remove_recovery_file(&self, session_id: &str) {
        let path = self.recovery_path(session_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id, err = %e, "failed to remove recovery file");
            }
        }
    }
}

/// True when `program` names an existing file, directly or via PATH.
fn command_resolves(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
}

/// Checks whether a process with the given PID is alive (null signal).
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// Send a signal to the process group rooted at `pid`, falling back to the
/// leader if the group id is gone.
fn signal_group(pid: u32, sig: Signal) {
    let pid_i32 = match i32::try_from(pid) {
        Ok(v) => v,
        Err(_) => return,
    };
    if kill(Pid::from_raw(-pid_i32), sig).is_err() {
        if let Err(e) = kill(Pid::from_raw(pid_i32), sig) {
            debug!(pid, sig = %sig, err = %e, "signal delivery failed");
        }
    }
}

/// Parse a recovery file, tolerating a missing or malformed body.
fn read_recovery_file(path: &Path) -> Option<RecoveryFile> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
