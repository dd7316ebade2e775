// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Fleet gateway daemon for AI coding-agent sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "paddock", version, about)]
pub struct Config {
    /// Host address to bind the WebSocket listener to.
    #[arg(long, env = "PADDOCK_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// WebSocket port to listen on.
    #[arg(long, env = "PADDOCK_PORT", default_value = "9717")]
    pub port: u16,

    /// Unix socket path for hook IPC (defaults to <base-dir>/hooks.sock).
    #[arg(long, env = "PADDOCK_HOOK_SOCKET")]
    pub hook_socket: Option<PathBuf>,

    /// State directory for recovery files, outbox, jobs, and status files.
    #[arg(long, env = "PADDOCK_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// External agent CLI resolved from PATH (or an absolute path).
    #[arg(long, env = "PADDOCK_AGENT_BIN", default_value = "claude")]
    pub agent_bin: String,

    /// Per-session replay buffer budget in bytes.
    #[arg(long, env = "PADDOCK_RING_BUDGET", default_value = "1048576")]
    pub ring_budget: usize,

    /// Default terminal columns for new sessions.
    #[arg(long, env = "PADDOCK_COLS", default_value = "200")]
    pub cols: u16,

    /// Default terminal rows for new sessions.
    #[arg(long, env = "PADDOCK_ROWS", default_value = "50")]
    pub rows: u16,

    /// Outbox poll interval in milliseconds.
    #[arg(long, env = "PADDOCK_OUTBOX_POLL_MS", default_value = "1000")]
    pub outbox_poll_ms: u64,

    /// Maximum number of concurrently running headless jobs.
    #[arg(long, env = "PADDOCK_JOB_SLOTS", default_value = "3")]
    pub job_slots: usize,

    /// Directory the external tool writes commander transcripts into.
    /// Watched to learn the commander's conversation id.
    #[arg(long, env = "PADDOCK_COMMANDER_PROJECT_DIR")]
    pub commander_project_dir: Option<PathBuf>,

    /// Working directory for commander subprocesses (defaults to cwd).
    #[arg(long, env = "PADDOCK_COMMANDER_CWD")]
    pub commander_cwd: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, env = "PADDOCK_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PADDOCK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ring_budget == 0 {
            anyhow::bail!("--ring-budget must be positive");
        }
        if self.job_slots == 0 {
            anyhow::bail!("--job-slots must be positive");
        }
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("--cols and --rows must be positive");
        }
        if let Some(ref dir) = self.base_dir {
            if dir.is_relative() {
                anyhow::bail!("--base-dir must be an absolute path");
            }
        }
        Ok(())
    }

    /// Resolved state directory (`--base-dir` or `~/.paddock`).
    pub fn base_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.base_dir {
            return dir.clone();
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
        PathBuf::from(home).join(".paddock")
    }

    /// Path of the hook IPC socket.
    pub fn hook_socket_path(&self) -> PathBuf {
        self.hook_socket.clone().unwrap_or_else(|| self.base_dir().join("hooks.sock"))
    }

    /// Directory holding PTY recovery files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.base_dir().join("sessions")
    }

    /// Directory holding externally-written session status files.
    pub fn status_dir(&self) -> PathBuf {
        self.base_dir().join("status")
    }

    /// Path of the persisted commander state.
    pub fn commander_state_path(&self) -> PathBuf {
        self.base_dir().join("commander.json")
    }

    /// Outbox poll interval.
    pub fn outbox_poll(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_ms.max(1))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
