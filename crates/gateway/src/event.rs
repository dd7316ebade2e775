// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a session's merged event stream.
///
/// PTY bytes, hook-derived tool events, and status transitions all land in
/// this closed union. The wire form is the internally-tagged JSON object
/// sent to attached clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Stdout {
        data: String,
    },
    Tool {
        phase: ToolPhase,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    Progress {
        detail: String,
    },
    StatusChange {
        from: String,
        to: String,
    },
}

/// Which side of a tool invocation a tool event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Pre,
    Post,
}

/// A sequence-stamped event held in a session's replay buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    /// Approximate serialized size, used for buffer accounting.
    pub bytes: usize,
    pub event: SessionEvent,
}

/// UI-facing status of a tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Working,
    WaitingForInput,
    WaitingForApproval,
    Idle,
    Completed,
    Error,
}

impl SessionStatus {
    /// Wire-format string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::WaitingForInput => "waiting_for_input",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Total mapping from an externally-reported status string.
    ///
    /// Unknown values map to `Idle` so a misbehaving status file can never
    /// wedge a session in `Working`.
    pub fn from_external(s: &str) -> Self {
        match s {
            "working" => Self::Working,
            "waiting" | "waiting_for_input" => Self::WaitingForInput,
            "waiting_for_approval" => Self::WaitingForApproval,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals a client may deliver to a PTY-backed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySignal {
    Int,
    Term,
    Kill,
}

impl PtySignal {
    /// Parse a signal name (e.g. "SIGINT", "INT", "2") into a `PtySignal`.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        let bare: &str = match upper.strip_prefix("SIG") {
            Some(s) => s,
            None => &upper,
        };

        match bare {
            "INT" | "2" => Some(Self::Int),
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            _ => None,
        }
    }

    /// Convert to the corresponding `nix` signal for delivery.
    pub fn to_nix(self) -> Signal {
        match self {
            Self::Int => Signal::SIGINT,
            Self::Term => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

/// A parsed hook line received over the hook IPC socket.
///
/// Hook senders write one JSON object per newline-terminated line. The only
/// required field is `fleet_session_id`; everything else is optional and
/// interpreted by the per-session merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    pub fleet_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Parse a raw JSON line from the hook socket.
///
/// Returns `None` for malformed JSON or lines missing `fleet_session_id` —
/// such lines are silently dropped at the boundary.
pub fn parse_hook_line(line: &str) -> Option<HookPayload> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let payload: HookPayload = serde_json::from_str(trimmed).ok()?;
    if payload.fleet_session_id.is_empty() {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
