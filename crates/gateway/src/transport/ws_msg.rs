// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket message types for the gateway real-time protocol.
//!
//! Messages use internally-tagged JSON (`{"type": "session.attach", ...}`)
//! with two top-level enums covering the two directions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::event::SessionEvent;
use crate::job::{JobModel, JobRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "fleet.subscribe")]
    FleetSubscribe { from_event_id: u64 },
    #[serde(rename = "session.create")]
    SessionCreate {
        project_id: String,
        repo_root: PathBuf,
        #[serde(default)]
        command: Option<Vec<String>>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    #[serde(rename = "session.attach")]
    SessionAttach {
        session_id: String,
        #[serde(default)]
        from_seq: Option<u64>,
    },
    #[serde(rename = "session.detach")]
    SessionDetach { session_id: String },
    #[serde(rename = "session.stdin")]
    SessionStdin { session_id: String, data: String },
    #[serde(rename = "session.signal")]
    SessionSignal { session_id: String, signal: String },
    #[serde(rename = "session.resize")]
    SessionResize { session_id: String, cols: u16, rows: u16 },
    #[serde(rename = "job.create")]
    JobCreate { job: JobCreateBody },
    #[serde(rename = "job.cancel")]
    JobCancel { job_id: String },
    #[serde(rename = "commander.send")]
    CommanderSend { prompt: String },
    #[serde(rename = "commander.reset")]
    CommanderReset {},
}

/// Body of a `job.create` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub repo_root: Option<PathBuf>,
    pub model: JobModel,
    pub request: JobRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "fleet.event")]
    FleetEvent { event_id: u64, ts: String, event: Value },
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String, project_id: String, pid: u32 },
    #[serde(rename = "session.status")]
    SessionStatus { session_id: String, status: String },
    #[serde(rename = "session.ended")]
    SessionEnded {
        session_id: String,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    #[serde(rename = "event")]
    Event { session_id: String, seq: u64, event: SessionEvent },
    #[serde(rename = "commander.stdout")]
    CommanderStdout { session_id: String, seq: u64, event: SessionEvent },
    #[serde(rename = "commander.queued")]
    CommanderQueued { position: usize },
    #[serde(rename = "commander.status")]
    CommanderStatus { status: String },
    #[serde(rename = "job.started")]
    JobStarted {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
    #[serde(rename = "job.stream")]
    JobStream { job_id: String, chunk: Value },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Build a WebSocket error message.
pub fn ws_error(code: ErrorCode, message: &str) -> ServerMessage {
    ServerMessage::Error { code: code.as_str().to_owned(), message: message.to_owned() }
}

/// Build the outbound form of an outbox event.
pub fn fleet_event_msg(event: &crate::outbox::OutboxEvent) -> ServerMessage {
    let mut body = serde_json::Map::new();
    body.insert("type".to_owned(), Value::String(event.kind.clone()));
    if let Some(ref project_id) = event.project_id {
        body.insert("project_id".to_owned(), Value::String(project_id.clone()));
    }
    if let Some(ref briefing_id) = event.briefing_id {
        body.insert("briefing_id".to_owned(), Value::String(briefing_id.clone()));
    }
    body.insert("data".to_owned(), event.payload.clone());
    ServerMessage::FleetEvent {
        event_id: event.event_id,
        ts: event.ts.to_rfc3339(),
        event: Value::Object(body),
    }
}

#[cfg(test)]
#[path = "ws_msg_tests.rs"]
mod tests;
