// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket handler: one connection = one registered client with an
//! outbound queue drained by a writer task and a reader loop dispatching
//! typed requests.

#[path = "ws_msg.rs"]
pub mod msg;
pub use msg::*;

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Deps, CRITICAL_SEND_TIMEOUT};
use crate::error::ErrorCode;
use crate::event::PtySignal;
use crate::job::{JobSpec, JobUpdate};
use crate::outbox::NewOutboxEvent;
use crate::pty::CreateSession;
use crate::subscription::{ClientHandle, ClientScope};
use crate::transport::outbound::OutboundQueue;

/// Outbound queue depth per client. Session events drop-oldest beyond
/// this; critical messages wait then close.
const OUTBOUND_CAPACITY: usize = 256;

/// Replay ceiling for `fleet.subscribe` catch-up.
const FLEET_REPLAY_LIMIT: usize = 1000;

/// "Going away": sent when the daemon shuts down or drops a slow client.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub scope: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    State(deps): State<Arc<Deps>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let scope = query
        .scope
        .as_deref()
        .and_then(ClientScope::from_name)
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_connection(deps, socket, scope))
}

/// Per-connection lifecycle: register, pump both directions, clean up.
async fn handle_connection(deps: Arc<Deps>, socket: WebSocket, scope: ClientScope) {
    let queue = Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY));
    let client = deps.subs.register(scope, Arc::clone(&queue));
    debug!(client_id = client.id, "ws client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue until it closes, then say goodbye.
    let writer_queue = Arc::clone(&queue);
    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_queue.pop().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "going away".into(),
            })))
            .await;
    });

    // Reader: dispatch typed requests until the peer goes away.
    while let Some(incoming) = ws_rx.next().await {
        let msg = match incoming {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => handle_client_message(&deps, &client, client_msg).await,
                    Err(_) => Some(ws_error(ErrorCode::BadRequest, "invalid message")),
                };
                if let Some(reply) = reply {
                    if !queue.push_critical(reply, CRITICAL_SEND_TIMEOUT).await {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect clears the attachment but never destroys sessions.
    if let Some(attached) = client.attached() {
        client.detach(&attached);
    }
    queue.close();
    deps.subs.unregister(client.id);
    let _ = writer.await;
    debug!(client_id = client.id, dropped = queue.dropped(), "ws client disconnected");
}

/// Handle one request, optionally producing a direct reply.
async fn handle_client_message(
    deps: &Arc<Deps>,
    client: &Arc<ClientHandle>,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Ping {} => Some(ServerMessage::Pong {}),

        ClientMessage::FleetSubscribe { from_event_id } => {
            client.set_fleet_subscribed(from_event_id);
            let replay = deps.tailer.events_after(from_event_id, FLEET_REPLAY_LIMIT);
            for event in &replay {
                if !client
                    .queue
                    .push_critical(fleet_event_msg(event), CRITICAL_SEND_TIMEOUT)
                    .await
                {
                    client.queue.close();
                    break;
                }
            }
            None
        }

        ClientMessage::SessionCreate { project_id, repo_root, command, cols, rows } => {
            let created = deps.bridge.create(CreateSession {
                project_id: project_id.clone(),
                cwd: repo_root,
                command,
                cols,
                rows,
                env: Vec::new(),
            });
            match created {
                Ok(info) => {
                    deps.mergers.create(&info.session_id);
                    deps.sessions.add_from_pty(
                        &info.session_id,
                        &info.project_id,
                        info.cwd.clone(),
                        info.pid,
                    );
                    let appended = deps.outbox.append(NewOutboxEvent {
                        kind: "session_started".to_owned(),
                        project_id: Some(project_id),
                        payload: serde_json::json!({"session_id": info.session_id}),
                        ..Default::default()
                    });
                    if let Err(e) = appended {
                        warn!(err = %e, "failed to append session_started outbox event");
                    }
                    Some(ServerMessage::SessionCreated {
                        session_id: info.session_id,
                        project_id: info.project_id,
                        pid: info.pid,
                    })
                }
                Err(e) => Some(ws_error(ErrorCode::SessionCreateFailed, &format!("{e:#}"))),
            }
        }

        ClientMessage::SessionAttach { session_id, from_seq } => {
            let merger = deps.mergers.get(&session_id);
            let tracked = deps.sessions.get(&session_id);
            if merger.is_none() && tracked.is_none() {
                return Some(ws_error(ErrorCode::SessionNotFound, &session_id));
            }

            client.attach(&session_id);

            // Buffered replay first; the merger assigns seqs, so the
            // hand-off to live events is seamless.
            if let Some(merger) = merger {
                let replay = merger.lock().events_from(from_seq.unwrap_or(0));
                for entry in replay {
                    let msg = ServerMessage::Event {
                        session_id: session_id.clone(),
                        seq: entry.seq,
                        event: entry.event,
                    };
                    if !client.queue.push_critical(msg, CRITICAL_SEND_TIMEOUT).await {
                        client.queue.close();
                        return None;
                    }
                }
            }

            let status = tracked
                .map(|s| s.status.as_str().to_owned())
                .unwrap_or_else(|| "working".to_owned());
            Some(ServerMessage::SessionStatus { session_id, status })
        }

        ClientMessage::SessionDetach { session_id } => {
            client.detach(&session_id);
            None
        }

        ClientMessage::SessionStdin { session_id, data } => {
            if !client.is_attached_to(&session_id) {
                return None;
            }
            if !deps.bridge.write(&session_id, data.as_bytes()).await {
                return Some(ws_error(ErrorCode::SessionNotFound, &session_id));
            }
            None
        }

        ClientMessage::SessionSignal { session_id, signal } => {
            let Some(signal) = PtySignal::from_name(&signal) else {
                return Some(ws_error(ErrorCode::BadRequest, &format!("unknown signal: {signal}")));
            };
            if !client.is_attached_to(&session_id) {
                return None;
            }
            if !deps.bridge.signal(&session_id, signal) {
                return Some(ws_error(ErrorCode::SessionNotFound, &session_id));
            }
            None
        }

        ClientMessage::SessionResize { session_id, cols, rows } => {
            if !client.is_attached_to(&session_id) {
                return None;
            }
            if !deps.bridge.resize(&session_id, cols, rows) {
                return Some(ws_error(ErrorCode::SessionNotFound, &session_id));
            }
            None
        }

        ClientMessage::JobCreate { job } => {
            let spec = JobSpec {
                kind: job.kind,
                model: job.model,
                project_id: job.project_id,
                cwd: job.repo_root,
                request: job.request,
            };
            let job_queue = Arc::clone(&client.queue);
            let listener: crate::job::JobListener = Arc::new(move |update: JobUpdate| {
                let msg = match update {
                    JobUpdate::Started { id, project_id } => {
                        ServerMessage::JobStarted { job_id: id, project_id }
                    }
                    JobUpdate::Stream { id, chunk } => {
                        ServerMessage::JobStream { job_id: id, chunk }
                    }
                    JobUpdate::Completed { id, ok, result, error } => {
                        ServerMessage::JobCompleted {
                            job_id: id,
                            ok,
                            result: result
                                .and_then(|r| serde_json::to_value(r).ok()),
                            error,
                        }
                    }
                };
                job_queue.push_event(msg);
            });
            match deps.jobs.submit(spec, listener) {
                Ok(_id) => None,
                Err(e) => Some(ws_error(ErrorCode::JobCreateFailed, &format!("{e:#}"))),
            }
        }

        ClientMessage::JobCancel { job_id } => {
            if deps.jobs.cancel(&job_id) {
                None
            } else {
                Some(ws_error(ErrorCode::BadRequest, &format!("unknown job: {job_id}")))
            }
        }

        ClientMessage::CommanderSend { prompt } => {
            match deps.commander.send_prompt(prompt).await {
                Ok(()) => None,
                Err(e) => Some(ws_error(ErrorCode::Internal, &format!("{e:#}"))),
            }
        }

        ClientMessage::CommanderReset {} => {
            deps.commander.reset().await;
            None
        }
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
