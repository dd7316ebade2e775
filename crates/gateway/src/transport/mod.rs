// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server wiring: the dependency record handed to every handler, the
//! merger registry, the central dispatch loop, and the axum router.

pub mod hooks;
pub mod outbound;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::commander::{CommanderManager, CommanderNotice};
use crate::event::{HookPayload, SessionEvent, SessionStatus};
use crate::job::JobManager;
use crate::merge::EventMerger;
use crate::outbox::{OutboxEvent, OutboxStore, OutboxTailer};
use crate::pty::PtyBridge;
use crate::session_store::{SessionStore, SessionUpdate};
use crate::subscription::{Category, SubscriptionManager};
use crate::transport::ws::msg::{fleet_event_msg, ServerMessage};

/// How long a lifecycle/fleet/commander delivery may wait for queue space
/// before the offending client is closed.
pub const CRITICAL_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Immutable settings snapshot shared with handlers.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub agent_bin: String,
    pub ring_budget: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

/// Per-session mergers, created on session creation and dropped on exit.
///
/// Writes go through the dispatch loop only; reads (replay) copy out
/// under the entry lock.
pub struct MergerRegistry {
    mergers: parking_lot::RwLock<HashMap<String, Arc<parking_lot::Mutex<EventMerger>>>>,
    ring_budget: usize,
}

impl MergerRegistry {
    pub fn new(ring_budget: usize) -> Self {
        Self { mergers: parking_lot::RwLock::new(HashMap::new()), ring_budget }
    }

    pub fn create(&self, session_id: &str) -> Arc<parking_lot::Mutex<EventMerger>> {
        let merger = Arc::new(parking_lot::Mutex::new(EventMerger::new(
            session_id,
            self.ring_budget,
        )));
        self.mergers.write().insert(session_id.to_owned(), Arc::clone(&merger));
        merger
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<parking_lot::Mutex<EventMerger>>> {
        self.mergers.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.mergers.write().remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.mergers.read().contains_key(session_id)
    }
}

/// PTY notifications funneled from bridge callbacks into the dispatch
/// loop, which is the single writer of every merger.
#[derive(Debug)]
pub enum PtyNotice {
    Output { session_id: String, data: Bytes },
    Exit { session_id: String, code: Option<i32>, signal: Option<i32> },
}

/// Everything a handler can reach, wired explicitly at startup.
pub struct Deps {
    pub settings: GatewaySettings,
    pub bridge: Arc<PtyBridge>,
    pub mergers: Arc<MergerRegistry>,
    pub outbox: Arc<OutboxStore>,
    pub tailer: Arc<OutboxTailer>,
    pub jobs: Arc<JobManager>,
    pub sessions: Arc<SessionStore>,
    pub subs: Arc<SubscriptionManager>,
    pub commander: Arc<CommanderManager>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    /// Hook events dropped because no merger knows their session id.
    pub hook_drops: AtomicU64,
}

impl Deps {
    /// Fan a session event out to the clients the routing matrix selects.
    /// Session events are lossy per client (drop-oldest).
    fn broadcast_session_event(&self, session_id: &str, seq: u64, event: SessionEvent) {
        let commander_owned = self.commander.owns_session(session_id);
        let (category, msg) = if commander_owned {
            (
                Category::Commander,
                ServerMessage::CommanderStdout {
                    session_id: session_id.to_owned(),
                    seq,
                    event,
                },
            )
        } else {
            (
                Category::Session,
                ServerMessage::Event { session_id: session_id.to_owned(), seq, event },
            )
        };
        for client in self.subs.get_recipients(category, Some(session_id)) {
            client.queue.push_event(msg.clone());
        }
    }

    /// Deliver a message that must not be dropped; clients that cannot
    /// take it within the timeout are closed.
    pub async fn broadcast_critical(
        &self,
        category: Category,
        session_id: Option<&str>,
        msg: ServerMessage,
    ) {
        for client in self.subs.get_recipients(category, session_id) {
            if !client.queue.push_critical(msg.clone(), CRITICAL_SEND_TIMEOUT).await {
                warn!(client_id = client.id, "client too slow, closing");
                client.queue.close();
            }
        }
    }
}

/// Run the central dispatch loop: the single writer of all mergers,
/// fed by PTY callbacks, the hook listener, and the outbox tailer.
pub async fn run_dispatch(
    deps: Arc<Deps>,
    mut pty_rx: mpsc::UnboundedReceiver<PtyNotice>,
    mut hook_rx: mpsc::UnboundedReceiver<HookPayload>,
    mut fleet_rx: mpsc::UnboundedReceiver<OutboxEvent>,
) {
    loop {
        tokio::select! {
            _ = deps.shutdown.cancelled() => break,

            notice = pty_rx.recv() => {
                match notice {
                    Some(PtyNotice::Output { session_id, data }) => {
                        let Some(merger) = deps.mergers.get(&session_id) else {
                            continue;
                        };
                        let (seq, event) = merger.lock().add_stdout(&data);
                        deps.broadcast_session_event(&session_id, seq, event);
                    }
                    Some(PtyNotice::Exit { session_id, code, signal }) => {
                        deps.sessions.remove(&session_id);
                        deps.mergers.remove(&session_id);
                        deps.commander.handle_pty_exit(&session_id);
                        deps.broadcast_critical(
                            Category::Lifecycle,
                            Some(&session_id),
                            ServerMessage::SessionEnded {
                                session_id: session_id.clone(),
                                exit_code: code,
                                signal,
                            },
                        )
                        .await;
                    }
                    None => break,
                }
            }

            hook = hook_rx.recv() => {
                let Some(hook) = hook else { break };
                let Some(merger) = deps.mergers.get(&hook.fleet_session_id) else {
                    // Unknown session: dropped by decision, but observable.
                    deps.hook_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session_id = %hook.fleet_session_id,
                        "hook event for unregistered session dropped"
                    );
                    continue;
                };
                let merged = merger.lock().add_hook(&hook);
                if let Some((seq, event)) = merged {
                    if let SessionEvent::StatusChange { ref to, .. } = event {
                        deps.sessions.update(
                            &hook.fleet_session_id,
                            SessionUpdate {
                                status: Some(SessionStatus::from_external(to)),
                                status_block: None,
                            },
                        );
                    }
                    deps.broadcast_session_event(&hook.fleet_session_id, seq, event);
                }
            }

            fleet = fleet_rx.recv() => {
                let Some(event) = fleet else { break };
                deps.broadcast_critical(Category::Fleet, None, fleet_event_msg(&event)).await;
            }
        }
    }
    debug!("dispatch loop stopped");
}

/// Forward commander queue/status notices to commander-category clients.
pub async fn run_commander_forwarder(deps: Arc<Deps>) {
    let mut rx = deps.commander.subscribe_notices();
    loop {
        tokio::select! {
            _ = deps.shutdown.cancelled() => break,
            notice = rx.recv() => {
                let msg = match notice {
                    Ok(CommanderNotice::Queued { position }) => {
                        ServerMessage::CommanderQueued { position }
                    }
                    Ok(CommanderNotice::StatusChanged { status }) => {
                        ServerMessage::CommanderStatus { status: status.as_str().to_owned() }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                deps.broadcast_critical(Category::Commander, None, msg).await;
            }
        }
    }
}

/// Build the axum router: the WebSocket surface plus a health probe.
pub fn build_router(deps: Arc<Deps>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .with_state(deps)
}

async fn healthz(
    axum::extract::State(deps): axum::extract::State<Arc<Deps>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "running",
        "uptime_secs": deps.started_at.elapsed().as_secs(),
        "pty_sessions": deps.bridge.count(),
        "tracked_sessions": deps.sessions.count(),
        "ws_clients": deps.subs.count(),
        "orphans": deps.bridge.orphans().len(),
        "hook_drops": deps.hook_drops.load(Ordering::Relaxed),
    }))
}
