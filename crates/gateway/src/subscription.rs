// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client scope and routing rules for outbound messages.
//!
//! The routing matrix (scope × category):
//!
//! | category  | global              | session             | observer            |
//! |-----------|---------------------|---------------------|---------------------|
//! | lifecycle | deliver             | deliver             | deliver             |
//! | fleet     | if fleet-subscribed | if fleet-subscribed | if fleet-subscribed |
//! | session   | deliver             | if subscribed       | drop                |
//! | commander | deliver             | deliver             | drop                |
//!
//! Direct request/response traffic is written to a client's queue by its
//! own handler and never goes through here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::transport::outbound::OutboundQueue;

/// Routing baseline of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientScope {
    #[default]
    Global,
    Session,
    Observer,
}

impl ClientScope {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "global" => Some(Self::Global),
            "session" => Some(Self::Session),
            "observer" => Some(Self::Observer),
            _ => None,
        }
    }
}

/// Broadcast category of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Lifecycle,
    Fleet,
    Session,
    Commander,
}

#[derive(Debug, Default)]
struct ClientState {
    scope: ClientScope,
    subscribed: HashSet<String>,
    fleet_subscribed: bool,
    fleet_cursor: u64,
    attached: Option<String>,
}

/// Per-socket registration: scope, subscriptions, and the outbound queue.
pub struct ClientHandle {
    pub id: u64,
    pub queue: Arc<OutboundQueue>,
    state: parking_lot::Mutex<ClientState>,
}

impl ClientHandle {
    pub fn scope(&self) -> ClientScope {
        self.state.lock().scope
    }

    pub fn set_scope(&self, scope: ClientScope) {
        self.state.lock().scope = scope;
    }

    pub fn subscribe_session(&self, session_id: &str) {
        self.state.lock().subscribed.insert(session_id.to_owned());
    }

    pub fn unsubscribe_session(&self, session_id: &str) {
        self.state.lock().subscribed.remove(session_id);
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.state.lock().subscribed.contains(session_id)
    }

    pub fn set_fleet_subscribed(&self, cursor: u64) {
        let mut state = self.state.lock();
        state.fleet_subscribed = true;
        state.fleet_cursor = cursor;
    }

    pub fn fleet_subscribed(&self) -> bool {
        self.state.lock().fleet_subscribed
    }

    pub fn fleet_cursor(&self) -> u64 {
        self.state.lock().fleet_cursor
    }

    /// Attach to a session: the attached session also joins the
    /// subscribed set so its events are routed here.
    pub fn attach(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.attached = Some(session_id.to_owned());
        state.subscribed.insert(session_id.to_owned());
    }

    /// Detach if currently attached to `session_id`.
    pub fn detach(&self, session_id: &str) {
        let mut state = self.state.lock();
        if state.attached.as_deref() == Some(session_id) {
            state.attached = None;
        }
    }

    pub fn attached(&self) -> Option<String> {
        self.state.lock().attached.clone()
    }

    pub fn is_attached_to(&self, session_id: &str) -> bool {
        self.state.lock().attached.as_deref() == Some(session_id)
    }
}

/// Registry of connected clients with matrix-based recipient selection.
#[derive(Default)]
pub struct SubscriptionManager {
    clients: parking_lot::RwLock<HashMap<u64, Arc<ClientHandle>>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scope: ClientScope, queue: Arc<OutboundQueue>) -> Arc<ClientHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle {
            id,
            queue,
            state: parking_lot::Mutex::new(ClientState { scope, ..Default::default() }),
        });
        self.clients.write().insert(id, Arc::clone(&handle));
        handle
    }

    pub fn unregister(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    /// All registered clients (shutdown broadcast).
    pub fn all(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().values().cloned().collect()
    }

    /// Clients that should receive a message of `category`.
    /// `session_id` is required for (and only used by) the session
    /// category.
    pub fn get_recipients(
        &self,
        category: Category,
        session_id: Option<&str>,
    ) -> Vec<Arc<ClientHandle>> {
        let clients = self.clients.read();
        clients
            .values()
            .filter(|client| {
                let state = client.state.lock();
                match category {
                    Category::Lifecycle => true,
                    Category::Fleet => state.fleet_subscribed,
                    Category::Session => match state.scope {
                        ClientScope::Global => true,
                        ClientScope::Session => {
                            session_id.map(|id| state.subscribed.contains(id)).unwrap_or(false)
                        }
                        ClientScope::Observer => false,
                    },
                    Category::Commander => !matches!(state.scope, ClientScope::Observer),
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
