// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use yare::parameterized;

use super::*;

fn queue() -> Arc<OutboundQueue> {
    Arc::new(OutboundQueue::new(16))
}

fn ids(recipients: &[Arc<ClientHandle>]) -> Vec<u64> {
    let mut ids: Vec<u64> = recipients.iter().map(|c| c.id).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn lifecycle_reaches_every_scope() {
    let manager = SubscriptionManager::new();
    let a = manager.register(ClientScope::Global, queue());
    let b = manager.register(ClientScope::Session, queue());
    let c = manager.register(ClientScope::Observer, queue());

    let recipients = manager.get_recipients(Category::Lifecycle, None);
    assert_eq!(ids(&recipients), vec![a.id, b.id, c.id]);
}

#[test]
fn fleet_requires_subscription_regardless_of_scope() {
    let manager = SubscriptionManager::new();
    let a = manager.register(ClientScope::Global, queue());
    let b = manager.register(ClientScope::Session, queue());
    let c = manager.register(ClientScope::Observer, queue());

    assert!(manager.get_recipients(Category::Fleet, None).is_empty());

    b.set_fleet_subscribed(10);
    c.set_fleet_subscribed(0);
    let recipients = manager.get_recipients(Category::Fleet, None);
    assert_eq!(ids(&recipients), vec![b.id, c.id]);
    assert_eq!(b.fleet_cursor(), 10);
    let _ = a;
}

#[parameterized(
    global_gets_all = { ClientScope::Global, false, true },
    session_needs_subscription = { ClientScope::Session, false, false },
    session_subscribed = { ClientScope::Session, true, true },
    observer_never = { ClientScope::Observer, true, false },
)]
fn session_category_matrix(scope: ClientScope, subscribed: bool, expected: bool) {
    let manager = SubscriptionManager::new();
    let client = manager.register(scope, queue());
    if subscribed {
        client.subscribe_session("s1");
    }

    let recipients = manager.get_recipients(Category::Session, Some("s1"));
    assert_eq!(!recipients.is_empty(), expected);
}

#[test]
fn session_category_matches_exact_session() {
    let manager = SubscriptionManager::new();
    let client = manager.register(ClientScope::Session, queue());
    client.subscribe_session("s1");

    assert!(manager.get_recipients(Category::Session, Some("s2")).is_empty());
    assert_eq!(manager.get_recipients(Category::Session, Some("s1")).len(), 1);
}

#[parameterized(
    global = { ClientScope::Global, true },
    session = { ClientScope::Session, true },
    observer = { ClientScope::Observer, false },
)]
fn commander_category_matrix(scope: ClientScope, expected: bool) {
    let manager = SubscriptionManager::new();
    manager.register(scope, queue());
    let recipients = manager.get_recipients(Category::Commander, None);
    assert_eq!(!recipients.is_empty(), expected);
}

#[test]
fn attach_implies_subscription_and_detach_is_scoped() {
    let manager = SubscriptionManager::new();
    let client = manager.register(ClientScope::Session, queue());

    client.attach("s1");
    assert!(client.is_attached_to("s1"));
    assert!(client.is_subscribed("s1"));

    // Detaching some other id leaves the attachment alone.
    client.detach("s2");
    assert!(client.is_attached_to("s1"));

    client.detach("s1");
    assert!(client.attached().is_none());
    // The subscription survives detach; only the attachment is cleared.
    assert!(client.is_subscribed("s1"));
}

#[test]
fn unregister_removes_from_routing() {
    let manager = SubscriptionManager::new();
    let client = manager.register(ClientScope::Global, queue());
    assert_eq!(manager.count(), 1);

    manager.unregister(client.id);
    assert_eq!(manager.count(), 0);
    assert!(manager.get_recipients(Category::Lifecycle, None).is_empty());
}
