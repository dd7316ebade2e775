// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn new_event(kind: &str) -> NewOutboxEvent {
    NewOutboxEvent {
        kind: kind.to_owned(),
        payload: serde_json::json!({"detail": kind}),
        ..Default::default()
    }
}

#[test]
fn append_assigns_monotone_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = OutboxStore::open(dir.path()).unwrap();

    let a = store.append(new_event("briefing_added")).unwrap();
    let b = store.append(new_event("session_started")).unwrap();
    let c = store.append(new_event("job_completed")).unwrap();

    assert_eq!((a.event_id, b.event_id, c.event_id), (1, 2, 3));
    assert_eq!(store.latest_id(), 3);
}

#[test]
fn ids_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = OutboxStore::open(dir.path()).unwrap();
        store.append(new_event("a")).unwrap();
        store.append(new_event("b")).unwrap();
        store.mark_delivered_through(2).unwrap();
    }

    let store = OutboxStore::open(dir.path()).unwrap();
    assert_eq!(store.latest_id(), 2);
    assert_eq!(store.delivered_through(), 2);
    let next = store.append(new_event("c")).unwrap();
    assert_eq!(next.event_id, 3);
}

#[test]
fn events_after_filters_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let store = OutboxStore::open(dir.path()).unwrap();
    for i in 0..10 {
        store.append(new_event(&format!("kind-{i}"))).unwrap();
    }

    let tail = store.events_after(7, 100);
    assert_eq!(tail.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![8, 9, 10]);

    let limited = store.events_after(0, 4);
    assert_eq!(limited.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

    assert!(store.events_after(10, 100).is_empty());
}

#[test]
fn replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = OutboxStore::open(dir.path()).unwrap();
    for _ in 0..3 {
        store.append(new_event("x")).unwrap();
    }

    let first: Vec<u64> = store.events_after(0, 100).iter().map(|e| e.event_id).collect();
    let second: Vec<u64> = store.events_after(0, 100).iter().map(|e| e.event_id).collect();
    assert_eq!(first, second);
    // Replay never advances the delivered watermark.
    assert_eq!(store.delivered_through(), 0);
}

#[test]
fn watermark_is_monotone() {
    let dir = tempfile::tempdir().unwrap();
    let store = OutboxStore::open(dir.path()).unwrap();
    for _ in 0..5 {
        store.append(new_event("x")).unwrap();
    }

    store.mark_delivered_through(4).unwrap();
    store.mark_delivered_through(2).unwrap();
    assert_eq!(store.delivered_through(), 4);
}

#[test]
fn sweep_keeps_undelivered_and_recent_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = OutboxStore::open(dir.path()).unwrap();
    for i in 0..4 {
        store.append(new_event(&format!("kind-{i}"))).unwrap();
    }
    store.mark_delivered_through(2).unwrap();

    // Everything is recent, so nothing is dropped even though 1..=2 are
    // delivered.
    assert_eq!(store.sweep(Duration::from_secs(7 * 24 * 3600)).unwrap(), 0);

    // With zero retention, delivered rows go; undelivered rows stay.
    let dropped = store.sweep(Duration::ZERO).unwrap();
    assert_eq!(dropped, 2);
    let remaining: Vec<u64> = store.events_after(0, 100).iter().map(|e| e.event_id).collect();
    assert_eq!(remaining, vec![3, 4]);

    // Id assignment continues above swept ids after reopen.
    drop(store);
    let store = OutboxStore::open(dir.path()).unwrap();
    assert_eq!(store.append(new_event("next")).unwrap().event_id, 5);
}

#[test]
fn malformed_lines_are_skipped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = OutboxStore::open(dir.path()).unwrap();
        store.append(new_event("good")).unwrap();
    }
    let path = dir.path().join("outbox.jsonl");
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("this is not json\n");
    std::fs::write(&path, contents).unwrap();

    let store = OutboxStore::open(dir.path()).unwrap();
    assert_eq!(store.latest_id(), 1);
    assert_eq!(store.events_after(0, 100).len(), 1);
}
