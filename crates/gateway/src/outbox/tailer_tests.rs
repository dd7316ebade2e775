// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::outbox::store::NewOutboxEvent;

fn new_event(kind: &str) -> NewOutboxEvent {
    NewOutboxEvent { kind: kind.to_owned(), ..Default::default() }
}

fn collecting_listener() -> (OutboxListener, Arc<parking_lot::Mutex<Vec<u64>>>) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let listener: OutboxListener = Arc::new(move |event: &OutboxEvent| {
        seen_clone.lock().push(event.event_id);
    });
    (listener, seen)
}

#[tokio::test]
async fn cursor_starts_at_latest_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OutboxStore::open(dir.path()).unwrap());
    store.append(new_event("pre-existing")).unwrap();
    store.append(new_event("pre-existing")).unwrap();

    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&store), Duration::from_millis(10)));
    assert_eq!(tailer.cursor(), 2);

    let (listener, seen) = collecting_listener();
    let _sub = tailer.subscribe(listener);

    // A tick with nothing new delivers nothing.
    tailer.tick_for_test();
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn new_events_are_delivered_in_id_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OutboxStore::open(dir.path()).unwrap());
    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&store), Duration::from_millis(10)));

    let (listener, seen) = collecting_listener();
    let _sub = tailer.subscribe(listener);

    for _ in 0..5 {
        store.append(new_event("x")).unwrap();
    }
    tailer.tick_for_test();

    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(tailer.cursor(), 5);
    assert_eq!(store.delivered_through(), 5);

    // Next tick is quiet.
    tailer.tick_for_test();
    assert_eq!(seen.lock().len(), 5);
}

#[tokio::test]
async fn replay_does_not_move_cursor_or_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OutboxStore::open(dir.path()).unwrap());
    for _ in 0..3 {
        store.append(new_event("x")).unwrap();
    }
    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&store), Duration::from_millis(10)));

    let replayed = tailer.events_after(1, 100);
    assert_eq!(replayed.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(tailer.cursor(), 3);
    assert_eq!(store.delivered_through(), 0);

    // Replaying the same range twice produces the same result.
    let again = tailer.events_after(1, 100);
    assert_eq!(again.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![2, 3]);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OutboxStore::open(dir.path()).unwrap());
    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&store), Duration::from_millis(10)));

    let (listener, seen) = collecting_listener();
    let sub = tailer.subscribe(listener);

    store.append(new_event("x")).unwrap();
    tailer.tick_for_test();
    assert_eq!(seen.lock().len(), 1);

    sub.unsubscribe();
    store.append(new_event("x")).unwrap();
    tailer.tick_for_test();
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn poll_loop_picks_up_appends() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(OutboxStore::open(dir.path()).unwrap());
    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&store), Duration::from_millis(10)));

    let (listener, seen) = collecting_listener();
    let _sub = tailer.subscribe(listener);
    tailer.start();

    store.append(new_event("x")).unwrap();
    store.append(new_event("y")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "tailer never delivered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*seen.lock(), vec![1, 2]);

    tailer.stop();
    // After stop, appends are no longer delivered.
    store.append(new_event("z")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 2);
}
