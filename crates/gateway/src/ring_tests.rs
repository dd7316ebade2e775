// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn stdout(data: &str) -> SessionEvent {
    SessionEvent::Stdout { data: data.to_owned() }
}

#[test]
fn push_assigns_increasing_seqs_from_one() {
    let mut ring = RingBuffer::new(4096);
    assert_eq!(ring.push(stdout("a")), 1);
    assert_eq!(ring.push(stdout("b")), 2);
    assert_eq!(ring.push(stdout("c")), 3);
    assert_eq!(ring.latest_seq(), 3);
}

#[test]
fn empty_ring_has_no_entries() {
    let ring = RingBuffer::new(64);
    assert_eq!(ring.latest_seq(), 0);
    assert!(ring.get_from(0).is_empty());
    assert_eq!(ring.oldest_seq(), None);
}

#[test]
fn get_from_returns_entries_after_seq() {
    let mut ring = RingBuffer::new(4096);
    ring.push(stdout("a"));
    ring.push(stdout("b"));
    ring.push(stdout("c"));

    let tail = ring.get_from(1);
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].seq, 2);
    assert_eq!(tail[1].seq, 3);

    assert!(ring.get_from(3).is_empty());
}

#[test]
fn eviction_is_oldest_first_and_bounded() {
    // {"type":"stdout","data":"AAAA"} is 31 bytes; a 120-byte budget holds
    // three entries.
    let mut ring = RingBuffer::new(120);
    for data in ["AAAA", "BBBB", "CCCC", "DDDD", "EEEE", "FFFF", "GGGG"] {
        ring.push(stdout(data));
    }

    let stats = ring.stats();
    assert!(stats.bytes <= 120, "bytes {} over budget", stats.bytes);
    assert_eq!(stats.newest_seq, Some(7));
    let oldest = stats.oldest_seq.unwrap_or(0);
    assert!(oldest > 1, "oldest entries must be evicted, got {oldest}");

    // Replay from 0 yields only the still-resident tail, in order.
    let tail = ring.get_from(0);
    assert_eq!(tail.first().map(|e| e.seq), Some(oldest));
    assert_eq!(tail.last().map(|e| e.seq), Some(7));
    let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (oldest..=7).collect();
    assert_eq!(seqs, expected, "no gaps inside the resident window");

    // Replay from the newest seq yields nothing.
    assert!(ring.get_from(7).is_empty());
}

#[test]
fn oversized_event_is_assigned_then_evicted() {
    let mut ring = RingBuffer::new(8);
    let seq = ring.push(stdout("this event is larger than the whole budget"));
    assert_eq!(seq, 1);
    assert_eq!(ring.stats().count, 0);
    assert_eq!(ring.latest_seq(), 1);
    // The next push continues the sequence.
    assert_eq!(ring.push(stdout("x")), 2);
}

#[test]
fn clear_preserves_seq_counter() {
    let mut ring = RingBuffer::new(4096);
    ring.push(stdout("a"));
    ring.push(stdout("b"));
    ring.clear();

    assert_eq!(ring.stats().count, 0);
    assert_eq!(ring.stats().bytes, 0);
    assert_eq!(ring.latest_seq(), 2);
    assert_eq!(ring.push(stdout("c")), 3);
}

#[test]
fn newest_seq_never_decreases() {
    let mut ring = RingBuffer::new(64);
    let mut prev = 0;
    for i in 0..50 {
        let seq = ring.push(stdout(&format!("chunk-{i}")));
        assert!(seq > prev);
        prev = seq;
        if let Some(newest) = ring.stats().newest_seq {
            assert_eq!(newest, seq);
        }
    }
}
