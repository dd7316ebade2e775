// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::*;
use crate::event::SessionStatus;
use crate::outbox::NewOutboxEvent;
use crate::session_store::SessionUpdate;

struct Harness {
    commander: Arc<CommanderManager>,
    bridge: Arc<PtyBridge>,
    sessions: Arc<SessionStore>,
    outbox: Arc<OutboxStore>,
    notices: tokio::sync::broadcast::Receiver<CommanderNotice>,
    args_log: std::path::PathBuf,
    project_dir: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// Build a commander whose agent is a stub recording its argv, one line
/// per argument, with a `----` separator per invocation.
fn harness(agent_body: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let args_log = dir.path().join("args.log");
    let agent = dir.path().join("agent");
    std::fs::write(
        &agent,
        format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" >> {}\necho ---- >> {}\n{agent_body}\n",
            args_log.display(),
            args_log.display()
        ),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&agent).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&agent, perms).unwrap();

    let sessions = Arc::new(SessionStore::new());
    let outbox = Arc::new(OutboxStore::open(&dir.path().join("outbox")).unwrap());

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();
    let bridge = Arc::new(
        PtyBridge::new(
            dir.path().join("sessions"),
            vec![agent.to_string_lossy().into_owned()],
            80,
            24,
            Arc::new(|_: &str, _: Bytes| {}),
            Arc::new(move |id: &str, _, _| {
                let _ = exit_tx.send(id.to_owned());
            }),
        )
        .unwrap(),
    );

    let project_dir = dir.path().join("transcripts");
    let commander = Arc::new(CommanderManager::new(
        Arc::clone(&bridge),
        Arc::clone(&outbox),
        Arc::clone(&sessions),
        agent.to_string_lossy().into_owned(),
        project_dir.clone(),
        std::env::temp_dir(),
        dir.path().join("commander.json"),
    ));
    commander.initialize();
    let notices = commander.subscribe_notices();

    // Forward PTY exits the way the server dispatch loop does.
    {
        let commander = Arc::clone(&commander);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Some(id) = exit_rx.recv().await {
                sessions.remove(&id);
                commander.handle_pty_exit(&id);
            }
        });
    }

    Harness { commander, bridge, sessions, outbox, notices, args_log, project_dir, _dir: dir }
}

fn invocations(args_log: &std::path::Path) -> Vec<Vec<String>> {
    let Ok(contents) = std::fs::read_to_string(args_log) else {
        return Vec::new();
    };
    contents
        .split("----\n")
        .map(|chunk| chunk.lines().map(str::to_owned).collect::<Vec<_>>())
        .filter(|args: &Vec<String>| !args.is_empty())
        .collect()
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn drain_notices(rx: &mut tokio::sync::broadcast::Receiver<CommanderNotice>) -> Vec<CommanderNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        out.push(notice);
    }
    out
}

#[test]
fn status_mapping_table() {
    assert_eq!(CommanderStatus::from(SessionStatus::Working), CommanderStatus::Working);
    assert_eq!(
        CommanderStatus::from(SessionStatus::WaitingForInput),
        CommanderStatus::WaitingForInput
    );
    assert_eq!(
        CommanderStatus::from(SessionStatus::WaitingForApproval),
        CommanderStatus::WaitingForInput
    );
    assert_eq!(CommanderStatus::from(SessionStatus::Idle), CommanderStatus::Idle);
    assert_eq!(CommanderStatus::from(SessionStatus::Completed), CommanderStatus::Idle);
    assert_eq!(CommanderStatus::from(SessionStatus::Error), CommanderStatus::Idle);
}

#[tokio::test]
async fn prompts_queue_while_working() {
    // Agent stays alive so the commander remains in Working.
    let mut h = harness("sleep 5");

    h.commander.send_prompt("boot").await.unwrap();
    assert_eq!(h.commander.state().status, CommanderStatus::Working);
    wait_for(|| h.bridge.count() == 1, "first spawn").await;
    let _ = drain_notices(&mut h.notices);

    h.commander.send_prompt("one").await.unwrap();
    h.commander.send_prompt("two").await.unwrap();
    h.commander.send_prompt("three").await.unwrap();

    let notices = drain_notices(&mut h.notices);
    let positions: Vec<usize> = notices
        .iter()
        .filter_map(|n| match n {
            CommanderNotice::Queued { position } => Some(*position),
            _ => None,
        })
        .collect();
    assert_eq!(positions, vec![1, 2, 3]);
    // No new subprocess spawned for queued prompts.
    assert_eq!(h.bridge.count(), 1);
    assert_eq!(h.commander.state().queue_len, 3);
}

#[tokio::test]
async fn queue_drains_one_prompt_per_transition() {
    // Agent exits immediately, so each turn ends on its own.
    let mut h = harness("exit 0");

    h.commander.send_prompt("boot").await.unwrap();
    // Exhaust the turn and let queued prompts drain turn by turn.
    h.commander.send_prompt("one").await.ok();
    h.commander.send_prompt("two").await.ok();

    wait_for(
        || h.commander.state().queue_len == 0 && h.commander.state().status == CommanderStatus::Idle,
        "queue drained",
    )
    .await;

    // Every prompt eventually became its own invocation.
    wait_for(|| invocations(&h.args_log).len() >= 1, "invocations recorded").await;
    let all = invocations(&h.args_log);
    let prompts: Vec<&str> = all
        .iter()
        .filter_map(|args| {
            args.iter().position(|a| a == "-p").and_then(|i| args.get(i + 1)).map(String::as_str)
        })
        .collect();
    let text = prompts.join("\n==\n");
    assert!(text.contains("boot"));
    assert!(text.contains("one") || h.commander.state().queue_len == 0);
    let _ = drain_notices(&mut h.notices);
}

#[tokio::test]
async fn waiting_for_input_status_drives_drain() {
    let mut h = harness("sleep 5");

    h.commander.send_prompt("boot").await.unwrap();
    wait_for(|| h.bridge.count() == 1, "spawn").await;
    h.commander.send_prompt("queued-prompt").await.unwrap();
    assert_eq!(h.commander.state().queue_len, 1);

    // External readiness arrives via the session store for the PTY id.
    let pty_id = h.commander.pty_session_id().unwrap();
    h.sessions.update(
        &pty_id,
        SessionUpdate { status: Some(SessionStatus::WaitingForInput), status_block: None },
    );

    wait_for(|| h.commander.state().queue_len == 0, "drain on waiting_for_input").await;
    wait_for(|| invocations(&h.args_log).len() >= 2, "second spawn").await;
    let _ = drain_notices(&mut h.notices);
}

#[tokio::test]
async fn first_turn_carries_framing_and_fleet_delta() {
    let h = harness("exit 0");
    h.outbox
        .append(NewOutboxEvent {
            kind: "session_blocked".to_owned(),
            project_id: Some("api".to_owned()),
            payload: serde_json::json!({"reason": "stuck"}),
            ..Default::default()
        })
        .unwrap();

    h.commander.send_prompt("first").await.unwrap();
    wait_for(|| !invocations(&h.args_log).is_empty(), "first invocation").await;
    wait_for(|| h.commander.state().status == CommanderStatus::Idle, "turn done").await;

    let first = &invocations(&h.args_log)[0];
    let prompt_idx = first.iter().position(|a| a == "-p").unwrap();
    let prompt = &first[prompt_idx + 1..]
        .iter()
        .take_while(|a| *a != "--dangerously-skip-permissions")
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    assert!(prompt.contains("<system-reminder>"));
    assert!(prompt.contains("fleet commander"));
    assert!(prompt.contains("session_blocked"));
    assert!(prompt.contains("first"));

    // Second turn: no framing, no delta (cursor advanced, nothing new).
    h.commander.send_prompt("second").await.unwrap();
    wait_for(|| invocations(&h.args_log).len() >= 2, "second invocation").await;
    let second = &invocations(&h.args_log)[1];
    let text = second.join("\n");
    assert!(!text.contains("fleet commander"));
    assert!(!text.contains("session_blocked"));
    assert!(text.contains("second"));
}

#[tokio::test]
async fn external_id_is_captured_and_used_for_resume() {
    let h = harness("exit 0");

    h.commander.send_prompt("first").await.unwrap();
    // The external tool writes its transcript; the watcher captures the id.
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::create_dir_all(&h.project_dir).unwrap();
    std::fs::write(h.project_dir.join("conv-abc.jsonl"), "{}\n").unwrap();

    wait_for(|| h.commander.state().external_id.is_some(), "external id captured").await;
    assert_eq!(h.commander.state().external_id.as_deref(), Some("conv-abc"));
    wait_for(|| h.commander.state().status == CommanderStatus::Idle, "turn done").await;

    h.commander.send_prompt("second").await.unwrap();
    wait_for(|| invocations(&h.args_log).len() >= 2, "second invocation").await;
    let second = invocations(&h.args_log).into_iter().nth(1).unwrap();
    let resume_idx = second.iter().position(|a| a == "--resume");
    assert!(resume_idx.is_some(), "second turn should resume: {second:?}");
    assert_eq!(second.get(resume_idx.unwrap() + 1).map(String::as_str), Some("conv-abc"));
}

#[tokio::test]
async fn reset_clears_queue_and_conversation() {
    let h = harness("sleep 5");

    h.commander.send_prompt("boot").await.unwrap();
    h.commander.send_prompt("queued").await.unwrap();
    wait_for(|| h.bridge.count() == 1, "spawn").await;

    h.commander.reset().await;

    let state = h.commander.state();
    assert_eq!(state.status, CommanderStatus::Idle);
    assert_eq!(state.queue_len, 0);
    assert!(state.external_id.is_none());
    assert!(state.pty_session_id.is_none());
    wait_for(|| h.bridge.count() == 0, "pty stopped").await;
}

#[tokio::test]
async fn spawn_failure_returns_to_idle() {
    let h = harness("exit 0");
    // Point the commander at a missing binary.
    let commander = Arc::new(CommanderManager::new(
        Arc::clone(&h.bridge),
        Arc::clone(&h.outbox),
        Arc::clone(&h.sessions),
        "/nonexistent/agent-bin",
        h.project_dir.clone(),
        std::env::temp_dir(),
        h._dir.path().join("c2.json"),
    ));
    commander.initialize();

    assert!(commander.send_prompt("hello").await.is_err());
    assert_eq!(commander.state().status, CommanderStatus::Idle);
}
