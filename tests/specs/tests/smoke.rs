// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `paddock` binary and
//! exercise the WebSocket protocol, the hook socket, and shutdown.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

use paddock_specs::{http_get, PaddockProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(daemon: &PaddockProcess) -> anyhow::Result<WsStream> {
    let (ws, _) = tokio_tungstenite::connect_async(daemon.ws_url()).await?;
    Ok(ws)
}

async fn ws_send(ws: &mut WsStream, value: serde_json::Value) -> anyhow::Result<()> {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .map_err(|e| anyhow::anyhow!("ws send: {e}"))
}

async fn ws_recv_type(ws: &mut WsStream, msg_type: &str) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no {msg_type} arrived");
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream ended"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value["type"] == msg_type {
                return Ok(value);
            }
        }
    }
}

#[tokio::test]
async fn healthz_reports_running() -> anyhow::Result<()> {
    let daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let body = http_get(daemon.port(), "/healthz").await?;
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["status"], "running");
    assert!(parsed["uptime_secs"].is_number());
    assert_eq!(parsed["pty_sessions"], 0);

    Ok(())
}

#[tokio::test]
async fn ws_ping_pong() -> anyhow::Result<()> {
    let daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let mut ws = ws_connect(&daemon).await?;
    ws_send(&mut ws, serde_json::json!({"type": "ping"})).await?;
    let resp = ws_recv_type(&mut ws, "pong").await?;
    assert_eq!(resp["type"], "pong");

    Ok(())
}

#[tokio::test]
async fn session_lifecycle_over_ws() -> anyhow::Result<()> {
    let daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let mut ws = ws_connect(&daemon).await?;
    ws_send(
        &mut ws,
        serde_json::json!({
            "type": "session.create",
            "project_id": "smoke",
            "repo_root": "/tmp",
            "command": ["sh", "-c", "printf smoke-marker; sleep 2"],
        }),
    )
    .await?;

    let created = ws_recv_type(&mut ws, "session.created").await?;
    let session_id = created["session_id"].as_str().unwrap_or_default().to_owned();
    assert!(created["pid"].as_u64().unwrap_or(0) > 0);

    ws_send(
        &mut ws,
        serde_json::json!({"type": "session.attach", "session_id": session_id, "from_seq": 0}),
    )
    .await?;

    // Output arrives (replayed or live), then the session ends cleanly.
    let mut seen_output = false;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session never finished");
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream ended"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
        let Message::Text(text) = msg else { continue };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        match value["type"].as_str() {
            Some("event") => {
                if value["event"]["type"] == "stdout"
                    && value["event"]["data"]
                        .as_str()
                        .unwrap_or_default()
                        .contains("smoke-marker")
                {
                    seen_output = true;
                }
            }
            Some("session.ended") => {
                assert_eq!(value["session_id"].as_str(), Some(session_id.as_str()));
                assert_eq!(value["exit_code"], 0);
                break;
            }
            _ => {}
        }
    }
    assert!(seen_output, "never saw session output");

    Ok(())
}

#[tokio::test]
async fn hook_socket_accepts_lines() -> anyhow::Result<()> {
    let daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let mut ws = ws_connect(&daemon).await?;
    ws_send(
        &mut ws,
        serde_json::json!({
            "type": "session.create",
            "project_id": "smoke",
            "repo_root": "/tmp",
            "command": ["sleep", "10"],
        }),
    )
    .await?;
    let created = ws_recv_type(&mut ws, "session.created").await?;
    let session_id = created["session_id"].as_str().unwrap_or_default().to_owned();
    ws_send(&mut ws, serde_json::json!({"type": "session.attach", "session_id": session_id}))
        .await?;
    ws_recv_type(&mut ws, "session.status").await?;

    let mut stream = tokio::net::UnixStream::connect(daemon.hook_socket()).await?;
    let line = serde_json::json!({
        "fleet_session_id": session_id,
        "hook_type": "PreToolUse",
        "tool_name": "Bash",
    });
    stream.write_all(format!("{line}\n").as_bytes()).await?;

    let event = ws_recv_type(&mut ws, "event").await?;
    assert_eq!(event["event"]["type"], "tool");
    assert_eq!(event["event"]["tool_name"], "Bash");

    Ok(())
}

#[tokio::test]
async fn fleet_subscribe_round_trip() -> anyhow::Result<()> {
    let daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    // Creating a session appends a session_started outbox event.
    let mut ws = ws_connect(&daemon).await?;
    ws_send(
        &mut ws,
        serde_json::json!({
            "type": "session.create",
            "project_id": "smoke",
            "repo_root": "/tmp",
            "command": ["sleep", "5"],
        }),
    )
    .await?;
    ws_recv_type(&mut ws, "session.created").await?;

    ws_send(&mut ws, serde_json::json!({"type": "fleet.subscribe", "from_event_id": 0})).await?;
    let event = ws_recv_type(&mut ws, "fleet.event").await?;
    assert_eq!(event["event"]["type"], "session_started");
    assert_eq!(event["event"]["project_id"], "smoke");

    Ok(())
}

#[tokio::test]
async fn sigterm_shuts_down_cleanly() -> anyhow::Result<()> {
    let mut daemon = PaddockProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    daemon.terminate()?;
    let status = daemon.wait_exit(TIMEOUT).await?;
    assert!(status.success(), "expected clean exit, got {status}");

    // The hook socket file was removed on shutdown.
    assert!(!daemon.hook_socket().exists());

    Ok(())
}
