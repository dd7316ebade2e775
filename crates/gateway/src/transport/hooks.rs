// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-domain-socket listener for hook IPC.
//!
//! Hook senders connect, write one JSON object per newline-terminated
//! line, and disconnect. Lines that fail to parse or carry no
//! `fleet_session_id` are silently dropped at this boundary.

use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::event::{parse_hook_line, HookPayload};

/// Bind the hook socket. A stale socket file from a previous daemon is
/// removed first; a bind failure aborts startup.
pub fn bind_hook_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create hook socket dir {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale hook socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("unlink {}", path.display())),
    }
    UnixListener::bind(path).with_context(|| format!("bind hook socket {}", path.display()))
}

/// Accept hook connections until cancelled, forwarding parsed payloads to
/// the dispatch channel.
pub async fn run_hook_listener(
    listener: UnixListener,
    hook_tx: mpsc::UnboundedSender<HookPayload>,
    cancel: CancellationToken,
) {
    info!("hook listener ready");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let hook_tx = hook_tx.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, hook_tx, cancel).await;
                        });
                    }
                    Err(e) => {
                        debug!(err = %e, "hook socket accept failed");
                    }
                }
            }
        }
    }
}

/// Read newline-delimited JSON from one hook sender until EOF.
async fn handle_connection(
    stream: UnixStream,
    hook_tx: mpsc::UnboundedSender<HookPayload>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(payload) = parse_hook_line(&line) {
                            if hook_tx.send(payload).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(err = %e, "hook connection read error");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod tests;
