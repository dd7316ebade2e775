// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `paddock` binary as a subprocess and exercises it over
//! WebSocket and the hook Unix socket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `paddock` binary.
pub fn paddock_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("paddock")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Make a raw HTTP/1.1 GET request, returning the response body.
pub async fn http_get(port: u16, path: &str) -> anyhow::Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8(buf)?;
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("").to_string();
    Ok(body)
}

/// A running `paddock` process that is killed on drop.
pub struct PaddockProcess {
    child: Child,
    port: u16,
    base_dir: PathBuf,
    _state_dir: tempfile::TempDir,
}

impl PaddockProcess {
    /// Spawn the daemon on a free port with an isolated state dir. The
    /// agent binary is a stub that exits immediately; sessions in smoke
    /// tests run explicit commands anyway.
    pub fn start() -> anyhow::Result<Self> {
        let binary = paddock_binary();
        anyhow::ensure!(binary.exists(), "paddock binary not found at {}", binary.display());

        let state_dir = tempfile::tempdir()?;
        let base_dir = state_dir.path().to_path_buf();
        let port = free_port()?;

        // Stub agent so commander/job spawns resolve to something real.
        let agent = base_dir.join("agent");
        std::fs::write(&agent, "#!/bin/sh\nexit 0\n")?;
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&agent)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&agent, perms)?;
        }

        let child = Command::new(&binary)
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--base-dir",
                &base_dir.to_string_lossy(),
                "--agent-bin",
                &agent.to_string_lossy(),
                "--log-format",
                "text",
                "--log-level",
                "warn",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, base_dir, _state_dir: state_dir })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// WebSocket URL of the daemon.
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Path of the hook IPC socket.
    pub fn hook_socket(&self) -> PathBuf {
        self.base_dir.join("hooks.sock")
    }

    /// Poll the health endpoint until the daemon responds.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("paddock did not become healthy within {timeout:?}");
            }
            if let Ok(body) = http_get(self.port, "/healthz").await {
                if body.contains("running") {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("paddock did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Deliver SIGTERM to the daemon for graceful-shutdown tests.
    pub fn terminate(&self) -> anyhow::Result<()> {
        let pid = i32::try_from(self.child.id())?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)?;
        Ok(())
    }
}

impl Drop for PaddockProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
