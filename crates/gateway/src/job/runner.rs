// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One headless agent run: spawn the CLI in print mode, parse its
//! stream-json stdout line by line, and return the accumulated result.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{JobOutcome, JobResult, JobSpec, TokenUsage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const KNOWLEDGE_SYNC_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Runs a single headless subprocess and parses its structured output.
pub struct JobRunner {
    agent_bin: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl JobRunner {
    /// Create a runner for the given job kind; knowledge-sync jobs get a
    /// longer budget.
    pub fn new(agent_bin: impl Into<String>, kind: &str, cancel: CancellationToken) -> Self {
        let timeout =
            if kind == "knowledge_sync" { KNOWLEDGE_SYNC_TIMEOUT } else { DEFAULT_TIMEOUT };
        Self { agent_bin: agent_bin.into(), timeout, cancel }
    }

    /// Override the timeout budget (tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(test)]
    pub(crate) fn timeout_for_test(&self) -> Duration {
        self.timeout
    }

    /// Run to completion. Each stdout line that parses as a JSON object is
    /// passed to `on_chunk` and folded into the accumulator; other lines
    /// are discarded. The timeout is absolute, counted from spawn.
    pub async fn run(&self, spec: &JobSpec, on_chunk: &(dyn Fn(&Value) + Send + Sync)) -> JobOutcome {
        let args = build_args(spec);
        let mut cmd = Command::new(&self.agent_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return JobOutcome::failure(format!("spawn {}: {e}", self.agent_bin)),
        };

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return JobOutcome::failure("no stdout pipe");
        };
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut acc = StreamAccumulator::default();
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            if value.is_object() {
                                on_chunk(&value);
                                acc.feed(&value);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(err = %e, "job stdout read error");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        if timed_out || cancelled {
            terminate(&mut child).await;
            let _ = drain_stderr(stderr_task).await;
            return JobOutcome::failure(if cancelled { "cancelled" } else { "timed out" });
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => return JobOutcome::failure(format!("wait: {e}")),
        };
        let stderr_buf = drain_stderr(stderr_task).await;

        if !status.success() {
            let text = String::from_utf8_lossy(&stderr_buf).trim().to_string();
            let error =
                if text.is_empty() { format!("agent exited with {status}") } else { text };
            return JobOutcome::failure(error);
        }

        JobOutcome::success(acc.finish())
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        if let Ok(pid_i32) = i32::try_from(pid) {
            let _ = kill(Pid::from_raw(pid_i32), Signal::SIGTERM);
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("job ignored SIGTERM, sending SIGKILL");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

async fn drain_stderr(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Argument vector for the agent CLI in headless print mode.
pub fn build_args(spec: &JobSpec) -> Vec<String> {
    let req = &spec.request;
    let mut args = vec![
        "-p".to_owned(),
        req.prompt.clone(),
        "--output-format".to_owned(),
        "stream-json".to_owned(),
        "--verbose".to_owned(),
        "--dangerously-skip-permissions".to_owned(),
        "--model".to_owned(),
        spec.model.as_str().to_owned(),
    ];
    if let Some(ref resume) = req.resume {
        args.push("--resume".to_owned());
        args.push(resume.clone());
    }
    if let Some(max_turns) = req.max_turns {
        args.push("--max-turns".to_owned());
        args.push(max_turns.to_string());
    }
    if let Some(ref schema) = req.json_schema {
        args.push("--json-schema".to_owned());
        args.push(schema.to_string());
    }
    if !req.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_owned());
        args.push(req.disallowed_tools.join(","));
    }
    if let Some(ref system_prompt) = req.system_prompt {
        args.push("--system-prompt".to_owned());
        args.push(system_prompt.clone());
    }
    if let Some(ref append) = req.append_system_prompt {
        args.push("--append-system-prompt".to_owned());
        args.push(append.clone());
    }
    args
}

/// Incremental fold over stream-json chunks: text, thinking, tool uses,
/// and token usage.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: Vec<String>,
    thinking: Vec<String>,
    tool_uses: Vec<Value>,
    usage: TokenUsage,
}

impl StreamAccumulator {
    pub fn feed(&mut self, chunk: &Value) {
        if chunk.get("type").and_then(|v| v.as_str()) == Some("assistant") {
            if let Some(content) =
                chunk.get("message").and_then(|m| m.get("content")).and_then(|c| c.as_array())
            {
                for block in content {
                    match block.get("type").and_then(|v| v.as_str()) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                self.text.push(text.to_owned());
                            }
                        }
                        Some("thinking") => {
                            if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                                self.thinking.push(text.to_owned());
                            }
                        }
                        Some("tool_use") => self.tool_uses.push(block.clone()),
                        _ => {}
                    }
                }
            }
        }

        // Usage appears both on assistant messages and the final result.
        let usage = chunk
            .get("message")
            .and_then(|m| m.get("usage"))
            .or_else(|| chunk.get("usage"));
        if let Some(usage) = usage {
            let count = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
            self.usage.input_tokens += count("input_tokens");
            self.usage.output_tokens += count("output_tokens");
            self.usage.cache_read_input_tokens += count("cache_read_input_tokens");
            self.usage.cache_creation_input_tokens += count("cache_creation_input_tokens");
        }
    }

    pub fn finish(self) -> JobResult {
        JobResult {
            text: self.text.join("\n"),
            thinking: self.thinking.join("\n"),
            tool_uses: self.tool_uses,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
