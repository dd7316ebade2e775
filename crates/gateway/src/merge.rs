// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::event::{BufferedEvent, HookPayload, SessionEvent, ToolPhase};
use crate::ring::{RingBuffer, RingStats};

/// Transient record of a tool invocation that has seen its `pre` hook but
/// not yet the matching `post`.
#[derive(Debug, Clone)]
pub struct ActiveTool {
    pub tool_name: String,
    pub seq: u64,
    pub started_at: DateTime<Utc>,
}

/// Per-session interleaver of PTY output and hook events.
///
/// The merger is the single assigner of a session's sequence numbers:
/// every stdout chunk and every recognized hook event gets the next seq
/// and lands in the session's replay buffer in assignment order.
pub struct EventMerger {
    session_id: String,
    ring: RingBuffer,
    active_tool: Option<ActiveTool>,
}

impl EventMerger {
    pub fn new(session_id: impl Into<String>, ring_budget: usize) -> Self {
        Self { session_id: session_id.into(), ring: RingBuffer::new(ring_budget), active_tool: None }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a chunk of PTY output. Returns the assigned seq and the
    /// buffered event for fan-out.
    pub fn add_stdout(&mut self, data: &[u8]) -> (u64, SessionEvent) {
        let event = SessionEvent::Stdout { data: String::from_utf8_lossy(data).into_owned() };
        let seq = self.ring.push(event.clone());
        (seq, event)
    }

    /// Record a hook event if it maps to a session event.
    ///
    /// The transformation is a closed set; unrecognized hook kinds are
    /// ignored and get no sequence number.
    pub fn add_hook(&mut self, hook: &HookPayload) -> Option<(u64, SessionEvent)> {
        let event = self.map_hook(hook)?;
        let seq = self.ring.push(event.clone());

        // Active-tool bookkeeping is keyed off the event we just buffered,
        // so the recorded seq is the one the `pre` event actually got.
        match &event {
            SessionEvent::Tool { phase: ToolPhase::Pre, tool_name, .. } => {
                if let Some(ref prev) = self.active_tool {
                    warn!(
                        session_id = %self.session_id,
                        prev_tool = %prev.tool_name,
                        next_tool = %tool_name,
                        "pre hook without matching post; replacing active tool"
                    );
                }
                self.active_tool =
                    Some(ActiveTool { tool_name: tool_name.clone(), seq, started_at: Utc::now() });
            }
            SessionEvent::Tool { phase: ToolPhase::Post, tool_name, .. } => {
                match self.active_tool.take() {
                    Some(active) if active.tool_name == *tool_name => {}
                    Some(active) => {
                        warn!(
                            session_id = %self.session_id,
                            active_tool = %active.tool_name,
                            post_tool = %tool_name,
                            "post hook does not match active tool"
                        );
                    }
                    None => {
                        warn!(
                            session_id = %self.session_id,
                            post_tool = %tool_name,
                            "post hook with no active tool"
                        );
                    }
                }
            }
            _ => {}
        }

        Some((seq, event))
    }

    /// Map a hook payload to its session event, or `None` for ignored kinds.
    fn map_hook(&self, hook: &HookPayload) -> Option<SessionEvent> {
        match hook.hook_type.as_deref() {
            Some("PreToolUse") => Some(SessionEvent::Tool {
                phase: ToolPhase::Pre,
                tool_name: hook.tool_name.clone().unwrap_or_default(),
                tool_input: hook.tool_input.clone(),
                tool_result: None,
                ok: None,
            }),
            Some("PostToolUse") if hook.tool_name.is_some() => Some(SessionEvent::Tool {
                phase: ToolPhase::Post,
                tool_name: hook.tool_name.clone().unwrap_or_default(),
                tool_input: hook.tool_input.clone(),
                tool_result: hook.tool_result.clone(),
                ok: Some(hook.ok.unwrap_or(true)),
            }),
            _ => match hook.event_type.as_deref() {
                Some("status_change") => Some(SessionEvent::StatusChange {
                    from: hook.from.clone().unwrap_or_default(),
                    to: hook.to.clone().unwrap_or_default(),
                }),
                _ => None,
            },
        }
    }

    /// Replay all buffered events with seq > `seq`, in order.
    pub fn events_from(&self, seq: u64) -> Vec<BufferedEvent> {
        self.ring.get_from(seq)
    }

    pub fn latest_seq(&self) -> u64 {
        self.ring.latest_seq()
    }

    pub fn active_tool(&self) -> Option<&ActiveTool> {
        self.active_tool.as_ref()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;
