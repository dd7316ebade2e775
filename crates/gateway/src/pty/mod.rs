// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod bridge;
pub mod spawn;

pub use bridge::{CreateSession, PtyBridge, RecoveredOrphan, SessionInfo};

/// Exit status of a PTY child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}
