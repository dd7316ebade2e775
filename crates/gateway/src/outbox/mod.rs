// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod store;
pub mod tailer;

pub use store::{NewOutboxEvent, OutboxEvent, OutboxStore};
pub use tailer::OutboxTailer;
