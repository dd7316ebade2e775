// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable jobs table as an append-only JSONL log of row snapshots.
//!
//! Every state change appends the full row; on open the log is replayed
//! with last-write-wins per id. Submission order is preserved by first
//! appearance, which is what FIFO admission keys off.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::info;

use super::{JobRow, JobStatus};

struct Inner {
    rows: HashMap<String, JobRow>,
    order: Vec<String>,
}

pub struct JobStore {
    path: PathBuf,
    inner: parking_lot::Mutex<Inner>,
}

impl JobStore {
    /// Open (or create) the jobs table under `base`.
    pub fn open(base: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)
            .with_context(|| format!("create jobs dir {}", base.display()))?;
        let path = base.join("jobs.jsonl");

        let mut rows: HashMap<String, JobRow> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            for line in contents.lines() {
                let Ok(row) = serde_json::from_str::<JobRow>(line) else {
                    continue;
                };
                if !rows.contains_key(&row.id) {
                    order.push(row.id.clone());
                }
                rows.insert(row.id.clone(), row);
            }
        }

        Ok(Self { path, inner: parking_lot::Mutex::new(Inner { rows, order }) })
    }

    /// Persist a row snapshot (insert or state change).
    pub fn upsert(&self, row: &JobRow) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();

        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open jobs log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        if !inner.rows.contains_key(&row.id) {
            inner.order.push(row.id.clone());
        }
        inner.rows.insert(row.id.clone(), row.clone());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<JobRow> {
        self.inner.lock().rows.get(id).cloned()
    }

    /// Ids of queued rows in submission order.
    pub fn queued_in_order(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter(|id| {
                inner.rows.get(id.as_str()).map(|r| r.status == JobStatus::Queued).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn with_status(&self, status: JobStatus) -> Vec<JobRow> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id.as_str()))
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Startup sweep: rows stuck in `running` lost their runner with the
    /// previous daemon, so they are failed in place. Queued rows are left
    /// queued. Returns the failed ids.
    pub fn fail_orphaned_running(&self) -> anyhow::Result<Vec<String>> {
        let orphaned: Vec<JobRow> = self.with_status(JobStatus::Running);
        let mut failed = Vec::new();
        for mut row in orphaned {
            info!(job_id = %row.id, "failing job orphaned by daemon restart");
            row.status = JobStatus::Failed;
            row.finished_at = Some(Utc::now());
            row.error = Some("orphaned by daemon restart".to_owned());
            self.upsert(&row)?;
            failed.push(row.id);
        }
        Ok(failed)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
