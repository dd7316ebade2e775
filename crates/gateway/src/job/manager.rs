// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded job pool: at most `slots` running jobs, at most one running
//! job per project, FIFO among eligible queued jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::JobRunner;
use super::store::JobStore;
use super::{JobRow, JobSpec, JobStatus};
use crate::outbox::{NewOutboxEvent, OutboxStore};

/// Per-job notifications delivered to the submitter's listener.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    Started { id: String, project_id: Option<String> },
    Stream { id: String, chunk: Value },
    Completed { id: String, ok: bool, result: Option<super::JobResult>, error: Option<String> },
}

pub type JobListener = Arc<dyn Fn(JobUpdate) + Send + Sync>;

struct RunningJob {
    cancel: CancellationToken,
    project_id: Option<String>,
}

struct ManagerInner {
    queue: Vec<String>,
    running: HashMap<String, RunningJob>,
}

pub struct JobManager {
    store: Arc<JobStore>,
    agent_bin: String,
    slots: usize,
    inner: parking_lot::Mutex<ManagerInner>,
    listeners: parking_lot::Mutex<HashMap<String, JobListener>>,
    outbox: Option<Arc<OutboxStore>>,
}

impl JobManager {
    pub fn new(store: Arc<JobStore>, agent_bin: impl Into<String>, slots: usize) -> Self {
        Self {
            store,
            agent_bin: agent_bin.into(),
            slots,
            inner: parking_lot::Mutex::new(ManagerInner {
                queue: Vec::new(),
                running: HashMap::new(),
            }),
            listeners: parking_lot::Mutex::new(HashMap::new()),
            outbox: None,
        }
    }

    /// Emit `job_completed` outbox events when a store is wired in.
    pub fn with_outbox(mut self, outbox: Arc<OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Startup recovery: fail rows orphaned in `running` by a previous
    /// daemon, then requeue persisted `queued` rows and admit what fits.
    /// Runs before any new job is accepted.
    pub fn initialize(self: &Arc<Self>) -> anyhow::Result<usize> {
        let orphaned = self.store.fail_orphaned_running()?;
        let requeued = self.store.queued_in_order();
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued persisted jobs");
        }
        self.inner.lock().queue = requeued;
        self.pump();
        Ok(orphaned.len())
    }

    /// Submit a job. It is admitted immediately if a slot is free and its
    /// project has no running job, otherwise it waits in FIFO order.
    pub fn submit(
        self: &Arc<Self>,
        spec: JobSpec,
        listener: JobListener,
    ) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = JobRow::queued(id.clone(), spec);
        self.store.upsert(&row)?;

        self.listeners.lock().insert(id.clone(), listener);
        self.inner.lock().queue.push(id.clone());
        debug!(job_id = %id, "job queued");

        self.pump();
        Ok(id)
    }

    /// Cancel a queued or running job. Returns false for unknown or
    /// already-terminal jobs.
    pub fn cancel(&self, id: &str) -> bool {
        // Queued: transition straight to canceled without ever running.
        let was_queued = {
            let mut inner = self.inner.lock();
            match inner.queue.iter().position(|q| q == id) {
                Some(pos) => {
                    inner.queue.remove(pos);
                    true
                }
                None => false,
            }
        };

        if was_queued {
            let Some(mut row) = self.store.get(id) else {
                return false;
            };
            row.status = JobStatus::Canceled;
            row.finished_at = Some(Utc::now());
            row.error = Some("cancelled".to_owned());
            if let Err(e) = self.store.upsert(&row) {
                warn!(job_id = %id, err = %e, "failed to persist job cancellation");
            }
            self.notify(
                id,
                JobUpdate::Completed {
                    id: id.to_owned(),
                    ok: false,
                    result: None,
                    error: Some("cancelled".to_owned()),
                },
            );
            self.listeners.lock().remove(id);
            return true;
        }

        let inner = self.inner.lock();
        match inner.running.get(id) {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Cancel everything in flight and wait for runners to unwind.
    pub async fn shutdown(&self) {
        {
            let inner = self.inner.lock();
            for running in inner.running.values() {
                running.cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.running_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Admission check, run whenever a job is submitted or a slot opens.
    fn pump(self: &Arc<Self>) {
        loop {
            let admitted = {
                let mut inner = self.inner.lock();
                if inner.running.len() >= self.slots {
                    None
                } else {
                    // FIFO among eligible: skip queued jobs whose project
                    // already has a running job.
                    let busy: Vec<String> =
                        inner.running.values().filter_map(|r| r.project_id.clone()).collect();
                    let pos = inner.queue.iter().position(|id| {
                        let project = self.store.get(id).and_then(|row| row.spec.project_id);
                        match project {
                            Some(ref p) => !busy.contains(p),
                            None => true,
                        }
                    });
                    pos.map(|pos| {
                        let id = inner.queue.remove(pos);
                        let cancel = CancellationToken::new();
                        let project_id = self.store.get(&id).and_then(|row| row.spec.project_id);
                        inner.running.insert(
                            id.clone(),
                            RunningJob { cancel: cancel.clone(), project_id },
                        );
                        (id, cancel)
                    })
                }
            };

            match admitted {
                Some((id, cancel)) => {
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        manager.run_job(id, cancel).await;
                    });
                }
                None => break,
            }
        }
    }

    async fn run_job(self: Arc<Self>, id: String, cancel: CancellationToken) {
        let Some(mut row) = self.store.get(&id) else {
            warn!(job_id = %id, "admitted job has no row");
            self.inner.lock().running.remove(&id);
            return;
        };

        row.status = JobStatus::Running;
        row.started_at = Some(Utc::now());
        if let Err(e) = self.store.upsert(&row) {
            warn!(job_id = %id, err = %e, "failed to persist running transition");
        }
        self.notify(
            &id,
            JobUpdate::Started { id: id.clone(), project_id: row.spec.project_id.clone() },
        );

        let runner = JobRunner::new(&self.agent_bin, &row.spec.kind, cancel);
        let stream_id = id.clone();
        let manager = Arc::clone(&self);
        let outcome = runner
            .run(&row.spec, &move |chunk: &Value| {
                manager.notify(
                    &stream_id,
                    JobUpdate::Stream { id: stream_id.clone(), chunk: chunk.clone() },
                );
            })
            .await;

        row.status = if outcome.ok {
            JobStatus::Completed
        } else if outcome.error.as_deref() == Some("cancelled") {
            JobStatus::Canceled
        } else {
            JobStatus::Failed
        };
        row.finished_at = Some(Utc::now());
        row.result = outcome.result.clone();
        row.error = outcome.error.clone();
        if let Err(e) = self.store.upsert(&row) {
            warn!(job_id = %id, err = %e, "failed to persist job completion");
        }

        self.notify(
            &id,
            JobUpdate::Completed {
                id: id.clone(),
                ok: outcome.ok,
                result: outcome.result,
                error: outcome.error,
            },
        );
        self.listeners.lock().remove(&id);
        self.inner.lock().running.remove(&id);

        if let Some(ref outbox) = self.outbox {
            let appended = outbox.append(NewOutboxEvent {
                kind: "job_completed".to_owned(),
                project_id: row.spec.project_id.clone(),
                payload: serde_json::json!({
                    "job_id": id,
                    "kind": row.spec.kind,
                    "ok": outcome.ok,
                }),
                ..Default::default()
            });
            if let Err(e) = appended {
                warn!(job_id = %id, err = %e, "failed to append job_completed outbox event");
            }
        }

        // A slot just opened.
        self.pump();
    }

    fn notify(&self, id: &str, update: JobUpdate) {
        let listener = self.listeners.lock().get(id).cloned();
        if let Some(listener) = listener {
            listener(update);
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
