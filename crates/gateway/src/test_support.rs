// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a fully-wired in-process gateway backed by
//! a tempdir and a stub agent binary.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commander::CommanderManager;
use crate::job::{JobManager, JobStore};
use crate::outbox::{OutboxStore, OutboxTailer};
use crate::pty::PtyBridge;
use crate::session_store::SessionStore;
use crate::subscription::SubscriptionManager;
use crate::transport::{
    self, build_router, hooks, Deps, GatewaySettings, MergerRegistry, PtyNotice,
};

/// An in-process gateway with both listeners open, for tests.
pub struct TestGateway {
    pub deps: Arc<Deps>,
    pub ws_addr: SocketAddr,
    pub hook_socket: PathBuf,
    pub base_dir: PathBuf,
    /// Transcript dir the commander watches for its conversation id.
    pub commander_project_dir: PathBuf,
    _fleet_sub: crate::outbox::tailer::OutboxSubscription,
    _dir: tempfile::TempDir,
}

/// Builder assembling a [`TestGateway`] with sensible defaults.
pub struct GatewayBuilder {
    agent_body: String,
    ring_budget: usize,
    job_slots: usize,
    outbox_poll: Duration,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            agent_body: "exit 0".to_owned(),
            ring_budget: 1 << 20,
            job_slots: 3,
            outbox_poll: Duration::from_millis(20),
        }
    }

    /// Shell body of the stub agent binary.
    pub fn agent_body(mut self, body: impl Into<String>) -> Self {
        self.agent_body = body.into();
        self
    }

    pub fn ring_budget(mut self, budget: usize) -> Self {
        self.ring_budget = budget;
        self
    }

    pub fn job_slots(mut self, slots: usize) -> Self {
        self.job_slots = slots;
        self
    }

    /// Wire everything and open listeners on ephemeral addresses.
    pub async fn build(self) -> anyhow::Result<TestGateway> {
        let dir = tempfile::tempdir()?;
        let base_dir = dir.path().to_path_buf();

        let agent = base_dir.join("agent");
        std::fs::write(&agent, format!("#!/bin/sh\n{}\n", self.agent_body))?;
        let mut perms = std::fs::metadata(&agent)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&agent, perms)?;
        let agent_bin = agent.to_string_lossy().into_owned();

        let shutdown = CancellationToken::new();
        let (pty_tx, pty_rx) = mpsc::unbounded_channel::<PtyNotice>();
        let (hook_tx, hook_rx) = mpsc::unbounded_channel();
        let (fleet_tx, fleet_rx) = mpsc::unbounded_channel();

        let output_tx = pty_tx.clone();
        let bridge = Arc::new(PtyBridge::new(
            base_dir.join("sessions"),
            vec![agent_bin.clone()],
            80,
            24,
            Arc::new(move |session_id: &str, data| {
                let _ = output_tx
                    .send(PtyNotice::Output { session_id: session_id.to_owned(), data });
            }),
            Arc::new(move |session_id: &str, code, signal| {
                let _ = pty_tx.send(PtyNotice::Exit {
                    session_id: session_id.to_owned(),
                    code,
                    signal,
                });
            }),
        )?);

        let outbox = Arc::new(OutboxStore::open(&base_dir)?);
        let tailer = Arc::new(OutboxTailer::new(Arc::clone(&outbox), self.outbox_poll));
        let job_store = Arc::new(JobStore::open(&base_dir)?);
        let jobs = Arc::new(
            JobManager::new(Arc::clone(&job_store), agent_bin.clone(), self.job_slots)
                .with_outbox(Arc::clone(&outbox)),
        );
        let sessions = Arc::new(SessionStore::new());
        let subs = Arc::new(SubscriptionManager::new());

        let commander_project_dir = base_dir.join("transcripts");
        let commander = Arc::new(CommanderManager::new(
            Arc::clone(&bridge),
            Arc::clone(&outbox),
            Arc::clone(&sessions),
            agent_bin.clone(),
            commander_project_dir.clone(),
            std::env::temp_dir(),
            base_dir.join("commander.json"),
        ));

        let deps = Arc::new(Deps {
            settings: GatewaySettings {
                agent_bin,
                ring_budget: self.ring_budget,
                default_cols: 80,
                default_rows: 24,
            },
            bridge,
            mergers: Arc::new(MergerRegistry::new(self.ring_budget)),
            outbox,
            tailer,
            jobs,
            sessions,
            subs,
            commander,
            shutdown: shutdown.clone(),
            started_at: Instant::now(),
            hook_drops: AtomicU64::new(0),
        });

        deps.jobs.initialize()?;
        deps.bridge.recover_orphans()?;
        let fleet_sub = deps.tailer.subscribe(Arc::new(move |event| {
            let _ = fleet_tx.send(event.clone());
        }));
        deps.tailer.start();
        deps.commander.initialize();

        tokio::spawn(transport::run_dispatch(Arc::clone(&deps), pty_rx, hook_rx, fleet_rx));
        tokio::spawn(transport::run_commander_forwarder(Arc::clone(&deps)));

        let hook_socket = base_dir.join("hooks.sock");
        let hook_listener = hooks::bind_hook_socket(&hook_socket)?;
        tokio::spawn(hooks::run_hook_listener(hook_listener, hook_tx, shutdown.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let ws_addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&deps));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(TestGateway {
            deps,
            ws_addr,
            hook_socket,
            base_dir,
            commander_project_dir,
            _fleet_sub: fleet_sub,
            _dir: dir,
        })
    }
}
