// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level daemon runner — shared by `main` and integration tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commander::CommanderManager;
use crate::config::Config;
use crate::job::{JobManager, JobStore};
use crate::outbox::{OutboxStore, OutboxTailer};
use crate::pty::PtyBridge;
use crate::session_store::SessionStore;
use crate::subscription::SubscriptionManager;
use crate::transport::{
    self, build_router, hooks, Deps, GatewaySettings, MergerRegistry, PtyNotice,
};
use crate::watch::StatusDirWatcher;

/// Delivered outbox rows older than this may be deleted at startup.
const OUTBOX_RETENTION: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

/// A fully-wired daemon with both listeners open.
pub struct Gateway {
    pub deps: Arc<Deps>,
    pub ws_addr: SocketAddr,
    hook_socket_path: PathBuf,
    server_task: JoinHandle<()>,
    _fleet_sub: crate::outbox::tailer::OutboxSubscription,
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / PADDOCK_LOG_LEVEL > RUST_LOG > default.
    let filter = if std::env::var("PADDOCK_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Wire every component, run recovery, and open both listeners.
///
/// Startup order matters: job recovery and PTY orphan probing run before
/// the tailer starts and before any client can connect.
pub async fn prepare(config: Config) -> anyhow::Result<Gateway> {
    init_tracing(&config);

    let base_dir = config.base_dir();
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("create base dir {}", base_dir.display()))?;

    let shutdown = CancellationToken::new();

    // Channels funneling component callbacks into the dispatch loop.
    let (pty_tx, pty_rx) = mpsc::unbounded_channel::<PtyNotice>();
    let (hook_tx, hook_rx) = mpsc::unbounded_channel();
    let (fleet_tx, fleet_rx) = mpsc::unbounded_channel();

    let output_tx = pty_tx.clone();
    let bridge = Arc::new(PtyBridge::new(
        config.sessions_dir(),
        vec![config.agent_bin.clone()],
        config.cols,
        config.rows,
        Arc::new(move |session_id: &str, data| {
            let _ = output_tx.send(PtyNotice::Output {
                session_id: session_id.to_owned(),
                data,
            });
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
    let tailer = Arc::new(OutboxTailer::new(Arc::clone(&outbox), config.outbox_poll()));
    let job_store = Arc::new(JobStore::open(&base_dir)?);
    let jobs = Arc::new(
        JobManager::new(Arc::clone(&job_store), config.agent_bin.clone(), config.job_slots)
            .with_outbox(Arc::clone(&outbox)),
    );
    let sessions = Arc::new(SessionStore::new());
    let subs = Arc::new(SubscriptionManager::new());

    let commander_cwd = match config.commander_cwd.clone() {
        Some(cwd) => cwd,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
    };
    let commander_project_dir = config
        .commander_project_dir
        .clone()
        .unwrap_or_else(|| default_commander_project_dir(&commander_cwd));
    let commander = Arc::new(CommanderManager::new(
        Arc::clone(&bridge),
        Arc::clone(&outbox),
        Arc::clone(&sessions),
        config.agent_bin.clone(),
        commander_project_dir,
        commander_cwd,
        config.commander_state_path(),
    ));

    let deps = Arc::new(Deps {
        settings: GatewaySettings {
            agent_bin: config.agent_bin.clone(),
            ring_budget: config.ring_budget,
            default_cols: config.cols,
            default_rows: config.rows,
        },
        bridge,
        mergers: Arc::new(MergerRegistry::new(config.ring_budget)),
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

    // 1. Job recovery: orphaned-on-restart sweep before any admission.
    let orphaned_jobs = deps.jobs.initialize()?;
    if orphaned_jobs > 0 {
        info!(count = orphaned_jobs, "failed jobs orphaned by previous daemon");
    }

    // 2. PTY orphan recovery.
    let orphans = deps.bridge.recover_orphans()?;
    if !orphans.is_empty() {
        info!(count = orphans.len(), "recovered orphan pty sessions");
    }

    // 3. Outbox housekeeping, then the tailer wired into the dispatch
    //    loop's fleet channel. Delivered rows older than the retention
    //    window are dropped at boot.
    match deps.outbox.sweep(OUTBOX_RETENTION) {
        Ok(0) => {}
        Ok(dropped) => info!(dropped, "swept delivered outbox rows"),
        Err(e) => error!(err = %e, "outbox sweep failed"),
    }
    let fleet_sub = deps.tailer.subscribe(Arc::new(move |event| {
        let _ = fleet_tx.send(event.clone());
    }));
    deps.tailer.start();

    // 4. Commander state + readiness subscriptions.
    deps.commander.initialize();

    // 5. Status-file watcher feeding the session store.
    {
        let watcher =
            StatusDirWatcher::new(config.status_dir(), Arc::clone(&deps.sessions));
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            watcher.run(cancel).await;
        });
    }

    // 6. Dispatch loop and commander notice forwarder.
    tokio::spawn(transport::run_dispatch(Arc::clone(&deps), pty_rx, hook_rx, fleet_rx));
    tokio::spawn(transport::run_commander_forwarder(Arc::clone(&deps)));

    // 7. Hook IPC listener. Bind failures abort startup.
    let hook_socket_path = config.hook_socket_path();
    let hook_listener = hooks::bind_hook_socket(&hook_socket_path)?;
    tokio::spawn(hooks::run_hook_listener(hook_listener, hook_tx, shutdown.clone()));

    // 8. WebSocket listener. Bind failures abort startup.
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    let ws_addr = listener.local_addr()?;
    let router = build_router(Arc::clone(&deps));
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(err = %e, "websocket server error");
        }
    });

    info!(addr = %ws_addr, hook_socket = %hook_socket_path.display(), "gateway ready");
    Ok(Gateway { deps, ws_addr, hook_socket_path, server_task, _fleet_sub: fleet_sub })
}

impl Gateway {
    /// Ordered teardown: tailer → jobs → PTYs → clients → listeners →
    /// socket file.
    pub async fn shutdown(self) {
        info!("gateway shutting down");

        self.deps.tailer.stop();
        self.deps.jobs.shutdown().await;
        self.deps.commander.shutdown().await;
        self.deps.bridge.destroy_all().await;

        // Close every client queue; writers flush and send close 1001.
        for client in self.deps.subs.all() {
            client.queue.close();
        }

        self.deps.shutdown.cancel();
        self.server_task.abort();
        let _ = self.server_task.await;

        if let Err(e) = std::fs::remove_file(&self.hook_socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(err = %e, "failed to remove hook socket");
            }
        }
        info!("gateway stopped");
    }
}

/// Run the daemon until SIGINT/SIGTERM, then tear down in order.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let gateway = prepare(config).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = gateway.deps.shutdown.cancelled() => {}
    }

    gateway.shutdown().await;
    Ok(())
}

/// Default transcript directory for the commander's workspace, matching
/// the external tool's `~/.claude/projects/<munged-path>` layout.
fn default_commander_project_dir(cwd: &std::path::Path) -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    let munged: String = cwd
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect();
    PathBuf::from(home).join(".claude").join("projects").join(munged)
}
