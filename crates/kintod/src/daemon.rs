//! Daemon assembly: store, build service, controller chain, HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use kinto_api::{ApiState, build_router};
use kinto_build::LocalBuildClient;
use kinto_controller::{
    AuditMiddleware, Controller, ControllerApi, EnvironmentGuard, MetricsMiddleware, build_chain,
};
use kinto_state::StateStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, LogConfig};

/// Every long-lived component of a running daemon.
pub struct Daemon {
    pub store: StateStore,
    pub build: Arc<LocalBuildClient>,
    pub audit: Arc<AuditMiddleware>,
    pub metrics: Arc<MetricsMiddleware>,
    /// Entry point of the chain: audit, metrics, guard, controller.
    pub entry: Arc<dyn ControllerApi>,
    /// Cancelled on shutdown; parent of every watch and teleport token.
    pub shutdown: CancellationToken,
}

impl Daemon {
    pub fn assemble(store: StateStore, config: &DaemonConfig) -> anyhow::Result<Self> {
        let mut build = LocalBuildClient::new().with_retention(config.build.retention());
        if let Some(root) = &config.build.manifest_root {
            build = build.with_manifest_root(root.clone());
            info!(root = ?root, "serving kinto.toml manifests from disk");
        }
        let build = Arc::new(build);

        let controller = Controller::new(
            Arc::new(store.clone()),
            build.clone(),
            config.controller.clone(),
        );
        let audit = Arc::new(AuditMiddleware::new());
        let metrics = Arc::new(MetricsMiddleware::new());
        let guard = EnvironmentGuard::new(config.guard.protected_environments.iter().cloned());
        if !config.guard.protected_environments.is_empty() {
            info!(
                environments = ?config.guard.protected_environments,
                "environment guard enabled"
            );
        }

        let entry = build_chain(vec![
            audit.clone() as Arc<dyn ControllerApi>,
            metrics.clone() as Arc<dyn ControllerApi>,
            Arc::new(guard) as Arc<dyn ControllerApi>,
            Arc::new(controller) as Arc<dyn ControllerApi>,
        ])
        .context("assembling controller chain")?;

        Ok(Self {
            store,
            build,
            audit,
            metrics,
            entry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn router(&self) -> Router {
        build_router(
            ApiState::new(self.entry.clone())
                .with_metrics(self.metrics.clone())
                .with_shutdown(self.shutdown.clone()),
        )
    }

    /// Drain the build queue until shutdown.
    ///
    /// Builders report progress through the status endpoints; the daemon
    /// only records that each request is waiting for one. Returns `None`
    /// if the queue was already taken.
    pub async fn spawn_build_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut queue = self.build.take_queue().await?;
        let build = self.build.clone();
        let shutdown = self.shutdown.clone();

        Some(tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = queue.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                info!(
                    env = %request.env_id,
                    block = %request.block_name,
                    release = %request.release_id,
                    "build waiting for a builder"
                );
                let line = format!("queued, producing {}", request.artifact);
                if let Err(e) = build
                    .publish_log(
                        &request.env_id,
                        &request.block_name,
                        &request.release_id,
                        "queue",
                        &line,
                    )
                    .await
                {
                    warn!(release = %request.release_id, error = %e, "could not record queued build");
                }
            }
            debug!("build dispatcher stopped");
        }))
    }
}

/// Install the global tracing subscriber.
pub fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let directives = log.directives();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Kinto daemon starting");

    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("creating data directory {}", config.storage.data_dir.display())
    })?;
    let db_path = config.storage.db_path();
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let daemon = Daemon::assemble(store, &config)?;
    let dispatcher = daemon.spawn_build_dispatcher().await;
    info!("controller chain assembled");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server starting");

    let shutdown = daemon.shutdown.clone();
    axum::serve(listener, daemon.router())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            // Ends open watches so their connections can drain.
            shutdown.cancel();
        })
        .await?;

    if let Some(handle) = dispatcher {
        let _ = handle.await;
    }
    info!("Kinto daemon stopped");
    Ok(())
}
