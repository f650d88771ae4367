//! kinto-api: REST API for the Kinto control plane.
//!
//! Every route calls the entry point of the controller chain. Watches are
//! served as server-sent events; the stream ends with an `end` event, or an
//! `error` event carrying the terminal error.
//!
//! # API Routes
//!
//! Paths below are relative to `/api/v1`; `{env}` is an environment id.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/configuration` | Public controller settings |
//! | GET, POST | `/environments` | List / create environments |
//! | GET, PUT, DELETE | `/environments/{env}` | Get / rename / delete an environment |
//! | GET, POST | `/environments/{env}/blocks` | List / create blocks |
//! | GET | `/environments/{env}/health` | Health of every block |
//! | GET | `/environments/{env}/metrics` | Block metrics (`?block=` to filter) |
//! | POST | `/environments/{env}/release-config` | Release config from `kinto.toml` |
//! | DELETE | `/environments/{env}/instances/{id}` | Kill one instance |
//! | GET, DELETE | `/environments/{env}/blocks/{block}` | Get / delete a block |
//! | POST | `.../blocks/{block}/releases` | Deploy a block update |
//! | POST | `.../blocks/{block}/deploy` | Activate the latest release |
//! | POST | `.../blocks/{block}/rollback` | Activate an earlier release |
//! | POST | `.../blocks/{block}/suspend` | Scale the block to zero |
//! | PUT, DELETE | `.../blocks/{block}/external-url` | Enable / disable the external URL |
//! | POST | `.../blocks/{block}/domains` | Add a custom domain |
//! | DELETE | `.../blocks/{block}/domains/{domain}` | Remove a custom domain (`?protocol=`) |
//! | GET | `.../blocks/{block}/certificate` | Certificate readiness |
//! | POST, DELETE | `.../blocks/{block}/teleport` | Start / stop a teleport session |
//! | PUT | `.../releases/{release}/status` | Report a build state |
//! | PUT | `.../releases/{release}/commit` | Record the built commit |
//! | PUT | `.../releases/{release}/tag` | Tag a release |
//! | POST | `.../releases/{release}/abort` | Abort a build |
//! | POST | `.../releases/{release}/promote` | Promote into another environment |
//! | GET | `.../blocks/{block}/watch/releases` | SSE: release status snapshots |
//! | GET | `.../blocks/{block}/watch/jobs` | SSE: job status |
//! | GET | `.../blocks/{block}/watch/console` | SSE: console output |
//! | GET | `.../releases/{release}/logs` | SSE: build logs |
//! | GET | `/metrics` | Prometheus exposition (outside `/api/v1`) |

pub mod handlers;
pub mod response;
pub mod watch;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use kinto_controller::{ControllerApi, MetricsMiddleware};
use tokio_util::sync::CancellationToken;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Entry point of the controller chain.
    pub api: Arc<dyn ControllerApi>,
    /// Counters rendered on `/metrics`, when the chain includes them.
    pub metrics: Option<Arc<MetricsMiddleware>>,
    /// Parent of every token handed to the controller. Cancelled on
    /// shutdown, which ends open watches and teleport sessions.
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(api: Arc<dyn ControllerApi>) -> Self {
        Self {
            api,
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsMiddleware>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Build the complete API router (REST + watches + metrics).
pub fn build_router(state: ApiState) -> Router {
    const BLOCK: &str = "/environments/{env}/blocks/{block}";
    const RELEASE: &str = "/environments/{env}/blocks/{block}/releases/{release}";

    let api_routes = Router::new()
        .route("/configuration", get(handlers::get_configuration))
        .route(
            "/environments",
            get(handlers::list_environments).post(handlers::create_environment),
        )
        .route(
            "/environments/{env}",
            get(handlers::get_environment)
                .put(handlers::update_environment)
                .delete(handlers::delete_environment),
        )
        .route(
            "/environments/{env}/blocks",
            get(handlers::list_blocks).post(handlers::create_block),
        )
        .route("/environments/{env}/health", get(handlers::get_health))
        .route("/environments/{env}/metrics", get(handlers::get_metrics))
        .route(
            "/environments/{env}/release-config",
            post(handlers::gen_release_config),
        )
        .route(
            "/environments/{env}/instances/{instance}",
            axum::routing::delete(handlers::kill_instance),
        )
        .route(
            BLOCK,
            get(handlers::get_block).delete(handlers::delete_block),
        )
        .route(
            &format!("{BLOCK}/releases"),
            post(handlers::deploy_block_update),
        )
        .route(&format!("{BLOCK}/deploy"), post(handlers::trigger_deploy))
        .route(&format!("{BLOCK}/rollback"), post(handlers::rollback_block))
        .route(&format!("{BLOCK}/suspend"), post(handlers::suspend_block))
        .route(
            &format!("{BLOCK}/external-url"),
            put(handlers::enable_external_url).delete(handlers::disable_external_url),
        )
        .route(&format!("{BLOCK}/domains"), post(handlers::create_domain))
        .route(
            &format!("{BLOCK}/domains/{{domain}}"),
            axum::routing::delete(handlers::delete_domain),
        )
        .route(
            &format!("{BLOCK}/certificate"),
            get(handlers::certificate_readiness),
        )
        .route(
            &format!("{BLOCK}/teleport"),
            post(handlers::start_teleport).delete(handlers::stop_teleport),
        )
        .route(
            &format!("{BLOCK}/watch/releases"),
            get(watch::releases_status),
        )
        .route(&format!("{BLOCK}/watch/jobs"), get(watch::jobs_status))
        .route(&format!("{BLOCK}/watch/console"), get(watch::console_logs))
        .route(&format!("{RELEASE}/status"), put(handlers::update_build_status))
        .route(&format!("{RELEASE}/commit"), put(handlers::update_commit_sha))
        .route(&format!("{RELEASE}/tag"), put(handlers::tag_release))
        .route(&format!("{RELEASE}/abort"), post(handlers::abort_release))
        .route(&format!("{RELEASE}/promote"), post(handlers::promote_release))
        .route(&format!("{RELEASE}/logs"), get(watch::build_logs))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
