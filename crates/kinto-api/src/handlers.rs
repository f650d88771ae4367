//! REST API handlers.
//!
//! Each handler forwards to the controller chain and wraps the result in
//! an [`ApiResponse`](crate::response::ApiResponse).

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kinto_core::{BlockType, BuildConfig, BuildState, Protocol, RunConfig};
use serde::Deserialize;
use serde_json::json;

use crate::ApiState;
use crate::response::{created, reply};

// ── Request bodies ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EnvironmentRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBlockRequest {
    pub name: String,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub run_config: RunConfig,
}

#[derive(Debug, Deserialize)]
pub struct BlockUpdateRequest {
    pub base_release_id: String,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub run_config: RunConfig,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseSelector {
    pub release_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BuildStatusRequest {
    pub state: BuildState,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub tag: String,
    pub target_env: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseConfigRequest {
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub token: Option<String>,
    #[serde(default)]
    pub block_type: BlockType,
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Deserialize)]
pub struct ProtocolQuery {
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub block: String,
}

// ── Configuration ──────────────────────────────────────────────

/// GET /api/v1/configuration
pub async fn get_configuration(State(state): State<ApiState>) -> Response {
    reply(state.api.get_kinto_configuration().await)
}

// ── Environments ───────────────────────────────────────────────

/// GET /api/v1/environments
pub async fn list_environments(State(state): State<ApiState>) -> Response {
    reply(state.api.get_environments().await)
}

/// POST /api/v1/environments
pub async fn create_environment(
    State(state): State<ApiState>,
    Json(req): Json<EnvironmentRequest>,
) -> Response {
    created(state.api.create_environment(&req.name).await)
}

/// GET /api/v1/environments/:env
pub async fn get_environment(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> Response {
    reply(state.api.get_environment(&env).await)
}

/// PUT /api/v1/environments/:env
pub async fn update_environment(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Json(req): Json<EnvironmentRequest>,
) -> Response {
    reply(state.api.update_environment(&env, &req.name).await)
}

/// DELETE /api/v1/environments/:env
pub async fn delete_environment(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> Response {
    reply(state.api.delete_environment(&env).await.map(|()| "deleted"))
}

// ── Blocks ─────────────────────────────────────────────────────

/// GET /api/v1/environments/:env/blocks
pub async fn list_blocks(State(state): State<ApiState>, Path(env): Path<String>) -> Response {
    reply(state.api.get_blocks(&env).await)
}

/// POST /api/v1/environments/:env/blocks
pub async fn create_block(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Json(req): Json<CreateBlockRequest>,
) -> Response {
    created(
        state
            .api
            .create_block(&env, &req.name, req.build_config, req.run_config)
            .await,
    )
}

/// GET /api/v1/environments/:env/blocks/:block
pub async fn get_block(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(state.api.get_block(&block, &env).await)
}

/// DELETE /api/v1/environments/:env/blocks/:block
pub async fn delete_block(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(state.api.delete_block(&block, &env).await.map(|()| "deleted"))
}

/// POST /api/v1/environments/:env/blocks/:block/releases
pub async fn deploy_block_update(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
    Json(req): Json<BlockUpdateRequest>,
) -> Response {
    created(
        state
            .api
            .deploy_block_update(
                &block,
                &env,
                &req.base_release_id,
                req.build_config,
                req.run_config,
            )
            .await,
    )
}

/// POST /api/v1/environments/:env/blocks/:block/deploy
pub async fn trigger_deploy(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(state.api.trigger_deploy(&block, &env).await)
}

/// POST /api/v1/environments/:env/blocks/:block/rollback
pub async fn rollback_block(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
    Json(req): Json<ReleaseSelector>,
) -> Response {
    reply(state.api.rollback_block(&block, &env, &req.release_id).await)
}

/// POST /api/v1/environments/:env/blocks/:block/suspend
pub async fn suspend_block(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(state.api.suspend_block(&block, &env).await)
}

/// DELETE /api/v1/environments/:env/instances/:instance
pub async fn kill_instance(
    State(state): State<ApiState>,
    Path((env, instance)): Path<(String, String)>,
) -> Response {
    reply(
        state
            .api
            .kill_block_instance(&instance, &env)
            .await
            .map(|()| "killed"),
    )
}

/// GET /api/v1/environments/:env/health
pub async fn get_health(State(state): State<ApiState>, Path(env): Path<String>) -> Response {
    reply(state.api.get_blocks_health_status(&env).await)
}

/// GET /api/v1/environments/:env/metrics
pub async fn get_metrics(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    reply(state.api.get_blocks_metrics(&query.block, &env).await)
}

// ── Releases ───────────────────────────────────────────────────

/// PUT /api/v1/environments/:env/blocks/:block/releases/:release/status
pub async fn update_build_status(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
    Json(req): Json<BuildStatusRequest>,
) -> Response {
    reply(
        state
            .api
            .update_build_status(&release, &block, &env, req.state)
            .await,
    )
}

/// PUT /api/v1/environments/:env/blocks/:block/releases/:release/commit
pub async fn update_commit_sha(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
    Json(req): Json<CommitRequest>,
) -> Response {
    reply(
        state
            .api
            .update_build_commit_sha(&release, &block, &env, &req.sha)
            .await
            .map(|()| json!({ "release_id": release, "commit_sha": req.sha })),
    )
}

/// PUT /api/v1/environments/:env/blocks/:block/releases/:release/tag
pub async fn tag_release(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
    Json(req): Json<TagRequest>,
) -> Response {
    reply(
        state
            .api
            .tag_release(&req.tag, &block, &env, &release)
            .await
            .map(|()| json!({ "release_id": release, "tag": req.tag })),
    )
}

/// POST /api/v1/environments/:env/blocks/:block/releases/:release/abort
pub async fn abort_release(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
) -> Response {
    let cancel = state.shutdown.child_token();
    reply(
        state
            .api
            .abort_release(&cancel, &block, &release, &env)
            .await
            .map(|()| "aborted"),
    )
}

/// POST /api/v1/environments/:env/blocks/:block/releases/:release/promote
pub async fn promote_release(
    State(state): State<ApiState>,
    Path((env, block, release)): Path<(String, String, String)>,
    Json(req): Json<PromoteRequest>,
) -> Response {
    created(
        state
            .api
            .promote_release(&req.tag, &release, &block, &env, &req.target_env)
            .await,
    )
}

/// POST /api/v1/environments/:env/release-config
pub async fn gen_release_config(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    Json(req): Json<ReleaseConfigRequest>,
) -> Response {
    reply(
        state
            .api
            .gen_release_config_from_kinto_file(
                &req.org,
                &req.repo,
                &req.branch,
                &env,
                req.token.as_deref(),
                req.block_type,
            )
            .await,
    )
}

// ── Routing ────────────────────────────────────────────────────

/// PUT /api/v1/environments/:env/blocks/:block/external-url
pub async fn enable_external_url(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
    Json(req): Json<ReleaseSelector>,
) -> Response {
    let result = state
        .api
        .enable_external_url(&block, &env, &req.release_id)
        .await;
    match result {
        Ok(()) => reply(state.api.get_block(&block, &env).await),
        Err(e) => reply::<()>(Err(e)),
    }
}

/// DELETE /api/v1/environments/:env/blocks/:block/external-url
pub async fn disable_external_url(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(
        state
            .api
            .disable_external_url(&block, &env)
            .await
            .map(|()| "disabled"),
    )
}

/// POST /api/v1/environments/:env/blocks/:block/domains
pub async fn create_domain(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
    Json(req): Json<DomainRequest>,
) -> Response {
    created(
        state
            .api
            .create_custom_domain_name(&block, &env, &req.domain, req.protocol)
            .await
            .map(|()| json!({ "domain": req.domain, "protocol": req.protocol })),
    )
}

/// DELETE /api/v1/environments/:env/blocks/:block/domains/:domain
pub async fn delete_domain(
    State(state): State<ApiState>,
    Path((env, block, domain)): Path<(String, String, String)>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    reply(
        state
            .api
            .delete_custom_domain_name(&block, &env, &domain, query.protocol)
            .await
            .map(|()| "deleted"),
    )
}

/// GET /api/v1/environments/:env/blocks/:block/certificate
pub async fn certificate_readiness(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    let ready = state.api.check_certificate_readiness(&block, &env).await;
    reply(Ok(json!({ "ready": ready })))
}

// ── Teleport ───────────────────────────────────────────────────

/// POST /api/v1/environments/:env/blocks/:block/teleport
pub async fn start_teleport(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    // The session outlives the request; it ends on stop, expiry or shutdown.
    let cancel = state.shutdown.child_token();
    reply(state.api.start_teleport(&cancel, &env, &block).await)
}

/// DELETE /api/v1/environments/:env/blocks/:block/teleport
pub async fn stop_teleport(
    State(state): State<ApiState>,
    Path((env, block)): Path<(String, String)>,
) -> Response {
    reply(
        state
            .api
            .stop_teleport(&env, &block)
            .await
            .map(|()| "stopped"),
    )
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|m| m.render_prometheus())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
