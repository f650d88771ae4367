//! The build client contract consumed by the controller.

use async_trait::async_trait;
use kinto_core::{BuildConfig, Logs, Subscription};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};

/// Everything the build service needs to produce a release's image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub env_id: String,
    pub block_name: String,
    pub release_id: String,
    pub build_config: BuildConfig,
    /// Image reference to push.
    pub artifact: String,
}

#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Start a build. Returns once the service has accepted it; the
    /// outcome is reported later through the controller.
    async fn trigger_build(&self, request: &BuildRequest) -> BuildResult<()>;

    /// Ask the service to stop a running build workflow.
    async fn abort_build(&self, env_id: &str, block: &str, release_id: &str) -> BuildResult<()>;

    /// Build output of a release. The stream ends when the build finishes.
    async fn watch_build_logs(
        &self,
        env_id: &str,
        block: &str,
        release_id: &str,
    ) -> BuildResult<Subscription<Logs, BuildError>>;

    /// Raw `kinto.toml` of a repository branch.
    async fn fetch_manifest(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        token: Option<&str>,
    ) -> BuildResult<String>;
}
