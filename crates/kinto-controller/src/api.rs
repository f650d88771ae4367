//! The controller contract shared by the [`Controller`](crate::Controller)
//! and every decorator in the chain.
//!
//! Each operation has a default body that forwards the call, unchanged, to
//! the next link. A decorator exposes its [`Link`] through
//! [`ControllerApi::link`] and overrides only what it intercepts. The
//! terminal implementation returns `None` from `link` and overrides every
//! operation; forwarding past it panics.

use async_trait::async_trait;
use kinto_core::{
    Block, BlockRef, BlockStatuses, BlockType, BlocksMetrics, BuildConfig, BuildState, ConsoleLog,
    Environment, KintoConfiguration, Logs, Protocol, Release, ReleaseConfig, ReleasesStatus,
    RunConfig, TeleportServiceData,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::{Link, successor};
use crate::error::ControlResult;
use crate::watch::JobStatusCallback;

#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Successor slot of a forwarding link. `None` marks the terminal link.
    fn link(&self) -> Option<&Link> {
        None
    }

    // ── Environments ──────────────────────────────────────────────

    async fn get_environment(&self, id: &str) -> ControlResult<Environment> {
        successor(self.link()).get_environment(id).await
    }

    async fn get_environments(&self) -> ControlResult<Vec<Environment>> {
        successor(self.link()).get_environments().await
    }

    async fn create_environment(&self, name: &str) -> ControlResult<Environment> {
        successor(self.link()).create_environment(name).await
    }

    async fn update_environment(&self, id: &str, name: &str) -> ControlResult<Environment> {
        successor(self.link()).update_environment(id, name).await
    }

    async fn delete_environment(&self, id: &str) -> ControlResult<()> {
        successor(self.link()).delete_environment(id).await
    }

    // ── Blocks ────────────────────────────────────────────────────

    async fn get_block(&self, name: &str, env: &str) -> ControlResult<Block> {
        successor(self.link()).get_block(name, env).await
    }

    async fn get_blocks(&self, env: &str) -> ControlResult<Vec<Block>> {
        successor(self.link()).get_blocks(env).await
    }

    /// Create a block and its first release, and start that release's build.
    async fn create_block(
        &self,
        env: &str,
        name: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        successor(self.link())
            .create_block(env, name, build, run)
            .await
    }

    /// New release derived from `base_release_id`. The active release does
    /// not change until the new one has built and been deployed.
    async fn deploy_block_update(
        &self,
        name: &str,
        env: &str,
        base_release_id: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        successor(self.link())
            .deploy_block_update(name, env, base_release_id, build, run)
            .await
    }

    /// Activate the block's most recent release.
    async fn trigger_deploy(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        successor(self.link()).trigger_deploy(name, env).await
    }

    async fn rollback_block(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<BlockRef> {
        successor(self.link())
            .rollback_block(name, env, release_id)
            .await
    }

    async fn delete_block(&self, name: &str, env: &str) -> ControlResult<()> {
        successor(self.link()).delete_block(name, env).await
    }

    async fn suspend_block(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        successor(self.link()).suspend_block(name, env).await
    }

    async fn kill_block_instance(&self, instance_id: &str, env: &str) -> ControlResult<()> {
        successor(self.link())
            .kill_block_instance(instance_id, env)
            .await
    }

    async fn get_blocks_health_status(&self, env: &str) -> ControlResult<BlockStatuses> {
        successor(self.link()).get_blocks_health_status(env).await
    }

    /// Metrics of one block, or of every block when `name` is empty.
    async fn get_blocks_metrics(&self, name: &str, env: &str) -> ControlResult<BlocksMetrics> {
        successor(self.link()).get_blocks_metrics(name, env).await
    }

    // ── Builds and releases ───────────────────────────────────────

    /// Advance a release's build state. Backward or repeated moves fail
    /// with `Conflict`.
    async fn update_build_status(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        state: BuildState,
    ) -> ControlResult<Release> {
        successor(self.link())
            .update_build_status(release_id, block, env, state)
            .await
    }

    async fn update_build_commit_sha(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        sha: &str,
    ) -> ControlResult<()> {
        successor(self.link())
            .update_build_commit_sha(release_id, block, env, sha)
            .await
    }

    async fn abort_release(
        &self,
        cancel: &CancellationToken,
        block: &str,
        release_id: &str,
        env: &str,
    ) -> ControlResult<()> {
        successor(self.link())
            .abort_release(cancel, block, release_id, env)
            .await
    }

    async fn tag_release(
        &self,
        tag: &str,
        block: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        successor(self.link())
            .tag_release(tag, block, env, release_id)
            .await
    }

    /// Copy a succeeded release into `target_env` and activate it there.
    async fn promote_release(
        &self,
        tag: &str,
        release_id: &str,
        block: &str,
        env: &str,
        target_env: &str,
    ) -> ControlResult<BlockRef> {
        successor(self.link())
            .promote_release(tag, release_id, block, env, target_env)
            .await
    }

    /// Translate a repository's `kinto.toml` for `env`. Mutates nothing.
    async fn gen_release_config_from_kinto_file(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        env: &str,
        token: Option<&str>,
        block_type: BlockType,
    ) -> ControlResult<ReleaseConfig> {
        successor(self.link())
            .gen_release_config_from_kinto_file(org, repo, branch, env, token, block_type)
            .await
    }

    async fn get_kinto_configuration(&self) -> ControlResult<KintoConfiguration> {
        successor(self.link()).get_kinto_configuration().await
    }

    // ── Routing ───────────────────────────────────────────────────

    async fn enable_external_url(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        successor(self.link())
            .enable_external_url(name, env, release_id)
            .await
    }

    async fn disable_external_url(&self, name: &str, env: &str) -> ControlResult<()> {
        successor(self.link()).disable_external_url(name, env).await
    }

    async fn create_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        successor(self.link())
            .create_custom_domain_name(block, env, domain, protocol)
            .await
    }

    async fn delete_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        successor(self.link())
            .delete_custom_domain_name(block, env, domain, protocol)
            .await
    }

    /// Non-blocking poll; answers `false` when readiness cannot be read.
    async fn check_certificate_readiness(&self, block: &str, env: &str) -> bool {
        successor(self.link())
            .check_certificate_readiness(block, env)
            .await
    }

    // ── Teleport ──────────────────────────────────────────────────

    async fn start_teleport(
        &self,
        cancel: &CancellationToken,
        env: &str,
        block: &str,
    ) -> ControlResult<TeleportServiceData> {
        successor(self.link())
            .start_teleport(cancel, env, block)
            .await
    }

    async fn stop_teleport(&self, env: &str, block: &str) -> ControlResult<()> {
        successor(self.link()).stop_teleport(env, block).await
    }

    // ── Watches ───────────────────────────────────────────────────
    //
    // Each watch relays events until the source ends, `cancel` fires, or
    // the destination goes away. The source subscription is released on
    // every exit.

    async fn watch_releases_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        tx: mpsc::Sender<ReleasesStatus>,
    ) -> ControlResult<()> {
        successor(self.link())
            .watch_releases_status(block, env, cancel, tx)
            .await
    }

    async fn watch_jobs_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        callback: JobStatusCallback,
    ) -> ControlResult<()> {
        successor(self.link())
            .watch_jobs_status(block, env, cancel, callback)
            .await
    }

    async fn watch_build_logs(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        tx: mpsc::Sender<Logs>,
    ) -> ControlResult<()> {
        successor(self.link())
            .watch_build_logs(release_id, block, env, cancel, tx)
            .await
    }

    async fn watch_console_logs(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        tx: mpsc::Sender<ConsoleLog>,
    ) -> ControlResult<()> {
        successor(self.link())
            .watch_console_logs(block, env, cancel, tx)
            .await
    }
}
