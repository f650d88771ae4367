//! AuditMiddleware: one structured event per mutating call.
//!
//! Read-only operations and watches pass through untouched. Results,
//! errors included, are returned exactly as the inner link produced them.

use std::collections::VecDeque;

use async_trait::async_trait;
use kinto_core::{
    BlockRef, BuildConfig, BuildState, Environment, Protocol, Release, RunConfig,
    TeleportServiceData, epoch_secs,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ControllerApi;
use crate::chain::{Link, successor};
use crate::error::{ControlResult, ErrorKind};

/// Entries kept for [`AuditMiddleware::recent`].
const RECENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub operation: &'static str,
    /// `{env}/{block}` style identifier of what was touched.
    pub target: String,
    pub outcome: Result<(), ErrorKind>,
    pub at: u64,
}

#[derive(Debug, Default)]
pub struct AuditMiddleware {
    link: Link,
    recent: Mutex<VecDeque<AuditEntry>>,
}

impl AuditMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent entries, oldest first.
    pub async fn recent(&self) -> Vec<AuditEntry> {
        self.recent.lock().await.iter().cloned().collect()
    }

    async fn record<T>(
        &self,
        operation: &'static str,
        target: String,
        result: ControlResult<T>,
    ) -> ControlResult<T> {
        let outcome = match &result {
            Ok(_) => {
                info!(target: "kinto::audit", operation, subject = %target, outcome = "ok");
                Ok(())
            }
            Err(e) => {
                warn!(target: "kinto::audit", operation, subject = %target, outcome = e.kind().as_str(), error = %e);
                Err(e.kind())
            }
        };

        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(AuditEntry {
            operation,
            target,
            outcome,
            at: epoch_secs(),
        });
        result
    }
}

fn target(env: &str, block: &str) -> String {
    format!("{env}/{block}")
}

#[async_trait]
impl ControllerApi for AuditMiddleware {
    fn link(&self) -> Option<&Link> {
        Some(&self.link)
    }

    async fn create_environment(&self, name: &str) -> ControlResult<Environment> {
        let result = successor(self.link()).create_environment(name).await;
        let env_id = result
            .as_ref()
            .map(|env| env.id.clone())
            .unwrap_or_else(|_| name.to_string());
        self.record("create_environment", env_id, result).await
    }

    async fn update_environment(&self, id: &str, name: &str) -> ControlResult<Environment> {
        let result = successor(self.link()).update_environment(id, name).await;
        self.record("update_environment", id.to_string(), result).await
    }

    async fn delete_environment(&self, id: &str) -> ControlResult<()> {
        let result = successor(self.link()).delete_environment(id).await;
        self.record("delete_environment", id.to_string(), result).await
    }

    async fn create_block(
        &self,
        env: &str,
        name: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        let result = successor(self.link())
            .create_block(env, name, build, run)
            .await;
        self.record("create_block", target(env, name), result).await
    }

    async fn deploy_block_update(
        &self,
        name: &str,
        env: &str,
        base_release_id: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        let result = successor(self.link())
            .deploy_block_update(name, env, base_release_id, build, run)
            .await;
        self.record("deploy_block_update", target(env, name), result)
            .await
    }

    async fn trigger_deploy(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let result = successor(self.link()).trigger_deploy(name, env).await;
        self.record("trigger_deploy", target(env, name), result).await
    }

    async fn rollback_block(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<BlockRef> {
        let result = successor(self.link())
            .rollback_block(name, env, release_id)
            .await;
        self.record("rollback_block", target(env, name), result).await
    }

    async fn delete_block(&self, name: &str, env: &str) -> ControlResult<()> {
        let result = successor(self.link()).delete_block(name, env).await;
        self.record("delete_block", target(env, name), result).await
    }

    async fn suspend_block(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let result = successor(self.link()).suspend_block(name, env).await;
        self.record("suspend_block", target(env, name), result).await
    }

    async fn kill_block_instance(&self, instance_id: &str, env: &str) -> ControlResult<()> {
        let result = successor(self.link())
            .kill_block_instance(instance_id, env)
            .await;
        self.record("kill_block_instance", target(env, instance_id), result)
            .await
    }

    async fn update_build_status(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        state: BuildState,
    ) -> ControlResult<Release> {
        let result = successor(self.link())
            .update_build_status(release_id, block, env, state)
            .await;
        self.record(
            "update_build_status",
            format!("{env}/{block}:{release_id}"),
            result,
        )
        .await
    }

    async fn update_build_commit_sha(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        sha: &str,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .update_build_commit_sha(release_id, block, env, sha)
            .await;
        self.record(
            "update_build_commit_sha",
            format!("{env}/{block}:{release_id}"),
            result,
        )
        .await
    }

    async fn abort_release(
        &self,
        cancel: &CancellationToken,
        block: &str,
        release_id: &str,
        env: &str,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .abort_release(cancel, block, release_id, env)
            .await;
        self.record("abort_release", format!("{env}/{block}:{release_id}"), result)
            .await
    }

    async fn tag_release(
        &self,
        tag: &str,
        block: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .tag_release(tag, block, env, release_id)
            .await;
        self.record("tag_release", format!("{env}/{block}:{release_id}"), result)
            .await
    }

    async fn promote_release(
        &self,
        tag: &str,
        release_id: &str,
        block: &str,
        env: &str,
        target_env: &str,
    ) -> ControlResult<BlockRef> {
        let result = successor(self.link())
            .promote_release(tag, release_id, block, env, target_env)
            .await;
        self.record("promote_release", target(target_env, block), result)
            .await
    }

    async fn enable_external_url(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .enable_external_url(name, env, release_id)
            .await;
        self.record("enable_external_url", target(env, name), result)
            .await
    }

    async fn disable_external_url(&self, name: &str, env: &str) -> ControlResult<()> {
        let result = successor(self.link()).disable_external_url(name, env).await;
        self.record("disable_external_url", target(env, name), result)
            .await
    }

    async fn create_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .create_custom_domain_name(block, env, domain, protocol)
            .await;
        self.record("create_custom_domain_name", target(env, block), result)
            .await
    }

    async fn delete_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        let result = successor(self.link())
            .delete_custom_domain_name(block, env, domain, protocol)
            .await;
        self.record("delete_custom_domain_name", target(env, block), result)
            .await
    }

    async fn start_teleport(
        &self,
        cancel: &CancellationToken,
        env: &str,
        block: &str,
    ) -> ControlResult<TeleportServiceData> {
        let result = successor(self.link())
            .start_teleport(cancel, env, block)
            .await;
        self.record("start_teleport", target(env, block), result).await
    }

    async fn stop_teleport(&self, env: &str, block: &str) -> ControlResult<()> {
        let result = successor(self.link()).stop_teleport(env, block).await;
        self.record("stop_teleport", target(env, block), result).await
    }
}
