//! Release lifecycle helpers shared by controller workflows.

use std::time::Duration;

use kinto_build::BuildRequest;
use kinto_core::{
    Block, BlockRef, BuildConfig, BuildState, Release, RunConfig, TeleportServiceData, epoch_secs,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Controller;
use crate::error::{ControlError, ControlResult};

/// Fresh release identifier.
pub(super) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Controller {
    /// A pending release of `block` with the given configuration.
    pub(super) fn pending_release(
        &self,
        env: &str,
        block: &str,
        parent_id: Option<String>,
        build: BuildConfig,
        run: RunConfig,
    ) -> Release {
        let id = new_id();
        let now = epoch_secs();
        Release {
            artifact: self.config.artifact(env, block, &id),
            id,
            env_id: env.to_string(),
            block_name: block.to_string(),
            number: 0,
            parent_id,
            promoted_from: None,
            state: BuildState::Pending,
            commit_sha: None,
            tag: None,
            build_config: build,
            run_config: run,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Block record seeded from its first release.
    pub(super) fn new_block(env: &str, name: &str, release: &Release) -> Block {
        Block {
            name: name.to_string(),
            env_id: env.to_string(),
            block_type: release.run_config.block_type,
            build_config: release.build_config.clone(),
            run_config: release.run_config.clone(),
            active_release_id: None,
            suspended: false,
            external_url: None,
            release_seq: 0,
            version: 0,
            created_at: release.created_at,
            updated_at: release.created_at,
        }
    }

    /// Hand a stored release to the build service.
    ///
    /// Only acceptance is awaited. If the service refuses, the release is
    /// moved to `aborted` so it cannot linger as pending, and the refusal
    /// is returned.
    pub(super) async fn start_build(&self, release: &Release, step: &str) -> ControlResult<()> {
        let request = BuildRequest {
            env_id: release.env_id.clone(),
            block_name: release.block_name.clone(),
            release_id: release.id.clone(),
            build_config: release.build_config.clone(),
            artifact: release.artifact.clone(),
        };
        let Err(err) = self.build.trigger_build(&request).await else {
            info!(
                env = %release.env_id,
                block = %release.block_name,
                release = %release.id,
                "build triggered"
            );
            return Ok(());
        };

        error!(
            env = %release.env_id,
            block = %release.block_name,
            release = %release.id,
            error = %err,
            "build trigger failed"
        );
        let mut aborted = release.clone();
        aborted.state = release.state.transition(BuildState::Aborted)?;
        if let Err(e) = self.store.update_release(&aborted, release.version).await {
            warn!(release = %release.id, error = %e, "could not abort untriggered release");
        }
        Err(ControlError::from(err).at(&format!("{step}: trigger build")))
    }

    /// Point the block at a succeeded release (the deploy step).
    pub(super) async fn activate(
        &self,
        env: &str,
        block: &str,
        release_id: &str,
        step: &str,
    ) -> ControlResult<BlockRef> {
        self.store
            .activate_release(env, block, release_id)
            .await
            .map_err(|e| ControlError::from(e).at(step))?;
        info!(%env, %block, release = %release_id, "release activated");
        Ok(BlockRef::new(block, release_id))
    }

    /// Deploy step after a successful build.
    ///
    /// Skipped when a newer release is already active, so a slow build
    /// never rolls the block back. Failures are logged only: the status
    /// write has been committed and the reporter must see it.
    pub(super) async fn auto_deploy(&self, release: &Release) {
        let (env, block) = (release.env_id.as_str(), release.block_name.as_str());
        let active = match self.store.get_block(env, block).await {
            Ok(b) => b.active_release_id,
            Err(e) => {
                error!(%env, %block, release = %release.id, error = %e, "auto-deploy skipped");
                return;
            }
        };
        if let Some(active_id) = active.filter(|id| *id != release.id) {
            match self.store.get_release(env, block, &active_id).await {
                Ok(current) if current.number > release.number => {
                    info!(
                        %env,
                        %block,
                        release = %release.id,
                        active = %active_id,
                        "newer release already active, not deploying"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(%env, %block, active = %active_id, error = %e, "active release unreadable"),
            }
        }
        if let Err(e) = self
            .activate(env, block, &release.id, "update_build_status: deploy")
            .await
        {
            error!(%env, %block, release = %release.id, error = %e, "auto-deploy failed");
        }
    }

    /// Remove a teleport session once its owner cancels or its TTL elapses.
    pub(super) fn expire_teleport(&self, session: &TeleportServiceData, cancel: CancellationToken) {
        let store = self.store.clone();
        let ttl = Duration::from_secs(session.expires_at.saturating_sub(session.started_at));
        let env = session.env_id.clone();
        let block = session.block_name.clone();
        let session_id = session.session_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(%env, %block, "teleport owner went away"),
                _ = tokio::time::sleep(ttl) => debug!(%env, %block, "teleport session expired"),
            }
            match store.delete_teleport(&env, &block, Some(&session_id)).await {
                Ok(true) => info!(%env, %block, session = %session_id, "teleport session closed"),
                Ok(false) => {}
                Err(e) => error!(%env, %block, error = %e, "failed to close teleport session"),
            }
        });
    }
}
