//! The terminal link of the chain: every workflow, against the store and
//! the build service.
//!
//! The controller keeps no entity state between calls. Each workflow
//! reads what it needs from the store, checks its preconditions, and
//! writes through operations the store performs atomically (insert with
//! duplicate check, versioned update, guarded activation). A write that
//! loses a race surfaces as `Conflict` and is not retried.

mod lifecycle;

use std::sync::Arc;

use async_trait::async_trait;
use kinto_build::{BuildClient, BuildError};
use kinto_core::{
    Block, BlockRef, BlockStatuses, BlockType, BlocksMetrics, BuildConfig, BuildState, ConsoleLog,
    CustomDomain, Environment, KintoConfiguration, KintoFile, Logs, Protocol, Release,
    ReleaseConfig, ReleaseRef, ReleasesStatus, RunConfig, TeleportServiceData, epoch_secs,
};
use kinto_state::{Store, StoreErrorKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ControllerApi;
use crate::config::ControllerConfig;
use crate::error::{AtStep, ControlError, ControlResult};
use crate::validate;
use crate::watch::{JobStatusCallback, relay};

pub struct Controller {
    store: Arc<dyn Store>,
    build: Arc<dyn BuildClient>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, build: Arc<dyn BuildClient>, config: ControllerConfig) -> Self {
        Self {
            store,
            build,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}

#[async_trait]
impl ControllerApi for Controller {
    // ── Environments ──────────────────────────────────────────────

    async fn get_environment(&self, id: &str) -> ControlResult<Environment> {
        self.store
            .get_environment(id)
            .await
            .at("get_environment")
    }

    async fn get_environments(&self) -> ControlResult<Vec<Environment>> {
        self.store
            .list_environments()
            .await
            .at("get_environments")
    }

    async fn create_environment(&self, name: &str) -> ControlResult<Environment> {
        let name = validate::environment_name(name)?;
        let now = epoch_secs();
        let env = Environment {
            id: format!("env-{}", &lifecycle::new_id()[..12]),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_environment(&env)
            .await
            .at("create_environment")?;
        info!(env = %env.id, name = %env.name, "environment created");
        Ok(env)
    }

    async fn update_environment(&self, id: &str, name: &str) -> ControlResult<Environment> {
        let name = validate::environment_name(name)?;
        let mut env = self
            .store
            .get_environment(id)
            .await
            .at("update_environment")?;
        env.name = name.to_string();
        env.updated_at = epoch_secs();
        self.store
            .update_environment(&env)
            .await
            .at("update_environment")?;
        Ok(env)
    }

    async fn delete_environment(&self, id: &str) -> ControlResult<()> {
        self.store
            .delete_environment(id)
            .await
            .at("delete_environment")?;
        info!(env = %id, "environment deleted");
        Ok(())
    }

    // ── Blocks ────────────────────────────────────────────────────

    async fn get_block(&self, name: &str, env: &str) -> ControlResult<Block> {
        self.store.get_block(env, name).await.at("get_block")
    }

    async fn get_blocks(&self, env: &str) -> ControlResult<Vec<Block>> {
        self.store
            .get_environment(env)
            .await
            .at("get_blocks")?;
        self.store.list_blocks(env).await.at("get_blocks")
    }

    async fn create_block(
        &self,
        env: &str,
        name: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        validate::block_name(name)?;
        validate::build_config(&build)?;
        validate::run_config(&run)?;

        let release = self.pending_release(env, name, None, build, run);
        let block = Self::new_block(env, name, &release);
        let release = self
            .store
            .create_block(&block, &release)
            .await
            .at("create_block")?;
        info!(%env, block = %name, release = %release.id, "block created");

        self.start_build(&release, "create_block").await?;
        Ok(BlockRef::new(name, release.id))
    }

    async fn deploy_block_update(
        &self,
        name: &str,
        env: &str,
        base_release_id: &str,
        build: BuildConfig,
        run: RunConfig,
    ) -> ControlResult<BlockRef> {
        validate::build_config(&build)?;
        validate::run_config(&run)?;

        let block = self
            .store
            .get_block(env, name)
            .await
            .at("deploy_block_update")?;
        if run.block_type != block.block_type {
            return Err(ControlError::InvalidArgument(format!(
                "block {name} is a {:?}; its type cannot change",
                block.block_type
            )));
        }
        let base = self
            .store
            .get_release(env, name, base_release_id)
            .await
            .at("deploy_block_update: base release")?;

        let release = self.pending_release(env, name, Some(base.id), build, run);
        let release = self
            .store
            .insert_release(&release)
            .await
            .at("deploy_block_update")?;
        info!(
            %env,
            block = %name,
            release = %release.id,
            parent = %base_release_id,
            "block update released"
        );

        self.start_build(&release, "deploy_block_update").await?;
        Ok(BlockRef::new(name, release.id))
    }

    async fn trigger_deploy(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let releases = self
            .store
            .list_releases(env, name)
            .await
            .at("trigger_deploy")?;
        let Some(latest) = releases.first() else {
            return Err(ControlError::NotFound(format!(
                "trigger_deploy: block {name} has no release"
            )));
        };
        self.activate(env, name, &latest.id, "trigger_deploy").await
    }

    async fn rollback_block(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<BlockRef> {
        let release = self
            .store
            .get_release(env, name, release_id)
            .await
            .at("rollback_block")?;
        if release.state != BuildState::Succeeded {
            warn!(%env, block = %name, release = %release_id, state = %release.state, "rollback rejected");
            return Err(ControlError::Conflict(format!(
                "rollback_block: release {release_id} is {} and cannot be deployed",
                release.state
            )));
        }
        self.activate(env, name, release_id, "rollback_block").await
    }

    async fn delete_block(&self, name: &str, env: &str) -> ControlResult<()> {
        self.store
            .delete_block(env, name)
            .await
            .at("delete_block")?;
        info!(%env, block = %name, "block deleted");
        Ok(())
    }

    async fn suspend_block(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let block = self
            .store
            .get_block(env, name)
            .await
            .at("suspend_block")?;
        let Some(active) = block.active_release_id else {
            return Err(ControlError::Conflict(format!(
                "suspend_block: block {name} has no deployed release"
            )));
        };
        let block = self
            .store
            .suspend_block(env, name)
            .await
            .at("suspend_block")?;
        info!(%env, block = %name, "block suspended");
        Ok(BlockRef::new(name, block.active_release_id.unwrap_or(active)))
    }

    async fn kill_block_instance(&self, instance_id: &str, env: &str) -> ControlResult<()> {
        self.store
            .kill_block_instance(env, instance_id)
            .await
            .at("kill_block_instance")?;
        info!(%env, instance = %instance_id, "instance killed");
        Ok(())
    }

    async fn get_blocks_health_status(&self, env: &str) -> ControlResult<BlockStatuses> {
        self.store
            .get_blocks_health_status(env)
            .await
            .at("get_blocks_health_status")
    }

    async fn get_blocks_metrics(&self, name: &str, env: &str) -> ControlResult<BlocksMetrics> {
        let block = (!name.is_empty()).then_some(name);
        self.store
            .get_blocks_metrics(env, block)
            .await
            .at("get_blocks_metrics")
    }

    // ── Builds and releases ───────────────────────────────────────

    async fn update_build_status(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        state: BuildState,
    ) -> ControlResult<Release> {
        let current = self
            .store
            .get_release(env, block, release_id)
            .await
            .at("update_build_status")?;

        let mut next = current.clone();
        next.state = current.state.transition(state).map_err(|e| {
            warn!(%env, %block, release = %release_id, from = %e.from, to = %e.to, "build status rejected");
            ControlError::from(e).at("update_build_status")
        })?;
        let updated = self
            .store
            .update_release(&next, current.version)
            .await
            .at("update_build_status")?;
        info!(%env, %block, release = %release_id, state = %updated.state, "build status updated");

        if updated.state == BuildState::Succeeded && self.config.auto_deploy {
            self.auto_deploy(&updated).await;
        }
        Ok(updated)
    }

    async fn update_build_commit_sha(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        sha: &str,
    ) -> ControlResult<()> {
        if sha.trim().is_empty() {
            return Err(ControlError::InvalidArgument(
                "commit sha must not be empty".to_string(),
            ));
        }
        let current = self
            .store
            .get_release(env, block, release_id)
            .await
            .at("update_build_commit_sha")?;
        let mut next = current.clone();
        next.commit_sha = Some(sha.to_string());
        self.store
            .update_release(&next, current.version)
            .await
            .at("update_build_commit_sha")?;
        Ok(())
    }

    async fn abort_release(
        &self,
        cancel: &CancellationToken,
        block: &str,
        release_id: &str,
        env: &str,
    ) -> ControlResult<()> {
        if cancel.is_cancelled() {
            return Err(ControlError::Aborted(
                "abort_release: request cancelled".to_string(),
            ));
        }
        let current = self
            .store
            .get_release(env, block, release_id)
            .await
            .at("abort_release")?;

        let mut next = current.clone();
        next.state = current
            .state
            .transition(BuildState::Aborted)
            .at("abort_release")?;
        self.store
            .update_release(&next, current.version)
            .await
            .at("abort_release")?;
        info!(%env, %block, release = %release_id, "release aborted");

        // The stored state is authoritative; a build that already ended or
        // that the build service no longer knows has nothing left to stop.
        match self.build.abort_build(env, block, release_id).await {
            Ok(()) => Ok(()),
            Err(e @ (BuildError::Rejected(_) | BuildError::NotFound(_))) => {
                warn!(%env, %block, release = %release_id, error = %e, "build was not running");
                Ok(())
            }
            Err(e) => Err(ControlError::from(e).at("abort_release: stop build")),
        }
    }

    async fn tag_release(
        &self,
        tag: &str,
        block: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        validate::tag(tag)?;
        let current = self
            .store
            .get_release(env, block, release_id)
            .await
            .at("tag_release")?;
        let mut next = current.clone();
        next.tag = Some(tag.to_string());
        self.store
            .update_release(&next, current.version)
            .await
            .at("tag_release")?;
        info!(%env, %block, release = %release_id, %tag, "release tagged");
        Ok(())
    }

    async fn promote_release(
        &self,
        tag: &str,
        release_id: &str,
        block: &str,
        env: &str,
        target_env: &str,
    ) -> ControlResult<BlockRef> {
        validate::tag(tag)?;
        if env == target_env {
            return Err(ControlError::InvalidArgument(
                "promote_release: target environment must differ from the source".to_string(),
            ));
        }
        let source = self
            .store
            .get_release(env, block, release_id)
            .await
            .at("promote_release: source release")?;
        if source.state != BuildState::Succeeded {
            return Err(ControlError::Conflict(format!(
                "promote_release: release {release_id} is {} and cannot be promoted",
                source.state
            )));
        }
        self.store
            .get_environment(target_env)
            .await
            .at("promote_release: target environment")?;

        let now = epoch_secs();
        let promoted = Release {
            id: lifecycle::new_id(),
            env_id: target_env.to_string(),
            block_name: block.to_string(),
            number: 0,
            parent_id: None,
            promoted_from: Some(ReleaseRef {
                env_id: env.to_string(),
                release_id: source.id.clone(),
            }),
            state: BuildState::Succeeded,
            commit_sha: source.commit_sha.clone(),
            tag: Some(tag.to_string()),
            build_config: source.build_config.clone(),
            run_config: source.run_config.clone(),
            artifact: source.artifact.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let stored = match self.store.get_block(target_env, block).await {
            Ok(_) => self.store.insert_release(&promoted).await,
            Err(e) if e.kind() == StoreErrorKind::NotFound => {
                let target = Self::new_block(target_env, block, &promoted);
                self.store.create_block(&target, &promoted).await
            }
            Err(e) => Err(e),
        }
        .at("promote_release")?;
        info!(
            from = %env,
            to = %target_env,
            %block,
            release = %stored.id,
            source = %release_id,
            "release promoted"
        );

        self.activate(target_env, block, &stored.id, "promote_release: deploy")
            .await
    }

    async fn gen_release_config_from_kinto_file(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        env: &str,
        token: Option<&str>,
        block_type: BlockType,
    ) -> ControlResult<ReleaseConfig> {
        let content = self
            .build
            .fetch_manifest(org, repo, branch, token)
            .await
            .at("gen_release_config: fetch kinto.toml")?;
        let manifest = KintoFile::parse(&content).at("gen_release_config")?;
        let repository = format!("https://github.com/{org}/{repo}");
        manifest
            .to_release_config(&repository, branch, env, block_type)
            .at("gen_release_config")
    }

    async fn get_kinto_configuration(&self) -> ControlResult<KintoConfiguration> {
        Ok(KintoConfiguration {
            external_domain: self.config.external_domain.clone(),
            external_urls_enabled: self.config.enable_external_urls,
            teleport_port: self.config.teleport_port,
            teleport_ttl_secs: self.config.teleport_ttl_secs,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    // ── Routing ───────────────────────────────────────────────────

    async fn enable_external_url(
        &self,
        name: &str,
        env: &str,
        release_id: &str,
    ) -> ControlResult<()> {
        if !self.config.enable_external_urls {
            return Err(ControlError::Unavailable(
                "enable_external_url: external URLs are disabled".to_string(),
            ));
        }
        let block = self
            .store
            .get_block(env, name)
            .await
            .at("enable_external_url")?;
        if block.block_type == BlockType::Job {
            return Err(ControlError::InvalidArgument(format!(
                "enable_external_url: job {name} cannot be exposed"
            )));
        }
        if block.active_release_id.as_deref() != Some(release_id) {
            return Err(ControlError::Conflict(format!(
                "enable_external_url: release {release_id} is not the active release of {name}"
            )));
        }
        let url = self.config.external_url(env, name);
        self.store
            .set_external_url(env, name, Some(url.clone()))
            .await
            .at("enable_external_url")?;
        info!(%env, block = %name, %url, "external url enabled");
        Ok(())
    }

    async fn disable_external_url(&self, name: &str, env: &str) -> ControlResult<()> {
        self.store
            .set_external_url(env, name, None)
            .await
            .at("disable_external_url")?;
        info!(%env, block = %name, "external url disabled");
        Ok(())
    }

    async fn create_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        validate::domain(domain)?;
        let record = self
            .store
            .get_block(env, block)
            .await
            .at("create_custom_domain_name")?;
        if record.block_type == BlockType::Job {
            return Err(ControlError::InvalidArgument(format!(
                "create_custom_domain_name: job {block} cannot be routed"
            )));
        }
        self.store
            .create_custom_domain(&CustomDomain {
                domain: domain.to_string(),
                env_id: env.to_string(),
                block_name: block.to_string(),
                protocol,
                certificate_ready: false,
                created_at: epoch_secs(),
            })
            .await
            .at("create_custom_domain_name")?;
        info!(%env, %block, %domain, "custom domain added");
        Ok(())
    }

    async fn delete_custom_domain_name(
        &self,
        block: &str,
        env: &str,
        domain: &str,
        protocol: Protocol,
    ) -> ControlResult<()> {
        let owned = self
            .store
            .list_custom_domains(env, block)
            .await
            .at("delete_custom_domain_name")?;
        if !owned
            .iter()
            .any(|d| d.domain == domain && d.protocol == protocol)
        {
            return Err(ControlError::NotFound(format!(
                "delete_custom_domain_name: {domain} ({protocol:?}) on block {block}"
            )));
        }
        self.store
            .delete_custom_domain(env, block, domain)
            .await
            .at("delete_custom_domain_name")?;
        info!(%env, %block, %domain, "custom domain removed");
        Ok(())
    }

    async fn check_certificate_readiness(&self, block: &str, env: &str) -> bool {
        match self.store.list_custom_domains(env, block).await {
            Ok(domains) => !domains.is_empty() && domains.iter().all(|d| d.certificate_ready),
            Err(e) => {
                warn!(%env, %block, error = %e, "certificate readiness unknown");
                false
            }
        }
    }

    // ── Teleport ──────────────────────────────────────────────────

    async fn start_teleport(
        &self,
        cancel: &CancellationToken,
        env: &str,
        block: &str,
    ) -> ControlResult<TeleportServiceData> {
        if cancel.is_cancelled() {
            return Err(ControlError::Aborted(
                "start_teleport: request cancelled".to_string(),
            ));
        }
        let record = self
            .store
            .get_block(env, block)
            .await
            .at("start_teleport")?;
        if record.active_release_id.is_none() || record.suspended {
            return Err(ControlError::Conflict(format!(
                "start_teleport: block {block} has nothing running"
            )));
        }

        let now = epoch_secs();
        let session = TeleportServiceData {
            session_id: lifecycle::new_id(),
            env_id: env.to_string(),
            block_name: block.to_string(),
            host: format!("teleport-{block}-{env}.{}", self.config.external_domain),
            port: self.config.teleport_port,
            started_at: now,
            expires_at: now + self.config.teleport_ttl_secs,
        };
        let (held, fresh) = self
            .store
            .claim_teleport(&session, now)
            .await
            .at("start_teleport")?;
        if fresh {
            self.expire_teleport(&held, cancel.clone());
            info!(%env, %block, session = %held.session_id, "teleport session started");
        }
        Ok(held)
    }

    async fn stop_teleport(&self, env: &str, block: &str) -> ControlResult<()> {
        let removed = self
            .store
            .delete_teleport(env, block, None)
            .await
            .at("stop_teleport")?;
        if !removed {
            return Err(ControlError::NotFound(format!(
                "stop_teleport: no session for block {block} in {env}"
            )));
        }
        info!(%env, %block, "teleport session stopped");
        Ok(())
    }

    // ── Watches ───────────────────────────────────────────────────

    async fn watch_releases_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        mut tx: mpsc::Sender<ReleasesStatus>,
    ) -> ControlResult<()> {
        let source = self
            .store
            .watch_releases_status(env, block)
            .await
            .at("watch_releases_status")?;
        relay("watch_releases_status", source, cancel, &mut tx).await
    }

    async fn watch_jobs_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        mut callback: JobStatusCallback,
    ) -> ControlResult<()> {
        let source = self
            .store
            .watch_jobs_status(env, block)
            .await
            .at("watch_jobs_status")?;
        relay("watch_jobs_status", source, cancel, &mut callback).await
    }

    async fn watch_build_logs(
        &self,
        release_id: &str,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        mut tx: mpsc::Sender<Logs>,
    ) -> ControlResult<()> {
        self.store
            .get_release(env, block, release_id)
            .await
            .at("watch_build_logs")?;
        let source = self
            .build
            .watch_build_logs(env, block, release_id)
            .await
            .at("watch_build_logs")?;
        relay("watch_build_logs", source, cancel, &mut tx).await
    }

    async fn watch_console_logs(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        mut tx: mpsc::Sender<ConsoleLog>,
    ) -> ControlResult<()> {
        let source = self
            .store
            .watch_console_logs(env, block)
            .await
            .at("watch_console_logs")?;
        relay("watch_console_logs", source, cancel, &mut tx).await
    }
}
