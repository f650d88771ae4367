//! Controller workflows against the redb store and the in-process build
//! service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kinto_build::{BuildClient, BuildError, BuildRequest, BuildResult, LocalBuildClient};
use kinto_controller::{
    ControlError, Controller, ControllerApi, ControllerConfig, ErrorKind, JobStatusCallback,
    SinkError,
};
use kinto_core::{
    BlockType, BuildConfig, BuildState, JobState, JobStatus, Logs, Protocol, RunConfig,
    Subscription, epoch_secs,
};
use kinto_state::{StateStore, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: StateStore,
    build: Arc<LocalBuildClient>,
    controller: Controller,
    env: String,
}

async fn harness() -> Harness {
    harness_with(ControllerConfig::default()).await
}

async fn harness_with(config: ControllerConfig) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let build = Arc::new(LocalBuildClient::new());
    let controller = Controller::new(Arc::new(store.clone()), build.clone(), config);
    let env = controller.create_environment("Staging").await.unwrap().id;
    Harness {
        store,
        build,
        controller,
        env,
    }
}

fn build_config() -> BuildConfig {
    BuildConfig {
        repository: "https://github.com/acme/api".to_string(),
        branch: "main".to_string(),
        language: "rust".to_string(),
        ..BuildConfig::default()
    }
}

fn service() -> RunConfig {
    RunConfig::default()
}

fn job() -> RunConfig {
    RunConfig {
        block_type: BlockType::Job,
        ..RunConfig::default()
    }
}

impl Harness {
    async fn create(&self, name: &str) -> String {
        self.controller
            .create_block(&self.env, name, build_config(), service())
            .await
            .unwrap()
            .release_id
    }

    async fn advance(&self, name: &str, release: &str, states: &[BuildState]) {
        for state in states {
            self.controller
                .update_build_status(release, name, &self.env, *state)
                .await
                .unwrap();
        }
    }

    async fn succeed(&self, name: &str, release: &str) {
        self.advance(name, release, &[BuildState::Building, BuildState::Succeeded])
            .await;
    }

    async fn state_of(&self, name: &str, release: &str) -> BuildState {
        self.store
            .get_release(&self.env, name, release)
            .await
            .unwrap()
            .state
    }
}

// ── Environments ──────────────────────────────────────────────────

#[tokio::test]
async fn environment_lifecycle() {
    let h = harness().await;
    let prod = h.controller.create_environment("  Production ").await.unwrap();
    assert_eq!(prod.name, "Production");
    assert_ne!(prod.id, h.env);

    let renamed = h.controller.update_environment(&prod.id, "Prod").await.unwrap();
    assert_eq!(renamed.name, "Prod");
    assert_eq!(h.controller.get_environments().await.unwrap().len(), 2);

    let err = h.controller.create_environment("   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    h.controller.delete_environment(&prod.id).await.unwrap();
    let err = h.controller.get_environment(&prod.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Create and build ──────────────────────────────────────────────

#[tokio::test]
async fn create_block_starts_a_pending_build() {
    let h = harness().await;
    let mut queue = h.build.take_queue().await.unwrap();

    let r1 = h.create("api").await;
    let request = queue.recv().await.unwrap();
    assert_eq!(request.release_id, r1);
    assert_eq!(
        request.artifact,
        format!("registry.kinto.local/{}/api:{r1}", h.env)
    );

    assert_eq!(h.state_of("api", &r1).await, BuildState::Pending);
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert!(block.active_release_id.is_none());

    let err = h
        .controller
        .create_block(&h.env, "api", build_config(), service())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn create_block_validates_input() {
    let h = harness().await;
    let cases = [
        ("Bad_Name", build_config(), service()),
        ("api", BuildConfig::default(), service()),
        (
            "cron",
            build_config(),
            RunConfig {
                expose_externally: true,
                ..job()
            },
        ),
    ];
    for (name, build, run) in cases {
        let err = h
            .controller
            .create_block(&h.env, name, build, run)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{name}");
    }

    let err = h
        .controller
        .create_block("missing-env", "api", build_config(), service())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn refused_build_aborts_the_new_release() {
    let h = harness().await;
    drop(h.build.take_queue().await);

    let err = h
        .controller
        .create_block(&h.env, "api", build_config(), service())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.message().starts_with("create_block: trigger build"));

    let releases = h.store.list_releases(&h.env, "api").await.unwrap();
    assert_eq!(releases[0].state, BuildState::Aborted);
}

#[tokio::test]
async fn build_runs_forward_then_rejects_going_back() {
    let h = harness().await;
    let r1 = h.create("api").await;

    h.advance("api", &r1, &[BuildState::Building]).await;
    let succeeded = h
        .controller
        .update_build_status(&r1, "api", &h.env, BuildState::Succeeded)
        .await
        .unwrap();
    assert_eq!(succeeded.state, BuildState::Succeeded);

    let err = h
        .controller
        .update_build_status(&r1, "api", &h.env, BuildState::Building)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.state_of("api", &r1).await, BuildState::Succeeded);

    // Auto-deploy activated the release once it succeeded.
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r1.as_str()));
}

#[tokio::test]
async fn repeated_or_backward_status_is_rejected_unchanged() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.advance("api", &r1, &[BuildState::Building]).await;
    let before = h.store.get_release(&h.env, "api", &r1).await.unwrap();

    for state in [BuildState::Building, BuildState::Pending] {
        let err = h
            .controller
            .update_build_status(&r1, "api", &h.env, state)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{state}");
    }
    let after = h.store.get_release(&h.env, "api", &r1).await.unwrap();
    assert_eq!(before, after);

    // Skipping building is not allowed either.
    let r2 = h
        .controller
        .deploy_block_update("api", &h.env, &r1, build_config(), service())
        .await
        .unwrap()
        .release_id;
    let err = h
        .controller
        .update_build_status(&r2, "api", &h.env, BuildState::Succeeded)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn commit_sha_is_recorded() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.controller
        .update_build_commit_sha(&r1, "api", &h.env, "9f1c2ab")
        .await
        .unwrap();
    let release = h.store.get_release(&h.env, "api", &r1).await.unwrap();
    assert_eq!(release.commit_sha.as_deref(), Some("9f1c2ab"));
    assert_eq!(release.state, BuildState::Pending);

    let err = h
        .controller
        .update_build_commit_sha(&r1, "api", &h.env, " ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// ── Deploy, update, rollback ──────────────────────────────────────

#[tokio::test]
async fn deploying_an_unbuilt_release_changes_nothing() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let before = h.controller.get_block("api", &h.env).await.unwrap();

    let err = h.controller.trigger_deploy("api", &h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.advance("api", &r1, &[BuildState::Building]).await;
    let err = h
        .controller
        .rollback_block("api", &h.env, &r1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let after = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn block_update_activates_only_after_success() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;

    let update = h
        .controller
        .deploy_block_update(
            "api",
            &h.env,
            &r1,
            build_config(),
            RunConfig {
                port: 9090,
                ..service()
            },
        )
        .await
        .unwrap();
    let r2 = update.release_id;
    let release = h.store.get_release(&h.env, "api", &r2).await.unwrap();
    assert_eq!(release.parent_id.as_deref(), Some(r1.as_str()));
    assert_eq!(release.number, 2);

    // Still building: deploying R2 is rejected and R1 stays active.
    h.advance("api", &r2, &[BuildState::Building]).await;
    let err = h.controller.trigger_deploy("api", &h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r1.as_str()));
    assert_eq!(block.run_config.port, 8080);

    h.advance("api", &r2, &[BuildState::Succeeded]).await;
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r2.as_str()));
    assert_eq!(block.run_config.port, 9090);

    // R1 stays queryable.
    assert_eq!(h.state_of("api", &r1).await, BuildState::Succeeded);
}

#[tokio::test]
async fn late_success_of_an_older_release_does_not_roll_back() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let mut updates = Vec::new();
    for _ in 0..2 {
        let update = h
            .controller
            .deploy_block_update("api", &h.env, &r1, build_config(), service())
            .await
            .unwrap();
        updates.push(update.release_id);
    }
    let (r2, r3) = (&updates[0], &updates[1]);

    h.succeed("api", r3).await;
    h.advance("api", r2, &[BuildState::Building]).await;
    let late = h
        .controller
        .update_build_status(r2, "api", &h.env, BuildState::Succeeded)
        .await
        .unwrap();
    assert_eq!(late.state, BuildState::Succeeded);
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r3.as_str()));

    // An explicit rollback still reaches it.
    h.controller.rollback_block("api", &h.env, r2).await.unwrap();
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r2.as_str()));
}

#[tokio::test]
async fn manual_deploy_when_auto_deploy_is_off() {
    let h = harness_with(ControllerConfig {
        auto_deploy: false,
        ..ControllerConfig::default()
    })
    .await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    assert!(h
        .controller
        .get_block("api", &h.env)
        .await
        .unwrap()
        .active_release_id
        .is_none());

    let deployed = h.controller.trigger_deploy("api", &h.env).await.unwrap();
    assert_eq!(deployed.release_id, r1);
}

#[tokio::test]
async fn block_type_cannot_change_on_update() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let err = h
        .controller
        .deploy_block_update("api", &h.env, &r1, build_config(), job())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h
        .controller
        .deploy_block_update("api", &h.env, "no-such-release", build_config(), service())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn rollback_only_to_succeeded_releases() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    let r2 = h
        .controller
        .deploy_block_update("api", &h.env, &r1, build_config(), service())
        .await
        .unwrap()
        .release_id;
    h.succeed("api", &r2).await;
    let r3 = h
        .controller
        .deploy_block_update("api", &h.env, &r2, build_config(), service())
        .await
        .unwrap()
        .release_id;
    h.advance("api", &r3, &[BuildState::Building, BuildState::Failed])
        .await;

    let rolled = h.controller.rollback_block("api", &h.env, &r1).await.unwrap();
    assert_eq!(rolled.release_id, r1);
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(block.active_release_id.as_deref(), Some(r1.as_str()));

    let err = h
        .controller
        .rollback_block("api", &h.env, &r3)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = h
        .controller
        .rollback_block("api", &h.env, "missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Suspend, delete, instances ────────────────────────────────────

#[tokio::test]
async fn suspend_twice_is_idempotent() {
    let h = harness().await;
    let r1 = h.create("api").await;

    let err = h.controller.suspend_block("api", &h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.succeed("api", &r1).await;
    let first = h.controller.suspend_block("api", &h.env).await.unwrap();
    let after_first = h.controller.get_block("api", &h.env).await.unwrap();
    let second = h.controller.suspend_block("api", &h.env).await.unwrap();
    let after_second = h.controller.get_block("api", &h.env).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(after_first, after_second);
    assert!(after_first.suspended);

    // Rolling back to a release resumes the block.
    h.controller.rollback_block("api", &h.env, &r1).await.unwrap();
    assert!(!h.controller.get_block("api", &h.env).await.unwrap().suspended);
}

#[tokio::test]
async fn delete_block_removes_releases() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.controller.delete_block("api", &h.env).await.unwrap();

    assert!(h.store.get_release(&h.env, "api", &r1).await.is_err());
    let err = h.controller.get_block("api", &h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.controller.get_blocks(&h.env).await.unwrap().is_empty());

    let err = h.controller.delete_block("api", &h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn health_metrics_and_instances() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    h.store
        .put_instance(&kinto_core::InstanceRecord {
            id: "api-0".to_string(),
            env_id: h.env.clone(),
            block_name: "api".to_string(),
            release_id: r1.clone(),
            healthy: true,
            started_at: epoch_secs(),
        })
        .unwrap();
    h.store
        .put_block_metrics(&kinto_core::BlockMetrics {
            env_id: h.env.clone(),
            block_name: "api".to_string(),
            cpu_millicores: 90,
            memory_bytes: 1 << 26,
            instances: 1,
            updated_at: epoch_secs(),
        })
        .unwrap();

    let health = h.controller.get_blocks_health_status(&h.env).await.unwrap();
    assert_eq!(health.statuses["api"].running_instances, 1);

    let all = h.controller.get_blocks_metrics("", &h.env).await.unwrap();
    assert_eq!(all.metrics["api"].cpu_millicores, 90);

    h.controller
        .kill_block_instance("api-0", &h.env)
        .await
        .unwrap();
    let err = h
        .controller
        .kill_block_instance("api-0", &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Abort ─────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_stops_build_and_cannot_repeat() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let cancel = CancellationToken::new();

    h.controller
        .abort_release(&cancel, "api", &r1, &h.env)
        .await
        .unwrap();
    assert_eq!(h.state_of("api", &r1).await, BuildState::Aborted);
    assert!(h.build.is_aborted(&h.env, "api", &r1).await);

    let err = h
        .controller
        .abort_release(&cancel, "api", &r1, &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // A late success report for the aborted release is rejected.
    let err = h
        .controller
        .update_build_status(&r1, "api", &h.env, BuildState::Building)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn abort_with_cancelled_request_does_nothing() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .controller
        .abort_release(&cancel, "api", &r1, &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_eq!(h.state_of("api", &r1).await, BuildState::Pending);
}

#[tokio::test]
async fn abort_after_success_is_a_conflict() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    let err = h
        .controller
        .abort_release(&CancellationToken::new(), "api", &r1, &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.state_of("api", &r1).await, BuildState::Succeeded);
}

#[tokio::test]
async fn abort_of_a_build_that_already_ended_still_succeeds() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.advance("api", &r1, &[BuildState::Building]).await;
    h.build.finish_build(&h.env, "api", &r1).await.unwrap();

    h.controller
        .abort_release(&CancellationToken::new(), "api", &r1, &h.env)
        .await
        .unwrap();
    assert_eq!(h.state_of("api", &r1).await, BuildState::Aborted);

    // A build service that lost track of the build after a restart.
    let r2 = h.create("worker").await;
    let restarted = Controller::new(
        Arc::new(h.store.clone()),
        Arc::new(LocalBuildClient::new()),
        ControllerConfig::default(),
    );
    restarted
        .abort_release(&CancellationToken::new(), "worker", &r2, &h.env)
        .await
        .unwrap();
    assert_eq!(h.state_of("worker", &r2).await, BuildState::Aborted);
}

/// Build service that cannot be reached.
struct Offline;

#[async_trait]
impl BuildClient for Offline {
    async fn trigger_build(&self, _request: &BuildRequest) -> BuildResult<()> {
        Err(BuildError::Unavailable("connection refused".to_string()))
    }

    async fn abort_build(&self, _env_id: &str, _block: &str, _release_id: &str) -> BuildResult<()> {
        Err(BuildError::Unavailable("connection refused".to_string()))
    }

    async fn watch_build_logs(
        &self,
        _env_id: &str,
        _block: &str,
        _release_id: &str,
    ) -> BuildResult<Subscription<Logs, BuildError>> {
        Err(BuildError::Unavailable("connection refused".to_string()))
    }

    async fn fetch_manifest(
        &self,
        _org: &str,
        _repo: &str,
        _branch: &str,
        _token: Option<&str>,
    ) -> BuildResult<String> {
        Err(BuildError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn abort_reports_an_unreachable_build_service() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let offline = Controller::new(
        Arc::new(h.store.clone()),
        Arc::new(Offline),
        ControllerConfig::default(),
    );

    let err = offline
        .abort_release(&CancellationToken::new(), "api", &r1, &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.message().starts_with("abort_release: stop build"));
    assert_eq!(h.state_of("api", &r1).await, BuildState::Aborted);
}

#[tokio::test]
async fn abort_racing_a_status_update_has_one_winner() {
    for _ in 0..20 {
        let h = Arc::new(harness().await);
        let r1 = h.create("api").await;
        h.advance("api", &r1, &[BuildState::Building]).await;

        let aborter = {
            let h = h.clone();
            let r1 = r1.clone();
            tokio::spawn(async move {
                h.controller
                    .abort_release(&CancellationToken::new(), "api", &r1, &h.env)
                    .await
            })
        };
        let finisher = {
            let h = h.clone();
            let r1 = r1.clone();
            tokio::spawn(async move {
                h.controller
                    .update_build_status(&r1, "api", &h.env, BuildState::Failed)
                    .await
                    .map(|_| ())
            })
        };
        let results = [aborter.await.unwrap(), finisher.await.unwrap()];

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "{results:?}");
        for result in &results {
            if let Err(err) = result {
                assert_eq!(err.kind(), ErrorKind::Conflict);
            }
        }
        let state = h.state_of("api", &r1).await;
        assert!(matches!(state, BuildState::Aborted | BuildState::Failed));
    }
}

// ── Tag and promote ───────────────────────────────────────────────

#[tokio::test]
async fn tag_is_kept_until_changed() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.controller
        .tag_release("v1.0.0", "api", &h.env, &r1)
        .await
        .unwrap();
    h.succeed("api", &r1).await;
    let release = h.store.get_release(&h.env, "api", &r1).await.unwrap();
    assert_eq!(release.tag.as_deref(), Some("v1.0.0"));

    let err = h
        .controller
        .tag_release("bad tag", "api", &h.env, &r1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn promote_copies_a_succeeded_release() {
    let h = harness().await;
    let prod = h.controller.create_environment("Production").await.unwrap().id;
    let r1 = h.create("api").await;

    let err = h
        .controller
        .promote_release("v1", &r1, "api", &h.env, &prod)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.succeed("api", &r1).await;
    let promoted = h
        .controller
        .promote_release("v1", &r1, "api", &h.env, &prod)
        .await
        .unwrap();
    assert_ne!(promoted.release_id, r1);

    let source = h.store.get_release(&h.env, "api", &r1).await.unwrap();
    let copy = h
        .store
        .get_release(&prod, "api", &promoted.release_id)
        .await
        .unwrap();
    assert_eq!(copy.state, BuildState::Succeeded);
    assert_eq!(copy.artifact, source.artifact);
    assert_eq!(copy.tag.as_deref(), Some("v1"));
    assert!(copy.parent_id.is_none());
    let from = copy.promoted_from.unwrap();
    assert_eq!((from.env_id.as_str(), from.release_id.as_str()), (h.env.as_str(), r1.as_str()));

    let target = h.controller.get_block("api", &prod).await.unwrap();
    assert_eq!(target.active_release_id, Some(promoted.release_id.clone()));

    // The source environment is untouched and the copy is independent.
    h.controller.delete_block("api", &prod).await.unwrap();
    assert_eq!(h.state_of("api", &r1).await, BuildState::Succeeded);
}

#[tokio::test]
async fn promote_into_existing_block_adds_a_release() {
    let h = harness().await;
    let prod = h.controller.create_environment("Production").await.unwrap().id;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    h.controller
        .promote_release("v1", &r1, "api", &h.env, &prod)
        .await
        .unwrap();

    let r2 = h
        .controller
        .deploy_block_update("api", &h.env, &r1, build_config(), service())
        .await
        .unwrap()
        .release_id;
    h.succeed("api", &r2).await;
    let second = h
        .controller
        .promote_release("v2", &r2, "api", &h.env, &prod)
        .await
        .unwrap();

    let releases = h.store.list_releases(&prod, "api").await.unwrap();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases[0].id, second.release_id);
    assert_eq!(releases[0].number, 2);

    let err = h
        .controller
        .promote_release("v3", &r2, "api", &h.env, &h.env)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = h
        .controller
        .promote_release("v3", &r2, "api", &h.env, "nowhere")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Manifest ──────────────────────────────────────────────────────

#[tokio::test]
async fn release_config_from_manifest() {
    let h = harness().await;
    h.build
        .register_manifest(
            "acme",
            "api",
            "main",
            "[build]\nlanguage = \"go\"\n[run]\nport = 3000\n",
        )
        .await;
    h.build
        .register_manifest("acme", "broken", "main", "[build\n")
        .await;

    let config = h
        .controller
        .gen_release_config_from_kinto_file("acme", "api", "main", &h.env, None, BlockType::Service)
        .await
        .unwrap();
    assert_eq!(config.build_config.repository, "https://github.com/acme/api");
    assert_eq!(config.run_config.port, 3000);

    let err = h
        .controller
        .gen_release_config_from_kinto_file("acme", "broken", "main", &h.env, None, BlockType::Service)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h
        .controller
        .gen_release_config_from_kinto_file("acme", "gone", "main", &h.env, None, BlockType::Service)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Nothing was written.
    assert!(h.controller.get_blocks(&h.env).await.unwrap().is_empty());
}

#[tokio::test]
async fn kinto_configuration_reflects_settings() {
    let h = harness().await;
    let cfg = h.controller.get_kinto_configuration().await.unwrap();
    assert_eq!(cfg.external_domain, "kinto.local");
    assert!(cfg.external_urls_enabled);
    assert_eq!(cfg.teleport_ttl_secs, 3600);
}

// ── Routing ───────────────────────────────────────────────────────

#[tokio::test]
async fn external_url_follows_the_active_release() {
    let h = harness().await;
    let r1 = h.create("api").await;

    let err = h
        .controller
        .enable_external_url("api", &h.env, &r1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.succeed("api", &r1).await;
    h.controller
        .enable_external_url("api", &h.env, &r1)
        .await
        .unwrap();
    let block = h.controller.get_block("api", &h.env).await.unwrap();
    assert_eq!(
        block.external_url,
        Some(format!("https://api-{}.kinto.local", h.env))
    );

    h.controller.disable_external_url("api", &h.env).await.unwrap();
    assert!(h
        .controller
        .get_block("api", &h.env)
        .await
        .unwrap()
        .external_url
        .is_none());
}

#[tokio::test]
async fn external_urls_can_be_disabled_globally() {
    let h = harness_with(ControllerConfig {
        enable_external_urls: false,
        ..ControllerConfig::default()
    })
    .await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    let err = h
        .controller
        .enable_external_url("api", &h.env, &r1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn custom_domains_and_certificate_readiness() {
    let h = harness().await;
    h.create("api").await;

    assert!(!h.controller.check_certificate_readiness("api", &h.env).await);
    h.controller
        .create_custom_domain_name("api", &h.env, "api.acme.io", Protocol::Http)
        .await
        .unwrap();
    assert!(!h.controller.check_certificate_readiness("api", &h.env).await);

    h.store.mark_certificate_ready("api.acme.io").unwrap();
    assert!(h.controller.check_certificate_readiness("api", &h.env).await);

    let err = h
        .controller
        .create_custom_domain_name("api", &h.env, "not a domain", Protocol::Http)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h
        .controller
        .delete_custom_domain_name("api", &h.env, "api.acme.io", Protocol::Grpc)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    h.controller
        .delete_custom_domain_name("api", &h.env, "api.acme.io", Protocol::Http)
        .await
        .unwrap();
    assert!(!h.controller.check_certificate_readiness("api", &h.env).await);

    // Unknown block: readiness is simply false.
    assert!(!h.controller.check_certificate_readiness("nope", &h.env).await);
}

// ── Teleport ──────────────────────────────────────────────────────

#[tokio::test]
async fn teleport_is_idempotent_while_live() {
    let h = harness().await;
    let r1 = h.create("api").await;
    let cancel = CancellationToken::new();

    let err = h
        .controller
        .start_teleport(&cancel, &h.env, "api")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.succeed("api", &r1).await;
    let first = h
        .controller
        .start_teleport(&cancel, &h.env, "api")
        .await
        .unwrap();
    let second = h
        .controller
        .start_teleport(&CancellationToken::new(), &h.env, "api")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.port, 2222);

    h.controller.stop_teleport(&h.env, "api").await.unwrap();
    let err = h.controller.stop_teleport(&h.env, "api").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn teleport_session_ends_with_its_owner() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;

    let cancel = CancellationToken::new();
    h.controller
        .start_teleport(&cancel, &h.env, "api")
        .await
        .unwrap();
    assert!(h.store.get_teleport(&h.env, "api").await.unwrap().is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.store.get_teleport(&h.env, "api").await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session must be removed once its owner cancels");
}

#[tokio::test]
async fn cancelled_teleport_request_is_aborted() {
    let h = harness().await;
    let r1 = h.create("api").await;
    h.succeed("api", &r1).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .controller
        .start_teleport(&cancel, &h.env, "api")
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::Aborted("start_teleport: request cancelled".to_string()));
}

// ── Watches ───────────────────────────────────────────────────────

#[tokio::test]
async fn release_watch_follows_the_build() {
    let h = Arc::new(harness().await);
    let r1 = h.create("api").await;
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let watch = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            h.controller
                .watch_releases_status("api", &h.env, &cancel, tx)
                .await
        })
    };

    let initial = rx.recv().await.unwrap();
    assert_eq!(initial.releases[0].state, BuildState::Pending);

    h.succeed("api", &r1).await;
    let mut last = initial;
    while !last.releases[0].active {
        last = rx.recv().await.unwrap();
    }
    assert_eq!(last.releases[0].state, BuildState::Succeeded);

    cancel.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_watch_releases_its_subscription() {
    let h = Arc::new(harness().await);
    let r1 = h.create("api").await;
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let watch = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            h.controller
                .watch_releases_status("api", &h.env, &cancel, tx)
                .await
        })
    };
    rx.recv().await.unwrap();
    assert_eq!(h.store.watcher_count(), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), watch)
        .await
        .expect("watch must return promptly after cancel")
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.store.watcher_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("store subscription must be released");

    // Nothing arrives after cancellation.
    h.advance("api", &r1, &[BuildState::Building]).await;
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn release_watch_ends_with_not_found_when_block_is_deleted() {
    let h = Arc::new(harness().await);
    h.create("api").await;
    let (tx, mut rx) = mpsc::channel(16);

    let watch = {
        let h = h.clone();
        tokio::spawn(async move {
            h.controller
                .watch_releases_status("api", &h.env, &CancellationToken::new(), tx)
                .await
        })
    };
    rx.recv().await.unwrap();
    h.controller.delete_block("api", &h.env).await.unwrap();

    let err = watch.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.message().starts_with("watch_releases_status"));
}

#[tokio::test]
async fn build_logs_stream_until_the_build_finishes() {
    let h = Arc::new(harness().await);
    let r1 = h.create("api").await;
    h.build
        .publish_log(&h.env, "api", &r1, "clone", "cloning")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let watch = {
        let h = h.clone();
        let r1 = r1.clone();
        tokio::spawn(async move {
            h.controller
                .watch_build_logs(&r1, "api", &h.env, &CancellationToken::new(), tx)
                .await
        })
    };
    assert_eq!(rx.recv().await.unwrap().line, "cloning");

    h.build
        .publish_log(&h.env, "api", &r1, "build", "compiling")
        .await
        .unwrap();
    h.build.finish_build(&h.env, "api", &r1).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().line, "compiling");
    watch.await.unwrap().unwrap();
    assert!(rx.recv().await.is_none());

    let (tx, _rx) = mpsc::channel(1);
    let err = h
        .controller
        .watch_build_logs("missing", "api", &h.env, &CancellationToken::new(), tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn job_watch_stops_when_callback_refuses() {
    let h = Arc::new(harness().await);
    h.controller
        .create_block(&h.env, "cron", build_config(), job())
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let callback: JobStatusCallback = Box::new(move |status: JobStatus| {
        let done = status.state == JobState::Succeeded;
        let _ = seen_tx.send(status.state);
        if done {
            Err(SinkError("client went away".to_string()))
        } else {
            Ok(())
        }
    });

    let watch = {
        let h = h.clone();
        tokio::spawn(async move {
            h.controller
                .watch_jobs_status("cron", &h.env, &CancellationToken::new(), callback)
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.store.watcher_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    for state in [JobState::Running, JobState::Succeeded] {
        h.store.publish_job_status(JobStatus {
            env_id: h.env.clone(),
            block_name: "cron".to_string(),
            release_id: "r".to_string(),
            state,
            message: None,
            updated_at: epoch_secs(),
        });
    }

    let err = watch.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_eq!(seen_rx.recv().await, Some(JobState::Running));
    assert_eq!(seen_rx.recv().await, Some(JobState::Succeeded));
}

#[tokio::test]
async fn console_watch_ends_when_receiver_is_dropped() {
    let h = Arc::new(harness().await);
    h.create("api").await;
    let (tx, rx) = mpsc::channel(1);

    let watch = {
        let h = h.clone();
        tokio::spawn(async move {
            h.controller
                .watch_console_logs("api", &h.env, &CancellationToken::new(), tx)
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.store.watcher_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    drop(rx);

    h.store.publish_console_log(kinto_core::ConsoleLog {
        env_id: h.env.clone(),
        block_name: "api".to_string(),
        instance_id: "api-0".to_string(),
        line: "hello".to_string(),
        timestamp: epoch_secs(),
    });
    tokio::time::timeout(Duration::from_secs(1), watch)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn build_client_is_shared_with_the_controller() {
    let h = harness().await;
    let client: Arc<dyn BuildClient> = h.build.clone();
    let r1 = h.create("api").await;
    client.abort_build(&h.env, "api", &r1).await.unwrap();
    assert!(h.build.is_aborted(&h.env, "api", &r1).await);
}
