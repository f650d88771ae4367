//! LocalBuildClient: in-process build service.
//!
//! Triggered builds are queued for a worker obtained through
//! [`LocalBuildClient::take_queue`]. The worker reports output with
//! [`LocalBuildClient::publish_log`] and ends the build with
//! [`LocalBuildClient::finish_build`]. Every line is kept per build, so a
//! late watcher replays what it missed before following live output.
//! Ended builds are forgotten once they are older than the retention period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kinto_core::manifest::MANIFEST_FILE;
use kinto_core::{Logs, Subscription, epoch_secs, release_key, subscription};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::client::{BuildClient, BuildRequest};
use crate::error::{BuildError, BuildResult};

/// Broadcast capacity of the log hub.
const LOG_CAPACITY: usize = 1024;

/// Buffer between a log watcher task and its consumer.
const WATCH_BUFFER: usize = 256;

/// How long an ended build keeps its record and log history.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPhase {
    Queued,
    Finished,
    Aborted,
}

impl BuildPhase {
    fn is_done(self) -> bool {
        !matches!(self, BuildPhase::Queued)
    }
}

#[derive(Debug)]
struct BuildRecord {
    phase: BuildPhase,
    history: Vec<Logs>,
    ended_at: Option<Instant>,
}

impl BuildRecord {
    fn end(&mut self, phase: BuildPhase) {
        self.phase = phase;
        self.ended_at = Some(Instant::now());
    }

    fn expired(&self, retention: Duration) -> bool {
        self.ended_at.is_some_and(|at| at.elapsed() >= retention)
    }
}

/// One hub message: a log line, or the end of a build's output.
#[derive(Debug, Clone)]
struct LogEvent {
    key: String,
    line: Option<Logs>,
}

pub struct LocalBuildClient {
    queue: mpsc::UnboundedSender<BuildRequest>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<BuildRequest>>>,
    builds: RwLock<HashMap<String, BuildRecord>>,
    logs: broadcast::Sender<LogEvent>,
    manifests: RwLock<HashMap<String, String>>,
    manifest_root: Option<PathBuf>,
    retention: Duration,
}

impl LocalBuildClient {
    pub fn new() -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let (logs, _) = broadcast::channel(LOG_CAPACITY);
        Self {
            queue,
            pending: Mutex::new(Some(pending)),
            builds: RwLock::new(HashMap::new()),
            logs,
            manifests: RwLock::new(HashMap::new()),
            manifest_root: None,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Serve manifests from `{root}/{org}/{repo}/{branch}/kinto.toml` when
    /// the registry has no entry.
    pub fn with_manifest_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.manifest_root = Some(root.into());
        self
    }

    /// Keep ended builds for `retention` instead of [`DEFAULT_RETENTION`].
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Hand out the receiving end of the build queue. Only the first
    /// caller gets it.
    pub async fn take_queue(&self) -> Option<mpsc::UnboundedReceiver<BuildRequest>> {
        self.pending.lock().await.take()
    }

    /// Register the `kinto.toml` content of a repository branch.
    pub async fn register_manifest(&self, org: &str, repo: &str, branch: &str, content: &str) {
        self.manifests
            .write()
            .await
            .insert(manifest_key(org, repo, branch), content.to_string());
    }

    /// Append a line to a queued build's output.
    pub async fn publish_log(
        &self,
        env_id: &str,
        block: &str,
        release_id: &str,
        step: &str,
        line: &str,
    ) -> BuildResult<()> {
        let key = release_key(env_id, block, release_id);
        let mut builds = self.builds.write().await;
        let record = live_build(&mut builds, &key)?;
        let log = Logs {
            release_id: release_id.to_string(),
            step: step.to_string(),
            line: line.to_string(),
            timestamp: epoch_secs(),
        };
        record.history.push(log.clone());
        // Sent under the lock so watchers never see a line twice.
        let _ = self.logs.send(LogEvent {
            key,
            line: Some(log),
        });
        Ok(())
    }

    /// Mark a build as finished and end its log streams.
    pub async fn finish_build(&self, env_id: &str, block: &str, release_id: &str) -> BuildResult<()> {
        let key = release_key(env_id, block, release_id);
        let mut builds = self.builds.write().await;
        live_build(&mut builds, &key)?.end(BuildPhase::Finished);
        let _ = self.logs.send(LogEvent { key, line: None });
        debug!(env = %env_id, %block, release = %release_id, "build finished");
        Ok(())
    }

    /// Whether the build of a release was aborted.
    pub async fn is_aborted(&self, env_id: &str, block: &str, release_id: &str) -> bool {
        self.builds
            .read()
            .await
            .get(&release_key(env_id, block, release_id))
            .is_some_and(|b| b.phase == BuildPhase::Aborted)
    }

    /// Number of build records held, running or ended.
    pub async fn tracked_builds(&self) -> usize {
        self.builds.read().await.len()
    }

    /// Number of live log watcher tasks.
    pub fn watcher_count(&self) -> usize {
        self.logs.receiver_count()
    }
}

impl Default for LocalBuildClient {
    fn default() -> Self {
        Self::new()
    }
}

fn manifest_key(org: &str, repo: &str, branch: &str) -> String {
    format!("{org}/{repo}@{branch}")
}

fn live_build<'a>(
    builds: &'a mut HashMap<String, BuildRecord>,
    key: &str,
) -> BuildResult<&'a mut BuildRecord> {
    match builds.get_mut(key) {
        Some(record) if record.phase.is_done() => {
            Err(BuildError::Rejected(format!("build {key} is no longer running")))
        }
        Some(record) => Ok(record),
        None => Err(BuildError::NotFound(format!("build {key}"))),
    }
}

#[async_trait]
impl BuildClient for LocalBuildClient {
    async fn trigger_build(&self, request: &BuildRequest) -> BuildResult<()> {
        if request.build_config.repository.is_empty() {
            return Err(BuildError::Rejected("repository is required".to_string()));
        }
        let key = release_key(&request.env_id, &request.block_name, &request.release_id);
        let mut builds = self.builds.write().await;
        let before = builds.len();
        builds.retain(|_, record| !record.expired(self.retention));
        if builds.len() < before {
            debug!(pruned = before - builds.len(), "ended builds forgotten");
        }
        if builds.contains_key(&key) {
            return Err(BuildError::Rejected(format!("build {key} already triggered")));
        }
        self.queue
            .send(request.clone())
            .map_err(|_| BuildError::Unavailable("build queue closed".to_string()))?;
        builds.insert(
            key,
            BuildRecord {
                phase: BuildPhase::Queued,
                history: Vec::new(),
                ended_at: None,
            },
        );
        info!(
            env = %request.env_id,
            block = %request.block_name,
            release = %request.release_id,
            artifact = %request.artifact,
            "build queued"
        );
        Ok(())
    }

    async fn abort_build(&self, env_id: &str, block: &str, release_id: &str) -> BuildResult<()> {
        let key = release_key(env_id, block, release_id);
        let mut builds = self.builds.write().await;
        let record = builds
            .get_mut(&key)
            .ok_or_else(|| BuildError::NotFound(format!("build {key}")))?;
        match record.phase {
            BuildPhase::Aborted => return Ok(()),
            BuildPhase::Finished => {
                return Err(BuildError::Rejected(format!("build {key} already finished")));
            }
            BuildPhase::Queued => record.end(BuildPhase::Aborted),
        }
        let _ = self.logs.send(LogEvent { key, line: None });
        info!(env = %env_id, %block, release = %release_id, "build aborted");
        Ok(())
    }

    async fn watch_build_logs(
        &self,
        env_id: &str,
        block: &str,
        release_id: &str,
    ) -> BuildResult<Subscription<Logs, BuildError>> {
        let key = release_key(env_id, block, release_id);
        // Subscribe and snapshot under one read lock so nothing is missed
        // or repeated between replay and live output.
        let (mut events, history, done) = {
            let builds = self.builds.read().await;
            let record = builds
                .get(&key)
                .ok_or_else(|| BuildError::NotFound(format!("build {key}")))?;
            (
                self.logs.subscribe(),
                record.history.clone(),
                record.phase.is_done(),
            )
        };

        let (publisher, subscription) = subscription(WATCH_BUFFER);
        tokio::spawn(async move {
            for line in history {
                if publisher.send(line).await.is_err() {
                    return;
                }
            }
            if done {
                return;
            }
            loop {
                let event = tokio::select! {
                    biased;
                    _ = publisher.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(LogEvent { key: k, line }) if k == key => match line {
                        Some(line) => {
                            if publisher.send(line).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(build = %key, skipped, "log watcher lagged, lines dropped");
                    }
                    Err(RecvError::Closed) => {
                        publisher
                            .fail(BuildError::Unavailable("log hub closed".to_string()))
                            .await;
                        return;
                    }
                }
            }
            debug!(build = %key, "log watcher stopped");
        });

        Ok(subscription)
    }

    async fn fetch_manifest(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        token: Option<&str>,
    ) -> BuildResult<String> {
        debug!(%org, %repo, %branch, has_token = token.is_some(), "fetching manifest");
        let key = manifest_key(org, repo, branch);
        if let Some(content) = self.manifests.read().await.get(&key) {
            return Ok(content.clone());
        }
        let Some(root) = &self.manifest_root else {
            return Err(BuildError::NotFound(format!("{MANIFEST_FILE} in {key}")));
        };
        let path = root.join(org).join(repo).join(branch).join(MANIFEST_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BuildError::NotFound(format!("{MANIFEST_FILE} in {key}")))
            }
            Err(e) => Err(BuildError::Unavailable(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinto_core::BuildConfig;
    use std::time::Duration;

    fn request(release_id: &str) -> BuildRequest {
        BuildRequest {
            env_id: "prod".to_string(),
            block_name: "api".to_string(),
            release_id: release_id.to_string(),
            build_config: BuildConfig {
                repository: "https://github.com/acme/api".to_string(),
                branch: "main".to_string(),
                language: "rust".to_string(),
                ..BuildConfig::default()
            },
            artifact: format!("registry.local/prod/api:{release_id}"),
        }
    }

    #[tokio::test]
    async fn trigger_enqueues_once() {
        let client = LocalBuildClient::new();
        let mut queue = client.take_queue().await.unwrap();
        assert!(client.take_queue().await.is_none());

        client.trigger_build(&request("r1")).await.unwrap();
        assert_eq!(queue.recv().await.unwrap().release_id, "r1");

        let err = client.trigger_build(&request("r1")).await.unwrap_err();
        assert!(matches!(err, BuildError::Rejected(_)));
    }

    #[tokio::test]
    async fn trigger_fails_when_worker_is_gone() {
        let client = LocalBuildClient::new();
        drop(client.take_queue().await);
        let err = client.trigger_build(&request("r1")).await.unwrap_err();
        assert!(matches!(err, BuildError::Unavailable(_)));
    }

    #[tokio::test]
    async fn abort_stops_a_queued_build() {
        let client = LocalBuildClient::new();
        client.trigger_build(&request("r1")).await.unwrap();

        client.abort_build("prod", "api", "r1").await.unwrap();
        client.abort_build("prod", "api", "r1").await.unwrap();
        assert!(client.is_aborted("prod", "api", "r1").await);

        assert!(matches!(
            client.publish_log("prod", "api", "r1", "build", "late").await,
            Err(BuildError::Rejected(_))
        ));
        assert!(matches!(
            client.abort_build("prod", "api", "r2").await,
            Err(BuildError::NotFound(_))
        ));

        client.trigger_build(&request("r3")).await.unwrap();
        client.finish_build("prod", "api", "r3").await.unwrap();
        assert!(matches!(
            client.abort_build("prod", "api", "r3").await,
            Err(BuildError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn watcher_replays_then_follows_until_finished() {
        let client = LocalBuildClient::new();
        client.trigger_build(&request("r1")).await.unwrap();
        client
            .publish_log("prod", "api", "r1", "clone", "cloning acme/api")
            .await
            .unwrap();

        let mut sub = client.watch_build_logs("prod", "api", "r1").await.unwrap();
        client
            .publish_log("prod", "api", "r1", "build", "cargo build --release")
            .await
            .unwrap();
        client.finish_build("prod", "api", "r1").await.unwrap();

        let mut lines = Vec::new();
        while let Some(event) = sub.next().await {
            lines.push(event.unwrap().line);
        }
        assert_eq!(lines, vec!["cloning acme/api", "cargo build --release"]);

        // A finished build still replays its output.
        let mut late = client.watch_build_logs("prod", "api", "r1").await.unwrap();
        assert_eq!(late.next().await.unwrap().unwrap().step, "clone");
        assert_eq!(late.next().await.unwrap().unwrap().step, "build");
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_log_watch_releases_receiver() {
        let client = LocalBuildClient::new();
        client.trigger_build(&request("r1")).await.unwrap();
        let sub = client.watch_build_logs("prod", "api", "r1").await.unwrap();
        assert_eq!(client.watcher_count(), 1);

        drop(sub);
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.watcher_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ended_builds_are_forgotten_after_retention() {
        let kept = LocalBuildClient::new();
        kept.trigger_build(&request("r1")).await.unwrap();
        kept.finish_build("prod", "api", "r1").await.unwrap();
        kept.trigger_build(&request("r2")).await.unwrap();
        assert_eq!(kept.tracked_builds().await, 2);

        let client = LocalBuildClient::new().with_retention(Duration::ZERO);
        client.trigger_build(&request("r1")).await.unwrap();
        client.trigger_build(&request("r2")).await.unwrap();
        client.abort_build("prod", "api", "r2").await.unwrap();
        client.finish_build("prod", "api", "r1").await.unwrap();
        // Still replayable until the next trigger prunes it.
        assert!(client.watch_build_logs("prod", "api", "r1").await.is_ok());

        client.trigger_build(&request("r3")).await.unwrap();
        assert_eq!(client.tracked_builds().await, 1);
        assert!(matches!(
            client.watch_build_logs("prod", "api", "r1").await,
            Err(BuildError::NotFound(_))
        ));
        assert!(!client.is_aborted("prod", "api", "r2").await);
    }

    #[tokio::test]
    async fn unknown_build_cannot_be_watched() {
        let client = LocalBuildClient::new();
        assert!(matches!(
            client.watch_build_logs("prod", "api", "nope").await,
            Err(BuildError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn manifests_from_registry_then_directory() {
        let dir = tempfile::tempdir().unwrap();
        let branch_dir = dir.path().join("acme").join("web").join("main");
        std::fs::create_dir_all(&branch_dir).unwrap();
        std::fs::write(branch_dir.join(MANIFEST_FILE), "[build]\nlanguage = \"node\"\n").unwrap();

        let client = LocalBuildClient::new().with_manifest_root(dir.path());
        client
            .register_manifest("acme", "api", "main", "[build]\nlanguage = \"rust\"\n")
            .await;

        let api = client.fetch_manifest("acme", "api", "main", None).await.unwrap();
        assert!(api.contains("rust"));
        let web = client
            .fetch_manifest("acme", "web", "main", Some("token"))
            .await
            .unwrap();
        assert!(web.contains("node"));
        assert!(matches!(
            client.fetch_manifest("acme", "web", "dev", None).await,
            Err(BuildError::NotFound(_))
        ));
    }
}
