//! MetricsMiddleware: call and error counters per workflow operation.
//!
//! Counters are plain atomics in a map fixed at construction, so the hot
//! path takes no lock. [`MetricsMiddleware::render_prometheus`] produces the
//! text exposition served on `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use kinto_core::{
    BlockRef, BuildConfig, BuildState, ConsoleLog, Logs, Release, ReleasesStatus, RunConfig,
    TeleportServiceData,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ControllerApi;
use crate::chain::{Link, successor};
use crate::error::ControlResult;
use crate::watch::JobStatusCallback;

/// Operations counted by the middleware.
pub const COUNTED_OPERATIONS: [&str; 15] = [
    "create_block",
    "deploy_block_update",
    "trigger_deploy",
    "rollback_block",
    "promote_release",
    "suspend_block",
    "delete_block",
    "abort_release",
    "update_build_status",
    "start_teleport",
    "stop_teleport",
    "watch_releases_status",
    "watch_jobs_status",
    "watch_build_logs",
    "watch_console_logs",
];

#[derive(Debug, Default)]
struct OpCounters {
    calls: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time counters of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpSnapshot {
    pub calls: u64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct MetricsMiddleware {
    link: Link,
    ops: BTreeMap<&'static str, OpCounters>,
    active_watches: AtomicI64,
}

/// Holds one unit of the active-watch gauge; released even when the watch
/// future is dropped before it completes.
struct ActiveWatch<'a>(&'a AtomicI64);

impl<'a> ActiveWatch<'a> {
    fn enter(gauge: &'a AtomicI64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for ActiveWatch<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for MetricsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self {
            link: Link::new(),
            ops: COUNTED_OPERATIONS
                .into_iter()
                .map(|op| (op, OpCounters::default()))
                .collect(),
            active_watches: AtomicI64::new(0),
        }
    }

    pub fn snapshot(&self, operation: &str) -> OpSnapshot {
        self.ops
            .get(operation)
            .map(|c| OpSnapshot {
                calls: c.calls.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn active_watches(&self) -> i64 {
        self.active_watches.load(Ordering::Relaxed)
    }

    fn observe<T>(&self, operation: &'static str, result: ControlResult<T>) -> ControlResult<T> {
        if let Some(counters) = self.ops.get(operation) {
            counters.calls.fetch_add(1, Ordering::Relaxed);
            if result.is_err() {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn watched<F>(&self, operation: &'static str, watch: F) -> ControlResult<()>
    where
        F: Future<Output = ControlResult<()>>,
    {
        let result = {
            let _active = ActiveWatch::enter(&self.active_watches);
            watch.await
        };
        self.observe(operation, result)
    }

    /// Render the counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP kinto_controller_calls_total Controller calls by operation.\n");
        out.push_str("# TYPE kinto_controller_calls_total counter\n");
        for (op, counters) in &self.ops {
            out.push_str(&format!(
                "kinto_controller_calls_total{{operation=\"{}\"}} {}\n",
                op,
                counters.calls.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP kinto_controller_errors_total Failed controller calls by operation.\n");
        out.push_str("# TYPE kinto_controller_errors_total counter\n");
        for (op, counters) in &self.ops {
            out.push_str(&format!(
                "kinto_controller_errors_total{{operation=\"{}\"}} {}\n",
                op,
                counters.errors.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP kinto_controller_active_watches Watches currently streaming.\n");
        out.push_str("# TYPE kinto_controller_active_watches gauge\n");
        out.push_str(&format!(
            "kinto_controller_active_watches {}\n",
            self.active_watches()
        ));

        out
    }
}

#[async_trait]
impl ControllerApi for MetricsMiddleware {
    fn link(&self) -> Option<&Link> {
        Some(&self.link)
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
        self.observe("create_block", result)
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
        self.observe("deploy_block_update", result)
    }

    async fn trigger_deploy(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let result = successor(self.link()).trigger_deploy(name, env).await;
        self.observe("trigger_deploy", result)
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
        self.observe("rollback_block", result)
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
        self.observe("promote_release", result)
    }

    async fn suspend_block(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        let result = successor(self.link()).suspend_block(name, env).await;
        self.observe("suspend_block", result)
    }

    async fn delete_block(&self, name: &str, env: &str) -> ControlResult<()> {
        let result = successor(self.link()).delete_block(name, env).await;
        self.observe("delete_block", result)
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
        self.observe("abort_release", result)
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
        self.observe("update_build_status", result)
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
        self.observe("start_teleport", result)
    }

    async fn stop_teleport(&self, env: &str, block: &str) -> ControlResult<()> {
        let result = successor(self.link()).stop_teleport(env, block).await;
        self.observe("stop_teleport", result)
    }

    async fn watch_releases_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        tx: mpsc::Sender<ReleasesStatus>,
    ) -> ControlResult<()> {
        let next = successor(self.link());
        self.watched(
            "watch_releases_status",
            next.watch_releases_status(block, env, cancel, tx),
        )
        .await
    }

    async fn watch_jobs_status(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        callback: JobStatusCallback,
    ) -> ControlResult<()> {
        let next = successor(self.link());
        self.watched(
            "watch_jobs_status",
            next.watch_jobs_status(block, env, cancel, callback),
        )
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
        let next = successor(self.link());
        self.watched(
            "watch_build_logs",
            next.watch_build_logs(release_id, block, env, cancel, tx),
        )
        .await
    }

    async fn watch_console_logs(
        &self,
        block: &str,
        env: &str,
        cancel: &CancellationToken,
        tx: mpsc::Sender<ConsoleLog>,
    ) -> ControlResult<()> {
        let next = successor(self.link());
        self.watched(
            "watch_console_logs",
            next.watch_console_logs(block, env, cancel, tx),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_operation() {
        let metrics = MetricsMiddleware::new();
        let output = metrics.render_prometheus();
        for op in COUNTED_OPERATIONS {
            assert!(
                output.contains(&format!("kinto_controller_calls_total{{operation=\"{op}\"}} 0")),
                "{op}"
            );
        }
        assert!(output.contains("# TYPE kinto_controller_active_watches gauge"));
        assert!(output.contains("kinto_controller_active_watches 0"));
    }

    #[test]
    fn observe_counts_calls_and_errors() {
        let metrics = MetricsMiddleware::new();
        let _ = metrics.observe("rollback_block", Ok::<_, crate::ControlError>(()));
        let _ = metrics.observe::<()>(
            "rollback_block",
            Err(crate::ControlError::Conflict("failed release".into())),
        );
        assert_eq!(
            metrics.snapshot("rollback_block"),
            OpSnapshot {
                calls: 2,
                errors: 1
            }
        );
        assert_eq!(metrics.snapshot("unknown"), OpSnapshot::default());
    }

    #[tokio::test]
    async fn dropped_watch_releases_the_gauge() {
        let metrics = MetricsMiddleware::new();
        let watch = metrics.watched(
            "watch_console_logs",
            std::future::pending::<ControlResult<()>>(),
        );
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), watch).await;
        assert!(timed_out.is_err());
        assert_eq!(metrics.active_watches(), 0);
        assert_eq!(metrics.snapshot("watch_console_logs").calls, 0);
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = MetricsMiddleware::new().render_prometheus();
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (_, value) = line.rsplit_once(' ').unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad sample line: {line}");
        }
    }
}
