//! The store contract consumed by the controller.

use async_trait::async_trait;
use kinto_core::{
    Block, BlockStatuses, BlocksMetrics, ConsoleLog, CustomDomain, Environment, JobStatus,
    Release, ReleasesStatus, Subscription, TeleportServiceData,
};

use crate::error::{StoreError, StoreResult};

/// Backend holding every durable record of the control plane.
///
/// Implementations must be safe for concurrent use. Writers racing on the
/// same block or release are serialized by the backend; a write that no
/// longer matches what it was computed from fails with
/// [`StoreError::Conflict`] and is never retried here.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Environments ──────────────────────────────────────────────

    /// Fails with `Conflict` if the id is taken.
    async fn create_environment(&self, env: &Environment) -> StoreResult<()>;

    async fn get_environment(&self, id: &str) -> StoreResult<Environment>;

    async fn list_environments(&self) -> StoreResult<Vec<Environment>>;

    /// Replace an existing environment record.
    async fn update_environment(&self, env: &Environment) -> StoreResult<()>;

    /// Delete an environment and everything its blocks own.
    async fn delete_environment(&self, id: &str) -> StoreResult<()>;

    // ── Blocks ────────────────────────────────────────────────────

    /// Insert a block together with its first release, atomically.
    ///
    /// The environment must exist; a block with the same name must not.
    /// Returns the stored release (with its sequence number assigned).
    async fn create_block(&self, block: &Block, first_release: &Release) -> StoreResult<Release>;

    async fn get_block(&self, env_id: &str, name: &str) -> StoreResult<Block>;

    async fn list_blocks(&self, env_id: &str) -> StoreResult<Vec<Block>>;

    /// Delete a block with its releases, instances, domains and sessions.
    async fn delete_block(&self, env_id: &str, name: &str) -> StoreResult<()>;

    /// Scale a block to zero. Suspending a suspended block changes nothing.
    async fn suspend_block(&self, env_id: &str, name: &str) -> StoreResult<Block>;

    // ── Releases ──────────────────────────────────────────────────

    /// Insert a new release for an existing block, assigning its number.
    async fn insert_release(&self, release: &Release) -> StoreResult<Release>;

    async fn get_release(&self, env_id: &str, block: &str, id: &str) -> StoreResult<Release>;

    /// All releases of a block, newest first.
    async fn list_releases(&self, env_id: &str, block: &str) -> StoreResult<Vec<Release>>;

    /// Overwrite a release if its stored version still equals
    /// `expected_version`. Returns the stored release with a bumped version.
    async fn update_release(&self, release: &Release, expected_version: u64)
    -> StoreResult<Release>;

    /// Point the block at a release and resume it if suspended.
    ///
    /// Fails with `Conflict`, writing nothing, unless the release build has
    /// succeeded.
    async fn activate_release(&self, env_id: &str, block: &str, release_id: &str)
    -> StoreResult<Block>;

    // ── Runtime ───────────────────────────────────────────────────

    async fn get_blocks_health_status(&self, env_id: &str) -> StoreResult<BlockStatuses>;

    /// Metrics of one block, or of every block when `block` is `None`.
    async fn get_blocks_metrics(&self, env_id: &str, block: Option<&str>)
    -> StoreResult<BlocksMetrics>;

    /// Remove one running instance so the orchestrator replaces it.
    async fn kill_block_instance(&self, env_id: &str, instance_id: &str) -> StoreResult<()>;

    // ── Routing ───────────────────────────────────────────────────

    async fn set_external_url(&self, env_id: &str, block: &str, url: Option<String>)
    -> StoreResult<Block>;

    /// Fails with `Conflict` if another block owns the domain. Re-adding a
    /// domain to its owner is a no-op.
    async fn create_custom_domain(&self, domain: &CustomDomain) -> StoreResult<()>;

    async fn delete_custom_domain(&self, env_id: &str, block: &str, domain: &str)
    -> StoreResult<()>;

    async fn list_custom_domains(&self, env_id: &str, block: &str) -> StoreResult<Vec<CustomDomain>>;

    // ── Teleport ──────────────────────────────────────────────────

    async fn get_teleport(&self, env_id: &str, block: &str)
    -> StoreResult<Option<TeleportServiceData>>;

    /// Store `session` unless an unexpired one exists at `now`. Returns the
    /// session in effect and whether it is the one just stored.
    async fn claim_teleport(
        &self,
        session: &TeleportServiceData,
        now: u64,
    ) -> StoreResult<(TeleportServiceData, bool)>;

    /// Remove the block's session; with `session_id`, only if it matches.
    /// Returns whether a session was removed.
    async fn delete_teleport(&self, env_id: &str, block: &str, session_id: Option<&str>)
    -> StoreResult<bool>;

    // ── Watches ───────────────────────────────────────────────────

    /// Current status snapshot followed by a new snapshot on every change.
    /// Ends with `NotFound` if the block is deleted.
    async fn watch_releases_status(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<ReleasesStatus, StoreError>>;

    async fn watch_jobs_status(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<JobStatus, StoreError>>;

    async fn watch_console_logs(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<ConsoleLog, StoreError>>;
}
