//! Domain types for the Kinto control plane.
//!
//! Environments, blocks and releases are persisted by the state store.
//! Statuses, logs and metrics are transient projections relayed to
//! subscribers. All types serialize to JSON for storage and transport.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::release::BuildState;

/// Identifier of an environment.
pub type EnvironmentId = String;

/// Identifier of a release (unique within its block).
pub type ReleaseId = String;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Environment ───────────────────────────────────────────────────

/// An isolated grouping of blocks (e.g. staging, production).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    /// Display name, freely renamable.
    pub name: String,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Block ─────────────────────────────────────────────────────────

/// Whether a block is a long-running service or a run-to-completion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    #[default]
    Service,
    Job,
}

/// Protocol a service speaks on its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
}

/// How to turn the block's source into an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BuildConfig {
    /// Repository URL (https or git).
    pub repository: String,
    pub branch: String,
    pub language: String,
    pub language_version: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    /// Path to a Dockerfile; when set, language detection is skipped.
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_args: HashMap<String, String>,
}

/// How a built image runs on the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub block_type: BlockType,
    pub port: u16,
    pub protocol: Protocol,
    /// Publish the block through an external URL.
    pub expose_externally: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub memory_mb: u32,
    pub cpu_millicores: u32,
    /// Jobs only: wall-clock limit for one run.
    pub job_timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            block_type: BlockType::Service,
            port: 8080,
            protocol: Protocol::Http,
            expose_externally: false,
            min_instances: 1,
            max_instances: 1,
            memory_mb: 256,
            cpu_millicores: 250,
            job_timeout_secs: None,
            env: HashMap::new(),
        }
    }
}

/// A deployable unit inside an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub name: String,
    pub env_id: EnvironmentId,
    pub block_type: BlockType,
    /// Configuration of the active release (or the first release until one
    /// is activated).
    pub build_config: BuildConfig,
    pub run_config: RunConfig,
    pub active_release_id: Option<ReleaseId>,
    /// Scaled to zero by `suspend_block`.
    pub suspended: bool,
    pub external_url: Option<String>,
    /// Number assigned to the most recent release.
    pub release_seq: u32,
    /// Bumped on every write.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Block {
    /// Composite key `{env}/{name}` used by the state store.
    pub fn table_key(&self) -> String {
        block_key(&self.env_id, &self.name)
    }
}

/// Composite key for a block.
pub fn block_key(env_id: &str, block_name: &str) -> String {
    format!("{env_id}/{block_name}")
}

/// Pair returned by every workflow that produces or selects a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRef {
    pub block_name: String,
    pub release_id: ReleaseId,
}

impl BlockRef {
    pub fn new(block_name: impl Into<String>, release_id: impl Into<String>) -> Self {
        Self {
            block_name: block_name.into(),
            release_id: release_id.into(),
        }
    }
}

// ── Release ───────────────────────────────────────────────────────

/// Where a promoted release was copied from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRef {
    pub env_id: EnvironmentId,
    pub release_id: ReleaseId,
}

/// A versioned deployment attempt for a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub id: ReleaseId,
    pub env_id: EnvironmentId,
    pub block_name: String,
    /// Per-block sequence number, assigned by the store on insert.
    pub number: u32,
    /// Release this one was derived from.
    pub parent_id: Option<ReleaseId>,
    pub promoted_from: Option<ReleaseRef>,
    pub state: BuildState,
    pub commit_sha: Option<String>,
    pub tag: Option<String>,
    pub build_config: BuildConfig,
    pub run_config: RunConfig,
    /// Image reference produced (or to be produced) by the build.
    pub artifact: String,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Release {
    /// Composite key `{env}/{block}:{id}` used by the state store.
    pub fn table_key(&self) -> String {
        release_key(&self.env_id, &self.block_name, &self.id)
    }
}

/// Composite key for a release.
pub fn release_key(env_id: &str, block_name: &str, release_id: &str) -> String {
    format!("{env_id}/{block_name}:{release_id}")
}

/// Configuration pair derived from a repository manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseConfig {
    pub build_config: BuildConfig,
    pub run_config: RunConfig,
}

// ── Projections ───────────────────────────────────────────────────

/// Build state of one release as seen by a status watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseStatus {
    pub release_id: ReleaseId,
    pub number: u32,
    pub state: BuildState,
    pub active: bool,
}

/// Snapshot of every release of a block, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleasesStatus {
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub active_release_id: Option<ReleaseId>,
    pub suspended: bool,
    pub releases: Vec<ReleaseStatus>,
}

/// Lifecycle of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub release_id: ReleaseId,
    pub state: JobState,
    pub message: Option<String>,
    pub updated_at: u64,
}

/// One line of runtime output from a block instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleLog {
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub instance_id: String,
    pub line: String,
    pub timestamp: u64,
}

/// One line of build output for a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Logs {
    pub release_id: ReleaseId,
    /// Build step that produced the line ("clone", "build", "push", ...).
    pub step: String,
    pub line: String,
    pub timestamp: u64,
}

// ── Runtime records ───────────────────────────────────────────────

/// A running instance of a block, as reported by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub release_id: ReleaseId,
    pub healthy: bool,
    pub started_at: u64,
}

impl InstanceRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", block_key(&self.env_id, &self.block_name), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockHealth {
    /// No release has been activated yet.
    Pending,
    Healthy,
    Unhealthy,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockStatus {
    pub block_name: String,
    pub health: BlockHealth,
    pub running_instances: u32,
    pub active_release_id: Option<ReleaseId>,
}

/// Health of every block in an environment, keyed by block name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockStatuses {
    pub env_id: EnvironmentId,
    pub statuses: BTreeMap<String, BlockStatus>,
}

/// Resource usage snapshot for one block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockMetrics {
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub cpu_millicores: u32,
    pub memory_bytes: u64,
    pub instances: u32,
    pub updated_at: u64,
}

impl BlockMetrics {
    pub fn table_key(&self) -> String {
        block_key(&self.env_id, &self.block_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlocksMetrics {
    pub env_id: EnvironmentId,
    pub metrics: BTreeMap<String, BlockMetrics>,
}

// ── Routing ───────────────────────────────────────────────────────

/// A custom domain routed to a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomDomain {
    pub domain: String,
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub protocol: Protocol,
    /// Set by the certificate issuer once TLS is ready.
    pub certificate_ready: bool,
    pub created_at: u64,
}

// ── Teleport ──────────────────────────────────────────────────────

/// Connection details of a debug tunnel into a running block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeleportServiceData {
    pub session_id: String,
    pub env_id: EnvironmentId,
    pub block_name: String,
    pub host: String,
    pub port: u16,
    pub started_at: u64,
    pub expires_at: u64,
}

impl TeleportServiceData {
    pub fn table_key(&self) -> String {
        block_key(&self.env_id, &self.block_name)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

// ── Configuration exposed to clients ──────────────────────────────

/// Public controller settings the front end needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KintoConfiguration {
    pub external_domain: String,
    pub external_urls_enabled: bool,
    pub teleport_port: u16,
    pub teleport_ttl_secs: u64,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys() {
        assert_eq!(block_key("prod", "api"), "prod/api");
        assert_eq!(release_key("prod", "api", "r1"), "prod/api:r1");

        let inst = InstanceRecord {
            id: "api-0".to_string(),
            env_id: "prod".to_string(),
            block_name: "api".to_string(),
            release_id: "r1".to_string(),
            healthy: true,
            started_at: 1000,
        };
        assert_eq!(inst.table_key(), "prod/api:api-0");
    }

    #[test]
    fn teleport_expiry_is_inclusive() {
        let session = TeleportServiceData {
            session_id: "s".to_string(),
            env_id: "dev".to_string(),
            block_name: "api".to_string(),
            host: "teleport-api.dev".to_string(),
            port: 2222,
            started_at: 100,
            expires_at: 200,
        };
        assert!(!session.is_expired(199));
        assert!(session.is_expired(200));
    }

    #[test]
    fn block_type_serializes_snake_case() {
        let json = serde_json::to_string(&BlockType::Job).unwrap();
        assert_eq!(json, "\"job\"");
        let run: RunConfig = serde_json::from_str(
            r#"{"block_type":"service","port":80,"protocol":"grpc","expose_externally":true,
                "min_instances":1,"max_instances":2,"memory_mb":128,"cpu_millicores":100,
                "job_timeout_secs":null}"#,
        )
        .unwrap();
        assert_eq!(run.protocol, Protocol::Grpc);
        assert!(run.env.is_empty());
    }
}
