//! redb table definitions for the Kinto state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{env}/{block}` or `{env}/{block}:{id}`.

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Environments keyed by `{env_id}`.
pub const ENVIRONMENTS: JsonTable = TableDefinition::new("environments");

/// Blocks keyed by `{env}/{block}`.
pub const BLOCKS: JsonTable = TableDefinition::new("blocks");

/// Releases keyed by `{env}/{block}:{release_id}`.
pub const RELEASES: JsonTable = TableDefinition::new("releases");

/// Running instances keyed by `{env}/{block}:{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Latest resource usage keyed by `{env}/{block}`.
pub const METRICS: JsonTable = TableDefinition::new("metrics");

/// Custom domains keyed by `{domain}`.
pub const DOMAINS: JsonTable = TableDefinition::new("domains");

/// Teleport sessions keyed by `{env}/{block}`.
pub const TELEPORTS: JsonTable = TableDefinition::new("teleports");

/// Every table, for creation on open.
pub const ALL: [JsonTable; 7] = [
    ENVIRONMENTS,
    BLOCKS,
    RELEASES,
    INSTANCES,
    METRICS,
    DOMAINS,
    TELEPORTS,
];
