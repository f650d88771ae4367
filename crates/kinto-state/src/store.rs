//! StateStore: redb-backed implementation of [`Store`].
//!
//! Every mutation runs in a single redb write transaction, so
//! read-check-write sequences (duplicate detection, optimistic versions,
//! activation guards) are atomic with respect to other writers. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use kinto_core::*;

use crate::error::{StoreError, StoreResult};
use crate::events::{EventHub, StoreEvent};
use crate::tables::*;
use crate::traits::Store;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Buffer between a watcher task and its consumer.
const WATCH_BUFFER: usize = 64;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: EventHub,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> StoreResult<Self> {
        let store = Self {
            db: Arc::new(db),
            events: EventHub::new(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Runtime feeds ─────────────────────────────────────────────
    //
    // Called by the orchestrator agent, not by the controller.

    /// Record (or refresh) a running instance.
    pub fn put_instance(&self, instance: &InstanceRecord) -> StoreResult<()> {
        self.write(|txn| put_in(txn, INSTANCES, &instance.table_key(), instance))
    }

    /// Record the latest resource usage of a block.
    pub fn put_block_metrics(&self, metrics: &BlockMetrics) -> StoreResult<()> {
        self.write(|txn| put_in(txn, METRICS, &metrics.table_key(), metrics))
    }

    /// Flag a domain's certificate as issued.
    pub fn mark_certificate_ready(&self, domain: &str) -> StoreResult<()> {
        self.write(|txn| {
            let mut record: CustomDomain = get_in(txn, DOMAINS, domain)?
                .ok_or_else(|| StoreError::NotFound(format!("domain {domain}")))?;
            record.certificate_ready = true;
            put_in(txn, DOMAINS, domain, &record)
        })
    }

    /// Relay a job status change to watchers.
    pub fn publish_job_status(&self, status: JobStatus) {
        self.events.publish(StoreEvent::Job(status));
    }

    /// Relay a line of instance output to watchers.
    pub fn publish_console_log(&self, log: ConsoleLog) {
        self.events.publish(StoreEvent::Console(log));
    }

    /// Number of live watcher tasks.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    // ── Transaction helpers ───────────────────────────────────────

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StoreResult<R>) -> StoreResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    fn read_one<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn read_prefix<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StoreResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn require_block(&self, env_id: &str, name: &str) -> StoreResult<Block> {
        self.read_one(BLOCKS, &block_key(env_id, name))?
            .ok_or_else(|| StoreError::NotFound(format!("block {name} in environment {env_id}")))
    }

    fn releases_of(&self, env_id: &str, block: &str) -> StoreResult<Vec<Release>> {
        let mut releases: Vec<Release> =
            self.read_prefix(RELEASES, &release_prefix(env_id, block))?;
        releases.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(releases)
    }

    /// Build the status projection served to release watchers.
    pub fn releases_status(&self, env_id: &str, block: &str) -> StoreResult<ReleasesStatus> {
        let record = self.require_block(env_id, block)?;
        let releases = self
            .releases_of(env_id, block)?
            .into_iter()
            .map(|r| ReleaseStatus {
                active: record.active_release_id.as_deref() == Some(r.id.as_str()),
                release_id: r.id,
                number: r.number,
                state: r.state,
            })
            .collect();
        Ok(ReleasesStatus {
            env_id: env_id.to_string(),
            block_name: block.to_string(),
            active_release_id: record.active_release_id,
            suspended: record.suspended,
            releases,
        })
    }

    /// Forward hub events accepted by `select` to a new subscription.
    fn forward_events<T, F>(&self, env_id: &str, block: &str, select: F) -> Subscription<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(StoreEvent) -> Option<T> + Send + 'static,
    {
        let (publisher, subscription) = subscription(WATCH_BUFFER);
        let mut events = self.events.subscribe();
        let env_id = env_id.to_string();
        let block = block.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = publisher.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.targets(&env_id, &block) => {
                        if let Some(item) = select(event) {
                            if publisher.send(item).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(env = %env_id, %block, skipped, "watcher lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(env = %env_id, %block, "event watcher stopped");
        });

        subscription
    }
}

// ── Free helpers over an open write transaction ───────────────────

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn release_prefix(env_id: &str, block: &str) -> String {
    format!("{}:", block_key(env_id, block))
}

fn get_in<T: DeserializeOwned>(txn: &WriteTransaction, table: JsonTable, key: &str) -> StoreResult<Option<T>> {
    let table = txn.open_table(table).map_err(map_err!(Table))?;
    let value = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(value)
}

fn put_in<T: Serialize>(txn: &WriteTransaction, table: JsonTable, key: &str, value: &T) -> StoreResult<()> {
    let bytes = encode(value)?;
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn remove_in(txn: &WriteTransaction, table: JsonTable, key: &str) -> StoreResult<bool> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
    Ok(existed)
}

fn scan_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    table: JsonTable,
    matches: impl Fn(&str) -> bool,
) -> StoreResult<Vec<(String, T)>> {
    let table = txn.open_table(table).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if matches(key.value()) {
            results.push((key.value().to_string(), decode(value.value())?));
        }
    }
    Ok(results)
}

/// Delete every key accepted by `matches`. Returns the number removed.
fn remove_matching(
    txn: &WriteTransaction,
    table: JsonTable,
    matches: impl Fn(&str) -> bool,
) -> StoreResult<u32> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let k = key.value().to_string();
            matches(&k).then_some(k)
        })
        .collect();
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len() as u32)
}

/// Remove a block and everything it owns.
fn cascade_block(txn: &WriteTransaction, env_id: &str, name: &str) -> StoreResult<()> {
    let key = block_key(env_id, name);
    let owned = release_prefix(env_id, name);
    remove_in(txn, BLOCKS, &key)?;
    remove_in(txn, METRICS, &key)?;
    remove_in(txn, TELEPORTS, &key)?;
    let releases = remove_matching(txn, RELEASES, |k| k.starts_with(&owned))?;
    let instances = remove_matching(txn, INSTANCES, |k| k.starts_with(&owned))?;
    let domains: Vec<(String, CustomDomain)> =
        scan_in(txn, DOMAINS, |_| true)?;
    for (domain, record) in domains {
        if record.env_id == env_id && record.block_name == name {
            remove_in(txn, DOMAINS, &domain)?;
        }
    }
    debug!(%key, releases, instances, "block removed");
    Ok(())
}

#[async_trait]
impl Store for StateStore {
    // ── Environments ──────────────────────────────────────────────

    async fn create_environment(&self, env: &Environment) -> StoreResult<()> {
        self.write(|txn| {
            if get_in::<Environment>(txn, ENVIRONMENTS, &env.id)?.is_some() {
                return Err(StoreError::Conflict(format!("environment {} exists", env.id)));
            }
            put_in(txn, ENVIRONMENTS, &env.id, env)
        })?;
        debug!(env = %env.id, "environment stored");
        Ok(())
    }

    async fn get_environment(&self, id: &str) -> StoreResult<Environment> {
        self.read_one(ENVIRONMENTS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("environment {id}")))
    }

    async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        let mut envs: Vec<Environment> = self.read_prefix(ENVIRONMENTS, "")?;
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(envs)
    }

    async fn update_environment(&self, env: &Environment) -> StoreResult<()> {
        self.write(|txn| {
            if get_in::<Environment>(txn, ENVIRONMENTS, &env.id)?.is_none() {
                return Err(StoreError::NotFound(format!("environment {}", env.id)));
            }
            put_in(txn, ENVIRONMENTS, &env.id, env)
        })
    }

    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        let removed: Vec<String> = self.write(|txn| {
            if !remove_in(txn, ENVIRONMENTS, id)? {
                return Err(StoreError::NotFound(format!("environment {id}")));
            }
            let prefix = format!("{id}/");
            let blocks: Vec<(String, Block)> = scan_in(txn, BLOCKS, |k| k.starts_with(&prefix))?;
            for (_, block) in &blocks {
                cascade_block(txn, id, &block.name)?;
            }
            Ok(blocks.into_iter().map(|(_, b)| b.name).collect())
        })?;
        for name in &removed {
            self.events.publish(StoreEvent::releases_changed(id, name));
        }
        debug!(env = %id, blocks = removed.len(), "environment deleted");
        Ok(())
    }

    // ── Blocks ────────────────────────────────────────────────────

    async fn create_block(&self, block: &Block, first_release: &Release) -> StoreResult<Release> {
        let key = block.table_key();
        let stored = self.write(|txn| {
            if get_in::<Environment>(txn, ENVIRONMENTS, &block.env_id)?.is_none() {
                return Err(StoreError::NotFound(format!("environment {}", block.env_id)));
            }
            if get_in::<Block>(txn, BLOCKS, &key)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "block {} already exists in environment {}",
                    block.name, block.env_id
                )));
            }
            let mut block = block.clone();
            let mut release = first_release.clone();
            block.release_seq = 1;
            release.number = 1;
            put_in(txn, BLOCKS, &key, &block)?;
            put_in(txn, RELEASES, &release.table_key(), &release)?;
            Ok(release)
        })?;
        self.events
            .publish(StoreEvent::releases_changed(&block.env_id, &block.name));
        debug!(%key, release = %stored.id, "block stored");
        Ok(stored)
    }

    async fn get_block(&self, env_id: &str, name: &str) -> StoreResult<Block> {
        self.require_block(env_id, name)
    }

    async fn list_blocks(&self, env_id: &str) -> StoreResult<Vec<Block>> {
        let mut blocks: Vec<Block> = self.read_prefix(BLOCKS, &format!("{env_id}/"))?;
        blocks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blocks)
    }

    async fn delete_block(&self, env_id: &str, name: &str) -> StoreResult<()> {
        self.write(|txn| {
            if get_in::<Block>(txn, BLOCKS, &block_key(env_id, name))?.is_none() {
                return Err(StoreError::NotFound(format!(
                    "block {name} in environment {env_id}"
                )));
            }
            cascade_block(txn, env_id, name)
        })?;
        self.events.publish(StoreEvent::releases_changed(env_id, name));
        Ok(())
    }

    async fn suspend_block(&self, env_id: &str, name: &str) -> StoreResult<Block> {
        let key = block_key(env_id, name);
        let (block, changed) = self.write(|txn| {
            let mut block: Block = get_in(txn, BLOCKS, &key)?.ok_or_else(|| {
                StoreError::NotFound(format!("block {name} in environment {env_id}"))
            })?;
            if block.suspended {
                return Ok((block, false));
            }
            block.suspended = true;
            block.version += 1;
            block.updated_at = epoch_secs();
            put_in(txn, BLOCKS, &key, &block)?;
            let owned = release_prefix(env_id, name);
            remove_matching(txn, INSTANCES, |k| k.starts_with(&owned))?;
            Ok((block, true))
        })?;
        if changed {
            self.events.publish(StoreEvent::releases_changed(env_id, name));
            debug!(%key, "block suspended");
        }
        Ok(block)
    }

    // ── Releases ──────────────────────────────────────────────────

    async fn insert_release(&self, release: &Release) -> StoreResult<Release> {
        let key = block_key(&release.env_id, &release.block_name);
        let stored = self.write(|txn| {
            let mut block: Block = get_in(txn, BLOCKS, &key)?.ok_or_else(|| {
                StoreError::NotFound(format!(
                    "block {} in environment {}",
                    release.block_name, release.env_id
                ))
            })?;
            if get_in::<Release>(txn, RELEASES, &release.table_key())?.is_some() {
                return Err(StoreError::Conflict(format!("release {} exists", release.id)));
            }
            block.release_seq += 1;
            block.version += 1;
            let mut release = release.clone();
            release.number = block.release_seq;
            put_in(txn, BLOCKS, &key, &block)?;
            put_in(txn, RELEASES, &release.table_key(), &release)?;
            Ok(release)
        })?;
        self.events
            .publish(StoreEvent::releases_changed(&stored.env_id, &stored.block_name));
        debug!(%key, release = %stored.id, number = stored.number, "release stored");
        Ok(stored)
    }

    async fn get_release(&self, env_id: &str, block: &str, id: &str) -> StoreResult<Release> {
        self.read_one(RELEASES, &release_key(env_id, block, id))?
            .ok_or_else(|| StoreError::NotFound(format!("release {id} of block {block}")))
    }

    async fn list_releases(&self, env_id: &str, block: &str) -> StoreResult<Vec<Release>> {
        self.require_block(env_id, block)?;
        self.releases_of(env_id, block)
    }

    async fn update_release(
        &self,
        release: &Release,
        expected_version: u64,
    ) -> StoreResult<Release> {
        let key = release.table_key();
        let stored = self.write(|txn| {
            let current: Release = get_in(txn, RELEASES, &key)?
                .ok_or_else(|| StoreError::NotFound(format!("release {}", release.id)))?;
            if current.version != expected_version {
                return Err(StoreError::Conflict(format!(
                    "release {} was modified concurrently (version {} != {})",
                    release.id, current.version, expected_version
                )));
            }
            let mut next = release.clone();
            next.number = current.number;
            next.version = current.version + 1;
            next.updated_at = epoch_secs();
            put_in(txn, RELEASES, &key, &next)?;
            Ok(next)
        })?;
        self.events
            .publish(StoreEvent::releases_changed(&stored.env_id, &stored.block_name));
        debug!(%key, state = %stored.state, version = stored.version, "release updated");
        Ok(stored)
    }

    async fn activate_release(
        &self,
        env_id: &str,
        block: &str,
        release_id: &str,
    ) -> StoreResult<Block> {
        let key = block_key(env_id, block);
        let updated = self.write(|txn| {
            let mut record: Block = get_in(txn, BLOCKS, &key)?.ok_or_else(|| {
                StoreError::NotFound(format!("block {block} in environment {env_id}"))
            })?;
            let release: Release = get_in(txn, RELEASES, &release_key(env_id, block, release_id))?
                .ok_or_else(|| StoreError::NotFound(format!("release {release_id} of block {block}")))?;
            if release.state != BuildState::Succeeded {
                return Err(StoreError::Conflict(format!(
                    "release {release_id} is {} and cannot be deployed",
                    release.state
                )));
            }
            record.active_release_id = Some(release.id.clone());
            record.build_config = release.build_config;
            record.run_config = release.run_config;
            record.suspended = false;
            record.version += 1;
            record.updated_at = epoch_secs();
            put_in(txn, BLOCKS, &key, &record)?;
            Ok(record)
        })?;
        self.events.publish(StoreEvent::releases_changed(env_id, block));
        debug!(%key, release = %release_id, "release activated");
        Ok(updated)
    }

    // ── Runtime ───────────────────────────────────────────────────

    async fn get_blocks_health_status(&self, env_id: &str) -> StoreResult<BlockStatuses> {
        self.get_environment(env_id).await?;
        let blocks = self.list_blocks(env_id).await?;
        let mut statuses = std::collections::BTreeMap::new();
        for block in blocks {
            let instances: Vec<InstanceRecord> =
                self.read_prefix(INSTANCES, &release_prefix(env_id, &block.name))?;
            let running = instances.len() as u32;
            let health = if block.suspended {
                BlockHealth::Suspended
            } else if block.active_release_id.is_none() {
                BlockHealth::Pending
            } else if running > 0 && instances.iter().all(|i| i.healthy) {
                BlockHealth::Healthy
            } else {
                BlockHealth::Unhealthy
            };
            statuses.insert(
                block.name.clone(),
                BlockStatus {
                    block_name: block.name,
                    health,
                    running_instances: running,
                    active_release_id: block.active_release_id,
                },
            );
        }
        Ok(BlockStatuses {
            env_id: env_id.to_string(),
            statuses,
        })
    }

    async fn get_blocks_metrics(
        &self,
        env_id: &str,
        block: Option<&str>,
    ) -> StoreResult<BlocksMetrics> {
        let records: Vec<BlockMetrics> = match block {
            Some(name) => {
                self.require_block(env_id, name)?;
                self.read_one(METRICS, &block_key(env_id, name))?
                    .into_iter()
                    .collect()
            }
            None => {
                self.get_environment(env_id).await?;
                self.read_prefix(METRICS, &format!("{env_id}/"))?
            }
        };
        Ok(BlocksMetrics {
            env_id: env_id.to_string(),
            metrics: records
                .into_iter()
                .map(|m| (m.block_name.clone(), m))
                .collect(),
        })
    }

    async fn kill_block_instance(&self, env_id: &str, instance_id: &str) -> StoreResult<()> {
        let env_prefix = format!("{env_id}/");
        let suffix = format!(":{instance_id}");
        let removed = self.write(|txn| {
            remove_matching(txn, INSTANCES, |k| {
                k.starts_with(&env_prefix) && k.ends_with(&suffix)
            })
        })?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!(
                "instance {instance_id} in environment {env_id}"
            )));
        }
        debug!(env = %env_id, instance = %instance_id, "instance killed");
        Ok(())
    }

    // ── Routing ───────────────────────────────────────────────────

    async fn set_external_url(
        &self,
        env_id: &str,
        block: &str,
        url: Option<String>,
    ) -> StoreResult<Block> {
        let key = block_key(env_id, block);
        self.write(|txn| {
            let mut record: Block = get_in(txn, BLOCKS, &key)?.ok_or_else(|| {
                StoreError::NotFound(format!("block {block} in environment {env_id}"))
            })?;
            record.external_url = url;
            record.version += 1;
            record.updated_at = epoch_secs();
            put_in(txn, BLOCKS, &key, &record)?;
            Ok(record)
        })
    }

    async fn create_custom_domain(&self, domain: &CustomDomain) -> StoreResult<()> {
        self.write(|txn| {
            if get_in::<Block>(txn, BLOCKS, &block_key(&domain.env_id, &domain.block_name))?
                .is_none()
            {
                return Err(StoreError::NotFound(format!(
                    "block {} in environment {}",
                    domain.block_name, domain.env_id
                )));
            }
            match get_in::<CustomDomain>(txn, DOMAINS, &domain.domain)? {
                Some(existing)
                    if existing.env_id == domain.env_id
                        && existing.block_name == domain.block_name =>
                {
                    Ok(())
                }
                Some(existing) => Err(StoreError::Conflict(format!(
                    "domain {} is routed to block {} in environment {}",
                    domain.domain, existing.block_name, existing.env_id
                ))),
                None => put_in(txn, DOMAINS, &domain.domain, domain),
            }
        })
    }

    async fn delete_custom_domain(
        &self,
        env_id: &str,
        block: &str,
        domain: &str,
    ) -> StoreResult<()> {
        self.write(|txn| match get_in::<CustomDomain>(txn, DOMAINS, domain)? {
            Some(existing) if existing.env_id == env_id && existing.block_name == block => {
                remove_in(txn, DOMAINS, domain).map(|_| ())
            }
            _ => Err(StoreError::NotFound(format!(
                "domain {domain} on block {block}"
            ))),
        })
    }

    async fn list_custom_domains(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Vec<CustomDomain>> {
        let all: Vec<CustomDomain> = self.read_prefix(DOMAINS, "")?;
        Ok(all
            .into_iter()
            .filter(|d| d.env_id == env_id && d.block_name == block)
            .collect())
    }

    // ── Teleport ──────────────────────────────────────────────────

    async fn get_teleport(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Option<TeleportServiceData>> {
        self.read_one(TELEPORTS, &block_key(env_id, block))
    }

    async fn claim_teleport(
        &self,
        session: &TeleportServiceData,
        now: u64,
    ) -> StoreResult<(TeleportServiceData, bool)> {
        let key = session.table_key();
        self.write(|txn| {
            if get_in::<Block>(txn, BLOCKS, &key)?.is_none() {
                return Err(StoreError::NotFound(format!(
                    "block {} in environment {}",
                    session.block_name, session.env_id
                )));
            }
            if let Some(existing) = get_in::<TeleportServiceData>(txn, TELEPORTS, &key)? {
                if !existing.is_expired(now) {
                    return Ok((existing, false));
                }
            }
            put_in(txn, TELEPORTS, &key, session)?;
            Ok((session.clone(), true))
        })
    }

    async fn delete_teleport(
        &self,
        env_id: &str,
        block: &str,
        session_id: Option<&str>,
    ) -> StoreResult<bool> {
        let key = block_key(env_id, block);
        self.write(|txn| {
            let Some(existing) = get_in::<TeleportServiceData>(txn, TELEPORTS, &key)? else {
                return Ok(false);
            };
            if session_id.is_some_and(|id| id != existing.session_id) {
                return Ok(false);
            }
            remove_in(txn, TELEPORTS, &key)
        })
    }

    // ── Watches ───────────────────────────────────────────────────

    async fn watch_releases_status(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<ReleasesStatus, StoreError>> {
        // Subscribe before the first read so no change slips in between.
        let mut events = self.events.subscribe();
        let initial = self.releases_status(env_id, block)?;
        let (publisher, subscription) = subscription(WATCH_BUFFER);
        let store = self.clone();
        let env_id = env_id.to_string();
        let block = block.to_string();

        tokio::spawn(async move {
            if publisher.send(initial).await.is_err() {
                return;
            }
            loop {
                let event = tokio::select! {
                    biased;
                    _ = publisher.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(StoreEvent::ReleasesChanged {
                        env_id: ref e,
                        block_name: ref b,
                    }) if *e == env_id && *b == block => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(env = %env_id, %block, skipped, "release watcher lagged, resyncing");
                    }
                    Err(RecvError::Closed) => break,
                }
                match store.releases_status(&env_id, &block) {
                    Ok(status) => {
                        if publisher.send(status).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        publisher.fail(err).await;
                        return;
                    }
                }
            }
            debug!(env = %env_id, %block, "release watcher stopped");
        });

        Ok(subscription)
    }

    async fn watch_jobs_status(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<JobStatus, StoreError>> {
        self.require_block(env_id, block)?;
        Ok(self.forward_events(env_id, block, |event| match event {
            StoreEvent::Job(status) => Some(status),
            _ => None,
        }))
    }

    async fn watch_console_logs(
        &self,
        env_id: &str,
        block: &str,
    ) -> StoreResult<Subscription<ConsoleLog, StoreError>> {
        self.require_block(env_id, block)?;
        Ok(self.forward_events(env_id, block, |event| match event {
            StoreEvent::Console(log) => Some(log),
            _ => None,
        }))
    }
}
