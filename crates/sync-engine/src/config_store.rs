//! Configuration store access
//!
//! Record stores hold one [`ConfigRecord`] per monitored namespace per
//! endpoint. [`ConfigStoreReader`] groups them into [`TargetConfig`]s and
//! [`ConfigWriter`] persists an engine's progress back into them.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use search_sync_core::prelude::*;
use search_sync_core::{RecordStream, TargetStream};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;
use tracing::{debug, info, warn};

fn sort_records(records: &mut [ConfigRecord]) {
    records.sort_by(|a, b| {
        (a.endpoint.as_str(), a.namespace.as_str()).cmp(&(b.endpoint.as_str(), b.namespace.as_str()))
    });
}

/// Apply `update` to the matching records, returning how many matched
fn apply_update(
    records: &mut [ConfigRecord],
    endpoint: &str,
    namespace: Option<&str>,
    shard: Option<&str>,
    update: RecordUpdate,
) -> u64 {
    let mut matched = 0;
    for record in records
        .iter_mut()
        .filter(|r| r.endpoint == endpoint && namespace.map_or(true, |ns| r.namespace == ns))
    {
        record.apply(&update, shard);
        matched += 1;
    }
    matched
}

fn upsert_record(records: &mut Vec<ConfigRecord>, record: ConfigRecord) {
    match records
        .iter_mut()
        .find(|r| r.endpoint == record.endpoint && r.namespace == record.namespace)
    {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
    sort_records(records);
}

// ============================================================================
// Memory store (for testing)
// ============================================================================

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: Mutex<Vec<ConfigRecord>>,
    unavailable: Mutex<bool>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ConfigRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ConfigRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the record for `(endpoint, namespace)`
    pub fn upsert(&self, record: ConfigRecord) {
        upsert_record(&mut self.lock(), record);
    }

    pub fn remove(&self, endpoint: &str, namespace: &str) -> bool {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| !(r.endpoint == endpoint && r.namespace == namespace));
        records.len() != before
    }

    pub fn snapshot(&self) -> Vec<ConfigRecord> {
        self.lock().clone()
    }

    pub fn record(&self, endpoint: &str, namespace: &str) -> Option<ConfigRecord> {
        self.lock()
            .iter()
            .find(|r| r.endpoint == endpoint && r.namespace == namespace)
            .cloned()
    }

    /// Make reads and writes fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = unavailable;
    }

    fn check(&self) -> Result<()> {
        if *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(SyncError::config_store("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryConfigStore {
    async fn records(&self) -> Result<RecordStream> {
        self.check()?;
        let records = self.snapshot();
        Ok(Box::pin(stream::iter(records.into_iter().map(Ok))))
    }

    async fn update(
        &self,
        endpoint: &str,
        namespace: Option<&str>,
        shard: Option<&str>,
        update: RecordUpdate,
        _policy: &ReplicationWaitPolicy,
    ) -> Result<u64> {
        self.check()?;
        Ok(apply_update(
            &mut self.lock(),
            endpoint,
            namespace,
            shard,
            update,
        ))
    }
}

// ============================================================================
// File store
// ============================================================================

/// Record store backed by a JSON array on disk.
///
/// Every update rewrites the file atomically via a temp file.
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<ConfigRecord>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => {
                let mut records: Vec<ConfigRecord> =
                    serde_json::from_str(&content).map_err(|e| {
                        SyncError::config_store_with_source(
                            format!("Failed to parse {}", self.path.display()),
                            e,
                        )
                    })?;
                sort_records(&mut records);
                Ok(records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No config file, no targets");
                Ok(Vec::new())
            }
            Err(e) => Err(SyncError::config_store_with_source(
                "Failed to read config file",
                e,
            )),
        }
    }

    async fn save(&self, records: &[ConfigRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::config_store_with_source("Failed to create config directory", e)
            })?;
        }

        let content = serde_json::to_string_pretty(records)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| SyncError::config_store_with_source("Failed to write config file", e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| SyncError::config_store_with_source("Failed to rename config file", e))?;
        Ok(())
    }

    /// Insert or replace the record for `(endpoint, namespace)`
    pub async fn upsert(&self, record: ConfigRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        info!(endpoint = %record.endpoint, namespace = %record.namespace, "Saving config record");
        upsert_record(&mut records, record);
        self.save(&records).await
    }

    pub async fn remove(&self, endpoint: &str, namespace: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let before = records.len();
        records.retain(|r| !(r.endpoint == endpoint && r.namespace == namespace));
        if records.len() == before {
            return Ok(false);
        }
        self.save(&records).await?;
        Ok(true)
    }
}

#[async_trait]
impl RecordStore for FileConfigStore {
    async fn records(&self) -> Result<RecordStream> {
        let records = self.load().await?;
        Ok(Box::pin(stream::iter(records.into_iter().map(Ok))))
    }

    async fn update(
        &self,
        endpoint: &str,
        namespace: Option<&str>,
        shard: Option<&str>,
        update: RecordUpdate,
        _policy: &ReplicationWaitPolicy,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let matched = apply_update(&mut records, endpoint, namespace, shard, update);
        if matched > 0 {
            self.save(&records).await?;
        }
        Ok(matched)
    }
}

// ============================================================================
// Reader
// ============================================================================

struct Grouping {
    records: RecordStream,
    pending: Option<ConfigRecord>,
    /// Endpoints with an unreadable record, reported once their records
    /// have been skipped
    unreadable: VecDeque<SyncError>,
    /// Read failure ending the stream
    failure: Option<SyncError>,
    done: bool,
}

fn malformed_endpoint(error: &SyncError) -> &str {
    match error {
        SyncError::MalformedRecord { endpoint, .. } => endpoint,
        _ => "",
    }
}

impl Grouping {
    /// Drop the remaining records of an endpoint with an unreadable record
    async fn skip_endpoint(&mut self, error: SyncError) {
        let mut endpoint = malformed_endpoint(&error).to_string();
        self.unreadable.push_back(error);
        loop {
            match self.records.next().await {
                Some(Ok(record)) if record.endpoint == endpoint => {}
                Some(Ok(record)) => {
                    self.pending = Some(record);
                    return;
                }
                Some(Err(e @ SyncError::MalformedRecord { .. })) => {
                    if malformed_endpoint(&e) != endpoint {
                        endpoint = malformed_endpoint(&e).to_string();
                        self.unreadable.push_back(e);
                    }
                }
                Some(Err(e)) => {
                    self.failure = Some(e);
                    self.done = true;
                    return;
                }
                None => {
                    self.done = true;
                    return;
                }
            }
        }
    }

    async fn next_group(&mut self) -> Option<Result<TargetConfig>> {
        loop {
            if let Some(e) = self.unreadable.pop_front() {
                return Some(Err(e));
            }
            if let Some(e) = self.failure.take() {
                return Some(Err(e));
            }

            let mut group: Vec<ConfigRecord> = self.pending.take().into_iter().collect();
            while !self.done {
                match self.records.next().await {
                    Some(Ok(record)) => {
                        if group.first().is_some_and(|f| f.endpoint != record.endpoint) {
                            self.pending = Some(record);
                            break;
                        }
                        group.push(record);
                    }
                    Some(Err(e @ SyncError::MalformedRecord { .. })) => {
                        let tainted = group
                            .first()
                            .map_or(true, |f| f.endpoint == malformed_endpoint(&e));
                        self.skip_endpoint(e).await;
                        if tainted {
                            group.clear();
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => self.done = true,
                }
            }

            if !group.is_empty() {
                return Some(TargetConfig::from_records(&group, None));
            }
            let drained = self.unreadable.is_empty() && self.failure.is_none();
            if self.done && self.pending.is_none() && drained {
                return None;
            }
        }
    }
}

/// Groups a store's sorted record stream into one target per endpoint.
///
/// Only the records of the group being built are held in memory.
pub struct ConfigStoreReader {
    store: Arc<dyn RecordStore>,
}

impl ConfigStoreReader {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Call `visit` once per endpoint group, in endpoint order
    pub async fn for_each_target<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Result<TargetConfig>) + Send,
    {
        let mut targets = self.targets().await?;
        while let Some(target) = targets.next().await {
            visit(target);
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for ConfigStoreReader {
    async fn targets(&self) -> Result<TargetStream> {
        let records = self.store.records().await?;
        let state = Grouping {
            records,
            pending: None,
            unreadable: VecDeque::new(),
            failure: None,
            done: false,
        };

        let groups = stream::unfold(state, |mut state| async move {
            let group = state.next_group().await?;
            Some((group, state))
        });

        Ok(Box::pin(groups))
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Persists one engine's progress into its target's records
#[derive(Clone)]
pub struct ConfigWriter {
    store: Arc<dyn RecordStore>,
    endpoint: String,
    shard: Option<String>,
    policy: ReplicationWaitPolicy,
    unsaved: UnsavedProgress,
}

/// Progress recorded but not yet persisted
#[derive(Debug, Clone, Default)]
struct UnsavedProgress {
    namespaces: BTreeMap<String, Sequence>,
    commit: Option<Sequence>,
}

impl ConfigWriter {
    pub fn new(store: Arc<dyn RecordStore>, target: &TargetConfig) -> Self {
        Self {
            store,
            endpoint: target.endpoint.clone(),
            shard: target.shard_id.clone(),
            policy: target.replication.clone(),
            unsaved: UnsavedProgress::default(),
        }
    }

    async fn write(&self, namespace: Option<&str>, update: RecordUpdate) -> Result<u64> {
        self.store
            .update(
                &self.endpoint,
                namespace,
                self.shard.as_deref(),
                update,
                &self.policy,
            )
            .await
    }

    /// Record the last applied sequence of a namespace.
    ///
    /// A namespace removed from the store is left removed.
    pub async fn update_namespace_progress(&self, namespace: &str, sequence: Sequence) -> Result<()> {
        let matched = self
            .write(Some(namespace), RecordUpdate::NamespaceProgress(sequence))
            .await?;
        if matched == 0 {
            debug!(endpoint = %self.endpoint, namespace, "Namespace no longer configured, progress dropped");
        }
        Ok(())
    }

    pub async fn update_commit_timestamp(&self, sequence: Sequence) -> Result<()> {
        self.write(None, RecordUpdate::CommitTimestamp(sequence))
            .await
            .map(|_| ())
    }

    pub async fn reset_dump_count(&self) -> Result<()> {
        self.write(None, RecordUpdate::ResetDumpCount).await.map(|_| ())
    }

    pub async fn increment_dump_count(&self, count: u64) -> Result<()> {
        self.write(None, RecordUpdate::IncrementDumpCount(count))
            .await
            .map(|_| ())
    }

    pub async fn update_total_dump_count(&self, total: u64) -> Result<()> {
        self.write(None, RecordUpdate::TotalDumpCount(total))
            .await
            .map(|_| ())
    }

    /// Queue a namespace's progress for the next [`flush`](Self::flush)
    pub fn record_namespace_progress(&mut self, namespace: &str, sequence: Sequence) {
        self.unsaved.namespaces.insert(namespace.to_string(), sequence);
    }

    /// Queue the commit timestamp for the next [`flush`](Self::flush)
    pub fn record_commit_timestamp(&mut self, sequence: Sequence) {
        self.unsaved.commit = Some(sequence);
    }

    pub fn has_unsaved(&self) -> bool {
        !self.unsaved.namespaces.is_empty() || self.unsaved.commit.is_some()
    }

    /// Persist queued progress. Whatever fails stays queued.
    pub async fn flush(&mut self) -> Result<()> {
        while let Some((namespace, sequence)) = self
            .unsaved
            .namespaces
            .first_key_value()
            .map(|(ns, seq)| (ns.clone(), *seq))
        {
            self.update_namespace_progress(&namespace, sequence).await?;
            self.unsaved.namespaces.remove(&namespace);
        }
        if let Some(sequence) = self.unsaved.commit {
            self.update_commit_timestamp(sequence).await?;
            self.unsaved.commit = None;
        }
        Ok(())
    }

    /// Log and swallow a failed counter write
    pub fn warn_on_error(&self, operation: &'static str, result: Result<()>) {
        if let Err(e) = result {
            warn!(endpoint = %self.endpoint, operation, error = %e, "Failed to persist progress");
        }
    }
}
