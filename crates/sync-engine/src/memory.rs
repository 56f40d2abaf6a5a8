//! In-memory database
//!
//! A document store plus an operation log with knobs to simulate log
//! truncation, failover rollbacks, connection loss, a log that never goes
//! quiet and writes racing a bulk load. Used by tests.

use async_trait::async_trait;
use futures::stream;
use search_sync_core::prelude::*;
use search_sync_core::{document_key, DocumentStream};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::batch::project;

const LOG_DATABASE: &str = "local";
const FIRST_SECOND: u32 = 1_700_000_000;

#[derive(Debug)]
struct State {
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    log: Vec<LogEntry>,
    log_collections: Vec<String>,
    next_counter: u32,
    /// Highest sequence removed by truncation
    truncated_through: Option<Sequence>,
    /// Bumped on every connection loss; cursors from older epochs are dead
    epoch: u64,
    offline: bool,
    failing_finds: usize,
    /// Log a noop ahead of every drain
    busy: bool,
    /// Hold drains until released
    stalled: bool,
    /// Inserted right after the next full scan has been read
    racing: Vec<(String, Value)>,
}

/// Shared handle to an in-memory database
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Database with a replica-set style log
    pub fn new() -> Self {
        Self::with_log_collections([LogMode::ReplicaSet.collection()])
    }

    pub fn with_log_collections(collections: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                collections: BTreeMap::new(),
                log: Vec::new(),
                log_collections: collections.into_iter().map(Into::into).collect(),
                next_counter: 1,
                truncated_through: None,
                epoch: 0,
                offline: false,
                failing_finds: 0,
                busy: false,
                stalled: false,
                racing: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(state: &mut State, make: impl FnOnce(Sequence) -> LogEntry) -> Sequence {
        let sequence = Sequence::new(FIRST_SECOND, state.next_counter);
        state.next_counter += 1;
        state.log.push(make(sequence));
        sequence
    }

    fn key_of(document: &Value) -> String {
        document.get("_id").map(document_key).unwrap_or_default()
    }

    /// Store a document without logging it
    pub fn put(&self, namespace: &str, document: Value) {
        let key = Self::key_of(&document);
        self.state()
            .collections
            .entry(namespace.to_string())
            .or_default()
            .insert(key, document);
    }

    pub fn insert(&self, namespace: &str, document: Value) -> Sequence {
        Self::insert_locked(&mut self.state(), namespace, document)
    }

    fn insert_locked(state: &mut State, namespace: &str, document: Value) -> Sequence {
        let key = Self::key_of(&document);
        state
            .collections
            .entry(namespace.to_string())
            .or_default()
            .insert(key, document.clone());
        Self::append(state, |seq| LogEntry::insert(namespace, document, seq))
    }

    /// Replace a document and log an update carrying only its id
    pub fn update(&self, namespace: &str, document: Value) -> Sequence {
        let mut state = self.state();
        let id = document.get("_id").cloned().unwrap_or(Value::Null);
        let key = Self::key_of(&document);
        state
            .collections
            .entry(namespace.to_string())
            .or_default()
            .insert(key, document);
        Self::append(&mut state, |seq| LogEntry::update(namespace, id, seq))
    }

    pub fn delete(&self, namespace: &str, id: Value) -> Sequence {
        let mut state = self.state();
        if let Some(collection) = state.collections.get_mut(namespace) {
            collection.remove(&document_key(&id));
        }
        Self::append(&mut state, |seq| LogEntry::delete(namespace, id, seq))
    }

    pub fn noop(&self) -> Sequence {
        Self::append(&mut self.state(), LogEntry::noop)
    }

    /// Log a chunk migration entry without changing any document
    pub fn migrate(&self, operation: Operation, namespace: &str, document: Value) -> Sequence {
        Self::append(&mut self.state(), |seq| {
            LogEntry::new(operation, namespace, document, seq)
        })
    }

    /// Drop every log entry up to and including `sequence`
    pub fn truncate_through(&self, sequence: Sequence) {
        let mut state = self.state();
        state.log.retain(|e| e.sequence > sequence);
        state.truncated_through = Some(
            state
                .truncated_through
                .map_or(sequence, |t| t.max(sequence)),
        );
    }

    /// Simulate a failover to a node that never saw entries after
    /// `keep_through`. Documents are left untouched.
    pub fn failover(&self, keep_through: Sequence) {
        let mut state = self.state();
        state.log.retain(|e| e.sequence <= keep_through);
        state.epoch += 1;
    }

    /// Make every engine-side call fail while offline
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state();
        if offline && !state.offline {
            state.epoch += 1;
        }
        state.offline = offline;
    }

    /// Make the next `n` find calls fail
    pub fn fail_next_finds(&self, n: usize) {
        self.state().failing_finds = n;
    }

    /// Keep writing to the log so that no drain ever comes back empty
    pub fn set_busy(&self, busy: bool) {
        self.state().busy = busy;
    }

    /// Make drains wait until released
    pub fn stall_drains(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    fn is_stalled(&self) -> bool {
        self.state().stalled
    }

    /// Insert `documents` as soon as the next full scan of any namespace
    /// has been read, so they are missing from that scan
    pub fn insert_after_next_scan(
        &self,
        namespace: &str,
        documents: impl IntoIterator<Item = Value>,
    ) {
        self.state()
            .racing
            .extend(documents.into_iter().map(|d| (namespace.to_string(), d)));
    }

    fn online(state: &State) -> Result<()> {
        if state.offline {
            return Err(SyncError::database("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDatabase {
    async fn find(
        &self,
        namespace: &str,
        ids: Option<&[Value]>,
        fields: Option<&[String]>,
    ) -> Result<DocumentStream> {
        let mut state = self.state();
        Self::online(&state)?;
        if state.failing_finds > 0 {
            state.failing_finds -= 1;
            return Err(SyncError::database(format!("find on {namespace} failed")));
        }

        let documents: Vec<Value> = match state.collections.get(namespace) {
            None => Vec::new(),
            Some(collection) => match ids {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| collection.get(&document_key(id)))
                    .map(|doc| project(doc, fields))
                    .collect(),
                None => collection.values().map(|doc| project(doc, fields)).collect(),
            },
        };
        if ids.is_none() {
            for (namespace, document) in std::mem::take(&mut state.racing) {
                Self::insert_locked(&mut state, &namespace, document);
            }
        }
        Ok(Box::pin(stream::iter(documents.into_iter().map(Ok))))
    }

    async fn count(&self, namespace: &str) -> Result<u64> {
        let state = self.state();
        Self::online(&state)?;
        Ok(state.collections.get(namespace).map_or(0, |c| c.len() as u64))
    }
}

#[async_trait]
impl OperationLog for MemoryDatabase {
    fn database(&self) -> &str {
        LOG_DATABASE
    }

    async fn log_collections(&self) -> Result<Vec<String>> {
        let state = self.state();
        Self::online(&state)?;
        Ok(state.log_collections.clone())
    }

    async fn latest(&self, _source: &LogSource) -> Result<Option<Sequence>> {
        let state = self.state();
        Self::online(&state)?;
        Ok(state
            .log
            .last()
            .map(|e| e.sequence)
            .or(state.truncated_through))
    }

    async fn contains(&self, _source: &LogSource, sequence: Sequence) -> Result<bool> {
        let state = self.state();
        Self::online(&state)?;
        Ok(state.log.iter().any(|e| e.sequence == sequence))
    }

    async fn tail(&self, source: &LogSource, after: Option<Sequence>) -> Result<Box<dyn LogCursor>> {
        let state = self.state();
        Self::online(&state)?;
        if !state.log_collections.contains(&source.collection) {
            return Err(SyncError::database(format!("no collection {source}")));
        }
        Ok(Box::new(MemoryCursor {
            database: self.clone(),
            source: source.to_string(),
            position: after,
            epoch: state.epoch,
        }))
    }
}

struct MemoryCursor {
    database: MemoryDatabase,
    source: String,
    position: Option<Sequence>,
    epoch: u64,
}

#[async_trait]
impl LogCursor for MemoryCursor {
    async fn drain(&mut self) -> Result<Vec<LogEntry>> {
        while self.database.is_stalled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut state = self.database.state();
        MemoryDatabase::online(&state)?;
        if state.epoch != self.epoch {
            return Err(SyncError::database("cursor lost its connection"));
        }
        if let Some(truncated) = state.truncated_through {
            if self.position.map_or(true, |p| truncated > p) {
                return Err(SyncError::stale_cursor(
                    self.source.clone(),
                    format!("log truncated through {truncated}"),
                ));
            }
        }

        if state.busy {
            MemoryDatabase::append(&mut state, LogEntry::noop);
        }
        let entries: Vec<LogEntry> = state
            .log
            .iter()
            .filter(|e| self.position.map_or(true, |p| e.sequence > p))
            .cloned()
            .collect();
        if let Some(last) = entries.last() {
            self.position = Some(last.sequence);
        }
        Ok(entries)
    }
}

/// Connector over in-memory databases, optionally sharded
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    routed: MemoryDatabase,
    shards: BTreeMap<String, MemoryDatabase>,
}

impl MemoryConnector {
    pub fn new(database: MemoryDatabase) -> Self {
        Self {
            routed: database,
            shards: BTreeMap::new(),
        }
    }

    /// Shard logs and partitions are read per shard; refetches go
    /// through `routed`
    pub fn sharded(
        routed: MemoryDatabase,
        shards: impl IntoIterator<Item = (String, MemoryDatabase)>,
    ) -> Self {
        Self {
            routed,
            shards: shards.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DatabaseConnector for MemoryConnector {
    async fn shards(&self) -> Result<Vec<String>> {
        Ok(self.shards.keys().cloned().collect())
    }

    async fn connect(&self, shard: Option<&str>) -> Result<Database> {
        let routed = Arc::new(self.routed.clone());
        match shard {
            None => Ok(Database::new(routed.clone(), routed)),
            Some(id) => {
                let shard = self
                    .shards
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SyncError::config(format!("unknown shard {id}")))?;
                let shard = Arc::new(shard);
                Ok(Database::new(routed, shard.clone()).with_snapshot(shard))
            }
        }
    }
}

/// Document with the given id and fields
pub fn document(id: impl Into<Value>, fields: Value) -> Value {
    let mut doc = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    doc.insert("_id".to_string(), id.into());
    Value::Object(doc)
}
