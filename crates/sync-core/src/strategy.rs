//! Collaborator traits for the search synchronizer
//!
//! The engine never talks to a concrete database, search engine or
//! configuration store. Each dependency is a narrow trait with one or more
//! implementations that can be swapped at construction time.
//!
//! ```text
//!  DatabaseConnector ──► Database { DocumentStore, OperationLog ──► LogCursor }
//!  IndexConnector    ──► IndexClient
//!  RecordStore       ──► ConfigSource (grouped TargetConfig stream)
//! ```

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::message::{IndexedDocument, LogEntry, Sequence};
use crate::target::{ConfigRecord, RecordUpdate, ReplicationWaitPolicy, TargetConfig};

/// Type alias for boxed async streams of source documents
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Type alias for boxed async streams of configuration records
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<ConfigRecord>> + Send>>;

/// Type alias for boxed async streams of grouped targets
pub type TargetStream = Pin<Box<dyn Stream<Item = Result<TargetConfig>> + Send>>;

// ============================================================================
// Search index
// ============================================================================

/// Mutating and query capabilities of a search index
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Add or overwrite documents
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()>;

    /// Physically remove a document
    async fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Make previous writes durable and visible
    async fn commit(&self) -> Result<()>;

    /// Ids of tombstones whose deletion sequence precedes `cutoff`
    async fn tombstones_before(&self, cutoff: Sequence, limit: usize) -> Result<Vec<String>>;

    /// Health check
    async fn ping(&self) -> Result<()>;
}

/// Opens index clients for endpoints
pub trait IndexConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexClient>>;
}

// ============================================================================
// Source database
// ============================================================================

/// Query capability over current documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents of a namespace, optionally restricted to an id set and
    /// projected onto a field allowlist (`_id` is always returned)
    async fn find(
        &self,
        namespace: &str,
        ids: Option<&[Value]>,
        fields: Option<&[String]>,
    ) -> Result<DocumentStream>;

    /// Estimated number of documents in a namespace
    async fn count(&self, namespace: &str) -> Result<u64>;
}

/// Which operation log collection to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// `oplog.rs`
    ReplicaSet,
    /// `oplog.$main`
    MasterSlave,
}

impl LogMode {
    pub fn collection(&self) -> &'static str {
        match self {
            Self::ReplicaSet => "oplog.rs",
            Self::MasterSlave => "oplog.$main",
        }
    }

    pub fn all() -> [LogMode; 2] {
        [Self::ReplicaSet, Self::MasterSlave]
    }
}

/// Resolved operation log location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogSource {
    pub database: String,
    pub collection: String,
}

impl LogSource {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Tailing capability over the append-only operation log
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Database holding the log collections
    fn database(&self) -> &str;

    /// Names of candidate log collections that exist
    async fn log_collections(&self) -> Result<Vec<String>>;

    /// Sequence of the newest entry, `None` for an empty log
    async fn latest(&self, source: &LogSource) -> Result<Option<Sequence>>;

    /// Whether an entry with this exact sequence is still in the log
    async fn contains(&self, source: &LogSource, sequence: Sequence) -> Result<bool>;

    /// Open a cursor returning entries strictly after `after`
    /// (from the beginning when `None`)
    async fn tail(&self, source: &LogSource, after: Option<Sequence>) -> Result<Box<dyn LogCursor>>;
}

/// Incremental reader over the operation log
#[async_trait]
pub trait LogCursor: Send {
    /// Return entries currently available without waiting for new ones.
    ///
    /// A drain is bounded in time and size; entries left over are returned
    /// by the next call.
    ///
    /// Fails with `StaleCursor` when the position fell out of the retained
    /// window and with a database error when the connection dropped.
    async fn drain(&mut self) -> Result<Vec<LogEntry>>;
}

/// Capabilities an engine needs from the source database
#[derive(Clone)]
pub struct Database {
    /// Routed view used for refetches
    pub documents: Arc<dyn DocumentStore>,
    /// Documents this engine is authoritative for, read by bulk loads.
    /// The shard's own data on sharded deployments.
    pub snapshot: Arc<dyn DocumentStore>,
    /// Log local to the node (or shard) this engine is authoritative for
    pub log: Arc<dyn OperationLog>,
}

impl Database {
    /// Unpartitioned access where bulk loads read the routed view
    pub fn new(documents: Arc<dyn DocumentStore>, log: Arc<dyn OperationLog>) -> Self {
        Self {
            snapshot: documents.clone(),
            documents,
            log,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Arc<dyn DocumentStore>) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Topology-aware database access
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Shard ids of a sharded deployment, empty otherwise
    async fn shards(&self) -> Result<Vec<String>>;

    /// Database handle scoped to one shard, or to the whole deployment
    async fn connect(&self, shard: Option<&str>) -> Result<Database>;
}

// ============================================================================
// Configuration store
// ============================================================================

/// Backing store for configuration records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records ordered by endpoint then namespace
    async fn records(&self) -> Result<RecordStream>;

    /// Apply `update` to existing records of `endpoint` (all of them, or the
    /// one for `namespace`). Never creates records. Returns how many matched.
    async fn update(
        &self,
        endpoint: &str,
        namespace: Option<&str>,
        shard: Option<&str>,
        update: RecordUpdate,
        policy: &ReplicationWaitPolicy,
    ) -> Result<u64>;
}

/// Source of desired targets, one group per endpoint
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn targets(&self) -> Result<TargetStream>;
}
