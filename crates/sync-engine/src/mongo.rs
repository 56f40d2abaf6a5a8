//! MongoDB backends
//!
//! - [`MongoConnector`]: routed refetches plus per-shard snapshots and log tailing
//! - [`MongoConfigStore`]: configuration records in a collection, written
//!   with the target's write concern
//!
//! Document identifiers travel as relaxed extended JSON (`{"$oid": ".."}`)
//! so they can be turned back into BSON for refetches. Other values are
//! converted to plain JSON scalars suitable for indexing.

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, Bson, Document, Timestamp};
use mongodb::error::ErrorKind;
use mongodb::options::{
    Acknowledgment, CollectionOptions, CursorType, FindOneOptions, FindOptions, WriteConcern,
};
use mongodb::{Client, Collection, Cursor};
use search_sync_core::prelude::*;
use search_sync_core::{DatabaseConfig, DocumentStream, RecordStream};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Server error code for a tailable cursor overtaken by the capped log
const CAPPED_POSITION_LOST: i32 = 136;

const LOG_DATABASE: &str = "local";

fn database_error(context: impl Into<String>) -> impl FnOnce(mongodb::error::Error) -> SyncError {
    let context = context.into();
    move |e| SyncError::database_with_source(format!("{context}: {e}"), e)
}

fn server_code(error: &mongodb::error::Error) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

/// Split `database.collection` at the first dot
fn split_namespace(namespace: &str) -> Result<(&str, &str)> {
    namespace
        .split_once('.')
        .filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
        .ok_or_else(|| SyncError::config(format!("invalid namespace {namespace:?}")))
}

fn to_timestamp(sequence: Sequence) -> Timestamp {
    Timestamp {
        time: sequence.seconds,
        increment: sequence.counter,
    }
}

fn to_sequence(timestamp: Timestamp) -> Sequence {
    Sequence::new(timestamp.time, timestamp.increment)
}

/// Turn a `config.shards` host string (`rs0/h1:27017,h2:27017`) into a URI
fn shard_uri(host: &str) -> String {
    match host.split_once('/') {
        Some((replica_set, hosts)) => format!("mongodb://{hosts}/?replicaSet={replica_set}"),
        None => format!("mongodb://{host}"),
    }
}

/// Convert a BSON value into index-friendly JSON
fn to_index_json(value: Bson) -> Value {
    match value {
        Bson::Document(document) => document_to_json(document),
        Bson::Array(items) => Value::Array(items.into_iter().map(to_index_json).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => Value::String(s),
            Err(_) => Value::from(dt.timestamp_millis()),
        },
        other => other.into_relaxed_extjson(),
    }
}

/// Convert a document, keeping `_id` as extended JSON
fn document_to_json(document: Document) -> Value {
    let mut map = Map::with_capacity(document.len());
    for (key, value) in document {
        let value = if key == "_id" {
            value.into_relaxed_extjson()
        } else {
            to_index_json(value)
        };
        map.insert(key, value);
    }
    Value::Object(map)
}

fn id_to_bson(id: &Value) -> Result<Bson> {
    Bson::try_from(id.clone()).map_err(|e| SyncError::Serialization {
        message: format!("document id {id} is not valid extended JSON: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Parse one raw log document
fn parse_entry(mut raw: Document) -> Result<LogEntry> {
    let sequence = match raw.get("ts") {
        Some(Bson::Timestamp(ts)) => to_sequence(*ts),
        _ => return Err(SyncError::database("log entry without a ts field")),
    };
    let namespace = raw.get_str("ns").unwrap_or_default().to_string();
    let migrated = raw.get_bool("fromMigrate").unwrap_or(false);
    let object = raw.remove("o").unwrap_or(Bson::Null);

    let entry = match (raw.get_str("op").unwrap_or_default(), migrated) {
        ("i", false) => LogEntry::insert(namespace, to_json_object(object), sequence),
        ("i", true) => {
            LogEntry::new(Operation::MigrationInsert, namespace, to_json_object(object), sequence)
        }
        ("u", _) => {
            let selector = raw.remove("o2").unwrap_or(Bson::Null);
            let id = selector_id(selector);
            LogEntry::update(namespace, id, sequence)
        }
        ("d", false) => LogEntry::delete(namespace, selector_id(object), sequence),
        ("d", true) => LogEntry::new(
            Operation::MigrationDelete,
            namespace,
            to_json_object(object),
            sequence,
        ),
        // Commands and no-ops never touch a monitored document
        _ => LogEntry::noop(sequence),
    };
    Ok(entry)
}

fn to_json_object(value: Bson) -> Value {
    match value {
        Bson::Document(document) => document_to_json(document),
        other => to_index_json(other),
    }
}

fn selector_id(selector: Bson) -> Value {
    match selector {
        Bson::Document(mut document) => document
            .remove("_id")
            .map(Bson::into_relaxed_extjson)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

// ============================================================================
// Database connector
// ============================================================================

/// Connects to a replica set, a master/slave pair or a sharded cluster
#[derive(Clone)]
pub struct MongoConnector {
    client: Client,
    tail_await: Duration,
    tail_batch_size: usize,
}

impl MongoConnector {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(database_error("Failed to create database client"))?;
        info!(uri = %config.uri, "Connected to source database");
        Ok(Self {
            client,
            tail_await: config.tail_await,
            tail_batch_size: config.tail_batch_size.max(1),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn shard_host(&self, shard: &str) -> Result<String> {
        let shards = self.client.database("config").collection::<Document>("shards");
        let entry = shards
            .find_one(doc! { "_id": shard }, None)
            .await
            .map_err(database_error("Failed to read config.shards"))?
            .ok_or_else(|| SyncError::config(format!("unknown shard {shard}")))?;
        entry
            .get_str("host")
            .map(str::to_string)
            .map_err(|_| SyncError::config(format!("shard {shard} has no host")))
    }
}

#[async_trait]
impl DatabaseConnector for MongoConnector {
    async fn shards(&self) -> Result<Vec<String>> {
        let names = self
            .client
            .list_database_names(None, None)
            .await
            .map_err(database_error("Failed to list databases"))?;
        if !names.iter().any(|n| n == "config") {
            return Ok(Vec::new());
        }

        let mut cursor = self
            .client
            .database("config")
            .collection::<Document>("shards")
            .find(None, None)
            .await
            .map_err(database_error("Failed to read config.shards"))?;
        let mut shards = Vec::new();
        while let Some(entry) = cursor
            .try_next()
            .await
            .map_err(database_error("Failed to read config.shards"))?
        {
            if let Ok(id) = entry.get_str("_id") {
                shards.push(id.to_string());
            }
        }
        Ok(shards)
    }

    async fn connect(&self, shard: Option<&str>) -> Result<Database> {
        let documents = Arc::new(MongoDocumentStore {
            client: self.client.clone(),
        });
        let log_client = match shard {
            None => self.client.clone(),
            Some(shard) => {
                let uri = shard_uri(&self.shard_host(shard).await?);
                debug!(shard, uri = %uri, "Connecting to shard");
                Client::with_uri_str(&uri)
                    .await
                    .map_err(database_error(format!("Failed to connect to shard {shard}")))?
            }
        };
        let log = Arc::new(MongoOperationLog {
            client: log_client.clone(),
            tail_await: self.tail_await,
            batch_size: self.tail_batch_size,
        });
        let database = Database::new(documents, log);
        Ok(match shard {
            // Bulk loads read the shard's own partition
            Some(_) => database.with_snapshot(Arc::new(MongoDocumentStore {
                client: log_client,
            })),
            None => database,
        })
    }
}

// ============================================================================
// Documents
// ============================================================================

pub struct MongoDocumentStore {
    client: Client,
}

impl MongoDocumentStore {
    fn collection(&self, namespace: &str) -> Result<Collection<Document>> {
        let (database, collection) = split_namespace(namespace)?;
        Ok(self.client.database(database).collection(collection))
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn find(
        &self,
        namespace: &str,
        ids: Option<&[Value]>,
        fields: Option<&[String]>,
    ) -> Result<DocumentStream> {
        let collection = self.collection(namespace)?;
        let filter = match ids {
            Some(ids) => {
                let ids = ids.iter().map(id_to_bson).collect::<Result<Vec<_>>>()?;
                Some(doc! { "_id": { "$in": ids } })
            }
            None => None,
        };
        let projection = fields.map(|fields| {
            let mut projection = Document::new();
            for field in fields {
                projection.insert(field.clone(), 1);
            }
            projection
        });
        let options = FindOptions::builder().projection(projection).build();

        let cursor: Cursor<Document> = collection
            .find(filter, options)
            .await
            .map_err(database_error(format!("Failed to query {namespace}")))?;
        let namespace = namespace.to_string();
        Ok(Box::pin(cursor.map(move |result| {
            result
                .map(document_to_json)
                .map_err(database_error(format!("Failed to read {namespace}")))
        })))
    }

    async fn count(&self, namespace: &str) -> Result<u64> {
        self.collection(namespace)?
            .estimated_document_count(None)
            .await
            .map_err(database_error(format!("Failed to count {namespace}")))
    }
}

// ============================================================================
// Operation log
// ============================================================================

pub struct MongoOperationLog {
    client: Client,
    tail_await: Duration,
    batch_size: usize,
}

impl MongoOperationLog {
    fn collection(&self, source: &LogSource) -> Collection<Document> {
        self.client
            .database(&source.database)
            .collection(&source.collection)
    }
}

#[async_trait]
impl OperationLog for MongoOperationLog {
    fn database(&self) -> &str {
        LOG_DATABASE
    }

    async fn log_collections(&self) -> Result<Vec<String>> {
        let names = self
            .client
            .database(LOG_DATABASE)
            .list_collection_names(None)
            .await
            .map_err(database_error("Failed to list log collections"))?;
        Ok(names
            .into_iter()
            .filter(|name| LogMode::all().iter().any(|m| m.collection() == name))
            .collect())
    }

    async fn latest(&self, source: &LogSource) -> Result<Option<Sequence>> {
        let options = FindOneOptions::builder()
            .sort(doc! { "$natural": -1 })
            .projection(doc! { "ts": 1 })
            .build();
        let newest = self
            .collection(source)
            .find_one(None, options)
            .await
            .map_err(database_error(format!("Failed to read {source}")))?;
        Ok(newest.and_then(|d| d.get_timestamp("ts").ok().map(to_sequence)))
    }

    async fn contains(&self, source: &LogSource, sequence: Sequence) -> Result<bool> {
        let found = self
            .collection(source)
            .find_one(doc! { "ts": to_timestamp(sequence) }, None)
            .await
            .map_err(database_error(format!("Failed to read {source}")))?;
        Ok(found.is_some())
    }

    async fn tail(&self, source: &LogSource, after: Option<Sequence>) -> Result<Box<dyn LogCursor>> {
        // Start at `after` itself to prove it is still retained
        let filter = after.map(|seq| doc! { "ts": { "$gte": to_timestamp(seq) } });
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(self.tail_await)
            .no_cursor_timeout(true)
            .build();
        let cursor = self
            .collection(source)
            .find(filter, options)
            .await
            .map_err(database_error(format!("Failed to tail {source}")))?;
        Ok(Box::new(MongoLogCursor {
            cursor,
            source: source.to_string(),
            anchor: after,
            window: self.tail_await * 2,
            batch_size: self.batch_size,
        }))
    }
}

struct MongoLogCursor {
    cursor: Cursor<Document>,
    source: String,
    /// Position the cursor was opened at, until its entry has been seen
    anchor: Option<Sequence>,
    /// Longest time one drain waits on the cursor
    window: Duration,
    batch_size: usize,
}

impl MongoLogCursor {
    fn check_anchor(&mut self, entry: &LogEntry) -> Result<bool> {
        match self.anchor.take() {
            Some(anchor) if entry.sequence == anchor => Ok(false),
            Some(anchor) => Err(SyncError::stale_cursor(
                self.source.clone(),
                format!("entry {anchor} is no longer in the log, oldest is {}", entry.sequence),
            )),
            None => Ok(true),
        }
    }
}

/// How a read window ended
#[derive(Debug)]
enum WindowEnd<E> {
    Elapsed,
    Full,
    Closed,
    Failed(E),
}

/// Collect what `stream` yields within `window`, at most `limit` items.
///
/// Stops at the first error.
async fn read_window<S, T, E>(
    stream: &mut S,
    window: Duration,
    limit: usize,
) -> (Vec<T>, WindowEnd<E>)
where
    S: Stream<Item = std::result::Result<T, E>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + window;
    let mut items = Vec::new();
    while items.len() < limit {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return (items, WindowEnd::Elapsed),
            Ok(None) => return (items, WindowEnd::Closed),
            Ok(Some(Err(e))) => return (items, WindowEnd::Failed(e)),
            Ok(Some(Ok(item))) => items.push(item),
        }
    }
    (items, WindowEnd::Full)
}

#[async_trait]
impl LogCursor for MongoLogCursor {
    async fn drain(&mut self) -> Result<Vec<LogEntry>> {
        let (raw, end) = read_window(&mut self.cursor, self.window, self.batch_size).await;
        match end {
            WindowEnd::Elapsed | WindowEnd::Full => {}
            WindowEnd::Closed => {
                return Err(SyncError::database(format!("Cursor on {} closed", self.source)));
            }
            WindowEnd::Failed(e) if server_code(&e) == Some(CAPPED_POSITION_LOST) => {
                return Err(SyncError::stale_cursor(self.source.clone(), e.to_string()));
            }
            WindowEnd::Failed(e) => {
                return Err(SyncError::database_with_source(
                    format!("Failed to read {}: {e}", self.source),
                    e,
                ));
            }
        }

        let mut entries = Vec::with_capacity(raw.len());
        for raw in raw {
            let entry = parse_entry(raw)?;
            if self.check_anchor(&entry)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

// ============================================================================
// Configuration store
// ============================================================================

/// Configuration records kept in a MongoDB collection
pub struct MongoConfigStore {
    client: Client,
    database: String,
    collection: String,
}

impl MongoConfigStore {
    pub fn new(client: Client, database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            collection: collection.into(),
        }
    }

    fn collection(&self, policy: Option<&ReplicationWaitPolicy>) -> Collection<Document> {
        let database = self.client.database(&self.database);
        match policy {
            Some(policy) => {
                let concern = WriteConcern::builder()
                    .w(Acknowledgment::Nodes(policy.acks))
                    .w_timeout(policy.timeout)
                    .build();
                database.collection_with_options(
                    &self.collection,
                    CollectionOptions::builder().write_concern(concern).build(),
                )
            }
            None => database.collection(&self.collection),
        }
    }
}

fn update_document(update: RecordUpdate, shard: Option<&str>) -> Result<Document> {
    let field = match shard {
        Some(shard) => format!("shards.{shard}.{}", update.field()),
        None => update.field().to_string(),
    };
    let to_bson = |seq: Sequence| {
        bson::to_bson(&seq).map_err(|e| SyncError::Serialization {
            message: e.to_string(),
            source: Some(Box::new(e)),
        })
    };
    Ok(match update {
        RecordUpdate::NamespaceProgress(seq) | RecordUpdate::CommitTimestamp(seq) => {
            doc! { "$set": { field: to_bson(seq)? } }
        }
        RecordUpdate::ResetDumpCount => doc! { "$set": { field: 0_i64 } },
        RecordUpdate::IncrementDumpCount(n) => doc! { "$inc": { field: n as i64 } },
        RecordUpdate::TotalDumpCount(n) => doc! { "$set": { field: n as i64 } },
    })
}

#[async_trait]
impl RecordStore for MongoConfigStore {
    async fn records(&self) -> Result<RecordStream> {
        let options = FindOptions::builder()
            .sort(doc! { "endpoint": 1, "ns": 1 })
            .build();
        let cursor = self
            .collection(None)
            .find(None, options)
            .await
            .map_err(|e| SyncError::config_store_with_source("Failed to read config records", e))?;
        Ok(Box::pin(cursor.map(|result| {
            let raw = result
                .map_err(|e| SyncError::config_store_with_source("Failed to read config record", e))?;
            let endpoint = raw.get_str("endpoint").unwrap_or_default().to_string();
            bson::from_document::<ConfigRecord>(raw).map_err(|e| SyncError::MalformedRecord {
                endpoint,
                message: e.to_string(),
            })
        })))
    }

    async fn update(
        &self,
        endpoint: &str,
        namespace: Option<&str>,
        shard: Option<&str>,
        update: RecordUpdate,
        policy: &ReplicationWaitPolicy,
    ) -> Result<u64> {
        let mut filter = doc! { "endpoint": endpoint };
        if let Some(namespace) = namespace {
            filter.insert("ns", namespace);
        }
        let result = self
            .collection(Some(policy))
            .update_many(filter, update_document(update, shard)?, None)
            .await
            .map_err(|e| SyncError::config_store_with_source("Failed to update config records", e))?;
        Ok(result.matched_count)
    }
}
