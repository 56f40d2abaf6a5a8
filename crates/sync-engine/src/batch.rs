//! Batch application
//!
//! A drained batch of log entries is first scanned into a [`BatchPlan`]:
//! inserts and deletes become index writes in log order, updates collapse
//! into a per-namespace refetch set. [`BatchPlan::execute`] then performs
//! the writes and resolves every pending update against the database's
//! current document, so replaying a batch yields the same index state.

use futures::TryStreamExt;
use search_sync_core::prelude::*;
use search_sync_core::{document_key, index_key};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Monitored namespaces and their allowlists
pub type Monitored = BTreeMap<String, FieldAllowlist>;

/// Reasons an entry is dropped without touching the index
pub mod discard {
    pub const NOOP: &str = "noop";
    pub const MIGRATION: &str = "migration";
    pub const UNMONITORED: &str = "unmonitored";
    pub const REPLAYED: &str = "replayed";
    pub const MALFORMED: &str = "malformed";
}

/// Keep `_id` and the allowlisted top-level fields
pub fn project(document: &Value, fields: Option<&[String]>) -> Value {
    match (fields, document) {
        (Some(fields), Value::Object(map)) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() == "_id" || fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        ),
        _ => document.clone(),
    }
}

/// Flatten a source document into its index projection.
///
/// Returns `None` for documents without an `_id`.
pub fn to_indexed(namespace: &str, document: &Value, flattener: &Flattener) -> Option<IndexedDocument> {
    let id = document.get("_id")?;
    Some(IndexedDocument::live(
        index_key(namespace, id),
        namespace,
        flattener.flatten(document),
    ))
}

/// Index work derived from one batch
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Inserts and tombstones in log order
    pub writes: Vec<IndexedDocument>,
    /// Ids to re-read, keyed by namespace then index key
    pub refetch: BTreeMap<String, BTreeMap<String, Value>>,
    /// Last applied sequence per namespace
    pub progress: BTreeMap<String, Sequence>,
    /// Last sequence of the batch, discarded entries included
    pub last_sequence: Option<Sequence>,
    /// Applied entries as `(namespace, operation)`
    pub applied: Vec<(String, Operation)>,
    pub discarded: BTreeMap<&'static str, u64>,
}

impl BatchPlan {
    pub fn scan(
        entries: &[LogEntry],
        monitored: &Monitored,
        checkpoint: &Checkpoint,
        flattener: &Flattener,
    ) -> Self {
        let mut plan = BatchPlan::default();

        for entry in entries {
            plan.last_sequence = Some(entry.sequence);

            let reason = if entry.operation == Operation::Noop {
                Some(discard::NOOP)
            } else if entry.operation.is_migration() {
                Some(discard::MIGRATION)
            } else if !monitored.contains_key(&entry.namespace) {
                Some(discard::UNMONITORED)
            } else if checkpoint.already_applied(&entry.namespace, entry.sequence) {
                Some(discard::REPLAYED)
            } else {
                None
            };
            if let Some(reason) = reason {
                plan.discard(reason);
                continue;
            }

            let Some(id) = entry.document_id() else {
                plan.discard(discard::MALFORMED);
                continue;
            };
            let key = document_key(id);
            let namespace = entry.namespace.as_str();

            match entry.operation {
                Operation::Insert => {
                    let fields = monitored.get(namespace).and_then(|f| f.as_deref());
                    let document = project(&entry.object, fields);
                    if let Some(doc) = to_indexed(namespace, &document, flattener) {
                        plan.writes.push(doc);
                    }
                }
                Operation::Update => {
                    plan.refetch
                        .entry(namespace.to_string())
                        .or_default()
                        .insert(key, id.clone());
                }
                Operation::Delete => {
                    if let Some(pending) = plan.refetch.get_mut(namespace) {
                        pending.remove(&key);
                        if pending.is_empty() {
                            plan.refetch.remove(namespace);
                        }
                    }
                    plan.writes.push(IndexedDocument::tombstone(
                        index_key(namespace, id),
                        namespace,
                        entry.sequence,
                    ));
                }
                Operation::Noop | Operation::MigrationInsert | Operation::MigrationDelete => continue,
            }

            plan.progress.insert(namespace.to_string(), entry.sequence);
            plan.applied.push((namespace.to_string(), entry.operation));
        }

        trace!(
            writes = plan.writes.len(),
            refetch = plan.refetch.values().map(BTreeMap::len).sum::<usize>(),
            "Scanned batch"
        );
        plan
    }

    fn discard(&mut self, reason: &'static str) {
        *self.discarded.entry(reason).or_default() += 1;
    }

    /// True if nothing has to be sent to the index
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.refetch.is_empty()
    }

    /// Apply the plan. Nothing is committed here; on error the whole plan
    /// can be executed again.
    ///
    /// Returns the number of refetched documents per namespace.
    pub async fn execute(
        &self,
        monitored: &Monitored,
        documents: &dyn DocumentStore,
        index: &dyn IndexClient,
        flattener: &Flattener,
    ) -> Result<BTreeMap<String, u64>> {
        if !self.writes.is_empty() {
            index.add(&self.writes).await?;
        }

        let mut refetched = BTreeMap::new();
        for (namespace, ids) in &self.refetch {
            let ids: Vec<Value> = ids.values().cloned().collect();
            let fields = monitored.get(namespace).and_then(|f| f.as_deref());
            let found: Vec<Value> = documents
                .find(namespace, Some(&ids), fields)
                .await?
                .try_collect()
                .await?;

            let docs: Vec<IndexedDocument> = found
                .iter()
                .filter_map(|doc| to_indexed(namespace, doc, flattener))
                .collect();
            if docs.len() < ids.len() {
                debug!(
                    namespace = %namespace,
                    missing = ids.len() - docs.len(),
                    "Updated documents no longer exist, skipping"
                );
            }
            if !docs.is_empty() {
                index.add(&docs).await?;
            }
            refetched.insert(namespace.clone(), docs.len() as u64);
        }
        Ok(refetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{document, MemoryDatabase};
    use search_sync_index::{IndexCall, MemoryIndex};
    use serde_json::json;

    const NS: &str = "shop.items";

    fn monitored() -> Monitored {
        Monitored::from([(NS.to_string(), None)])
    }

    fn seq(counter: u32) -> Sequence {
        Sequence::new(100, counter)
    }

    #[test]
    fn test_delete_supersedes_pending_update() {
        let entries = vec![
            LogEntry::insert(NS, json!({"_id": 1, "x": 1}), seq(1)),
            LogEntry::update(NS, json!(1), seq(2)),
            LogEntry::delete(NS, json!(1), seq(3)),
        ];
        let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &Flattener::default());

        assert!(plan.refetch.is_empty());
        assert_eq!(plan.writes.len(), 2);
        assert!(!plan.writes[0].deleted);
        assert_eq!(plan.writes[1], IndexedDocument::tombstone("shop.items:1", NS, seq(3)));
        assert_eq!(plan.progress[NS], seq(3));
        assert_eq!(plan.applied.len(), 3);
    }

    #[tokio::test]
    async fn test_deleted_update_is_not_refetched() {
        let db = MemoryDatabase::new();
        let index = MemoryIndex::new();
        let entries = vec![
            LogEntry::insert(NS, json!({"_id": 1, "x": 1}), seq(1)),
            LogEntry::update(NS, json!(1), seq(2)),
            LogEntry::delete(NS, json!(1), seq(3)),
        ];
        let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &Flattener::default());
        // A refetch query would fail the batch
        db.fail_next_finds(1);

        plan.execute(&monitored(), &db, &index, &Flattener::default())
            .await
            .unwrap();

        let tombstones: Vec<_> = index.added().into_iter().filter(|d| d.deleted).collect();
        assert_eq!(tombstones.len(), 1);
        assert!(index.document("shop.items:1").unwrap().deleted);
        assert!(!index
            .calls()
            .iter()
            .any(|c| matches!(c, IndexCall::DeleteById(_))));
    }

    #[test]
    fn test_migration_entries_discarded() {
        let entries = vec![
            LogEntry::new(Operation::MigrationInsert, NS, json!({"_id": 7}), seq(1)),
            LogEntry::new(Operation::MigrationDelete, NS, json!({"_id": 8}), seq(2)),
            LogEntry::noop(seq(3)),
            LogEntry::insert("other.coll", json!({"_id": 9}), seq(4)),
        ];
        let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &Flattener::default());

        assert!(plan.is_empty());
        assert!(plan.applied.is_empty());
        assert_eq!(plan.discarded[discard::MIGRATION], 2);
        assert_eq!(plan.discarded[discard::NOOP], 1);
        assert_eq!(plan.discarded[discard::UNMONITORED], 1);
        assert_eq!(plan.last_sequence, Some(seq(4)));
    }

    #[test]
    fn test_insert_respects_allowlist() {
        let monitored = Monitored::from([(NS.to_string(), Some(vec!["name".to_string()]))]);
        let entries = vec![LogEntry::insert(
            NS,
            json!({"_id": "a", "name": "lamp", "secret": 1, "tags": ["x"]}),
            seq(1),
        )];
        let plan = BatchPlan::scan(&entries, &monitored, &Checkpoint::new(), &Flattener::default());

        let fields = &plan.writes[0].fields;
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["name"], json!("lamp"));
        assert_eq!(fields["_id"], json!("a"));
    }

    #[test]
    fn test_replayed_entries_skipped() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.record(NS, seq(5));
        let entries = vec![
            LogEntry::insert(NS, json!({"_id": 1}), seq(4)),
            LogEntry::insert(NS, json!({"_id": 2}), seq(5)),
            LogEntry::insert(NS, json!({"_id": 3}), seq(6)),
        ];
        let plan = BatchPlan::scan(&entries, &monitored(), &checkpoint, &Flattener::default());

        assert_eq!(plan.discarded[discard::REPLAYED], 1);
        assert_eq!(plan.writes.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let db = MemoryDatabase::new();
        db.insert(NS, document(1, json!({"name": "a", "dims": {"w": 1}})));
        db.insert(NS, document(2, json!({"name": "b"})));
        db.update(NS, document(1, json!({"name": "a2", "dims": {"w": 2}})));
        db.delete(NS, json!(2));
        db.insert(NS, document(3, json!({"tags": ["x", "y"]})));
        db.update(NS, document(3, json!({"tags": ["z"]})));

        let source = LogSource::new("local", "oplog.rs");
        let entries = db.tail(&source, None).await.unwrap().drain().await.unwrap();
        let flattener = Flattener::default();

        let once = MemoryIndex::new();
        let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &flattener);
        plan.execute(&monitored(), &db, &once, &flattener).await.unwrap();

        let twice = MemoryIndex::new();
        for _ in 0..2 {
            let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &flattener);
            plan.execute(&monitored(), &db, &twice, &flattener).await.unwrap();
        }

        assert_eq!(once.documents(), twice.documents());
        let doc = once.document("shop.items:1").unwrap();
        assert_eq!(doc.fields["name"], json!("a2"));
        assert_eq!(doc.fields["dims_w"], json!(2));
        assert!(once.document("shop.items:2").unwrap().deleted);
        assert_eq!(once.document("shop.items:3").unwrap().fields.get("tags_1"), None);
    }

    #[tokio::test]
    async fn test_missing_refetch_is_skipped() {
        let db = MemoryDatabase::new();
        let index = MemoryIndex::new();
        let entries = vec![LogEntry::update(NS, json!(42), seq(1))];
        let plan = BatchPlan::scan(&entries, &monitored(), &Checkpoint::new(), &Flattener::default());

        let refetched = plan
            .execute(&monitored(), &db, &index, &Flattener::default())
            .await
            .unwrap();
        assert_eq!(refetched[NS], 0);
        assert!(index.documents().is_empty());
    }
}
