//! Message types for the search synchronizer
//!
//! Defines the operation log entry shape consumed by the engine and the
//! projection written into the search index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Field holding the document identifier in the index
pub const ID_FIELD: &str = "id";
/// Field holding the source namespace in the index
pub const NAMESPACE_FIELD: &str = "_ns";
/// Tombstone flag
pub const DELETED_FIELD: &str = "_deleted";
/// Sequence of the delete that produced the tombstone
pub const DELETED_SEQUENCE_FIELD: &str = "_deleted_ts";

/// Composite log timestamp: seconds since epoch plus a per-second counter.
///
/// Ordered first by seconds, then by counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Sequence {
    pub seconds: u32,
    pub counter: u32,
}

impl Sequence {
    pub const ZERO: Sequence = Sequence {
        seconds: 0,
        counter: 0,
    };

    pub const fn new(seconds: u32, counter: u32) -> Self {
        Self { seconds, counter }
    }

    /// First sequence of the given wall-clock second
    pub fn at(time: DateTime<Utc>) -> Self {
        let seconds = time.timestamp().clamp(0, u32::MAX as i64) as u32;
        Self::new(seconds, 0)
    }

    /// Single integer encoding usable for range queries in the index
    pub fn as_i64(&self) -> i64 {
        ((self.seconds as i64) << 32) | self.counter as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self::new((value >> 32) as u32, (value & 0xFFFF_FFFF) as u32)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.counter)
    }
}

/// Operation recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Noop,
    /// Insert caused by a chunk moving between shards
    MigrationInsert,
    /// Delete caused by a chunk moving between shards
    MigrationDelete,
}

impl Operation {
    /// Physical relocation rather than a logical change
    pub fn is_migration(&self) -> bool {
        matches!(self, Self::MigrationInsert | Self::MigrationDelete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
            Self::MigrationInsert => "migration_insert",
            Self::MigrationDelete => "migration_delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub operation: Operation,

    /// `database.collection`
    pub namespace: String,

    /// Affected document, or the update selector for update operations
    pub object: Value,

    pub sequence: Sequence,
}

impl LogEntry {
    pub fn new(
        operation: Operation,
        namespace: impl Into<String>,
        object: Value,
        sequence: Sequence,
    ) -> Self {
        Self {
            operation,
            namespace: namespace.into(),
            object,
            sequence,
        }
    }

    pub fn insert(namespace: impl Into<String>, document: Value, sequence: Sequence) -> Self {
        Self::new(Operation::Insert, namespace, document, sequence)
    }

    /// Update entry; only the selector is kept since the payload may be a diff
    pub fn update(namespace: impl Into<String>, id: Value, sequence: Sequence) -> Self {
        Self::new(
            Operation::Update,
            namespace,
            serde_json::json!({ "_id": id }),
            sequence,
        )
    }

    pub fn delete(namespace: impl Into<String>, id: Value, sequence: Sequence) -> Self {
        Self::new(
            Operation::Delete,
            namespace,
            serde_json::json!({ "_id": id }),
            sequence,
        )
    }

    pub fn noop(sequence: Sequence) -> Self {
        Self::new(Operation::Noop, "", Value::Null, sequence)
    }

    /// Raw `_id` of the affected document
    pub fn document_id(&self) -> Option<&Value> {
        self.object.get("_id")
    }
}

/// Render a database identifier as an index key.
///
/// Extended-JSON object ids (`{"$oid": ".."}`) collapse to their hex string.
pub fn document_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(map) => match map.get("$oid").and_then(Value::as_str) {
            Some(oid) => oid.to_string(),
            None => id.to_string(),
        },
        other => other.to_string(),
    }
}

/// Index id of a source document.
///
/// Namespaced so that equal `_id`s in different collections stay distinct.
pub fn index_key(namespace: &str, id: &Value) -> String {
    format!("{namespace}:{}", document_key(id))
}

/// Document as written into the search index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: String,
    pub namespace: String,
    /// Flattened field map
    pub fields: BTreeMap<String, Value>,
    pub deleted: bool,
    pub deleted_at: Option<Sequence>,
}

impl IndexedDocument {
    /// Live document from already flattened fields
    pub fn live(
        id: impl Into<String>,
        namespace: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            fields,
            deleted: false,
            deleted_at: None,
        }
    }

    /// Soft-deleted marker stamped with the delete's sequence
    pub fn tombstone(id: impl Into<String>, namespace: impl Into<String>, at: Sequence) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            fields: BTreeMap::new(),
            deleted: true,
            deleted_at: Some(at),
        }
    }

    /// JSON object sent to the index
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 4);
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        map.insert(
            NAMESPACE_FIELD.to_string(),
            Value::String(self.namespace.clone()),
        );
        map.insert(DELETED_FIELD.to_string(), Value::Bool(self.deleted));
        if let Some(at) = self.deleted_at {
            map.insert(DELETED_SEQUENCE_FIELD.to_string(), Value::from(at.as_i64()));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_order() {
        assert!(Sequence::new(10, 5) < Sequence::new(11, 0));
        assert!(Sequence::new(10, 1) < Sequence::new(10, 2));
        let seq = Sequence::new(1_700_000_000, 42);
        assert_eq!(Sequence::from_i64(seq.as_i64()), seq);
        assert!(Sequence::new(1, 0).as_i64() > Sequence::new(0, u32::MAX).as_i64());
    }

    #[test]
    fn test_document_key() {
        assert_eq!(document_key(&json!("abc")), "abc");
        assert_eq!(document_key(&json!(12)), "12");
        assert_eq!(
            document_key(&json!({"$oid": "65a0c0ffee00000000000001"})),
            "65a0c0ffee00000000000001"
        );
    }

    #[test]
    fn test_index_key_is_namespaced() {
        let id = json!(1);
        assert_eq!(index_key("shop.items", &id), "shop.items:1");
        assert_ne!(index_key("shop.items", &id), index_key("shop.users", &id));
    }

    #[test]
    fn test_tombstone_json() {
        let doc = IndexedDocument::tombstone("1", "shop.items", Sequence::new(3, 1));
        let value = doc.to_json();
        assert_eq!(value[ID_FIELD], "1");
        assert_eq!(value[DELETED_FIELD], true);
        assert_eq!(value[DELETED_SEQUENCE_FIELD], Sequence::new(3, 1).as_i64());
    }

    #[test]
    fn test_entry_serde_names() {
        let entry = LogEntry::new(
            Operation::MigrationInsert,
            "a.b",
            json!({"_id": 1}),
            Sequence::new(1, 1),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["operation"], "migrationInsert");
        assert!(entry.operation.is_migration());
    }
}
