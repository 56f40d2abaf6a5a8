//! Per-target configuration
//!
//! The configuration store holds one [`ConfigRecord`] per monitored namespace
//! per search endpoint. Records sharing an endpoint are folded into a single
//! [`TargetConfig`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::message::Sequence;

/// Field allowlist for a namespace; `None` indexes every field
pub type FieldAllowlist = Option<Vec<String>>;

/// Write acknowledgement policy for configuration store writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationWaitPolicy {
    /// Number of nodes that must acknowledge a write
    #[serde(default = "default_acks")]
    pub acks: u32,

    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub timeout: Duration,
}

fn default_acks() -> u32 {
    1
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ReplicationWaitPolicy {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            timeout: default_wait_timeout(),
        }
    }
}

/// Progress written by a shard-scoped engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ts: Option<Sequence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_ts: Option<Sequence>,

    #[serde(default)]
    pub dump_count: u64,

    #[serde(default)]
    pub total_dump_count: u64,
}

/// One persisted configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Search endpoint location
    pub endpoint: String,

    /// Monitored `database.collection`
    #[serde(rename = "ns")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: FieldAllowlist,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ts: Option<Sequence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_ts: Option<Sequence>,

    #[serde(default)]
    pub dump_count: u64,

    #[serde(default)]
    pub total_dump_count: u64,

    /// Progress keyed by shard id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shards: BTreeMap<String, ShardProgress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationWaitPolicy>,
}

impl ConfigRecord {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            fields: None,
            commit_ts: None,
            update_ts: None,
            dump_count: 0,
            total_dump_count: 0,
            shards: BTreeMap::new(),
            replication: None,
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Apply a progress update in place
    pub fn apply(&mut self, update: &RecordUpdate, shard: Option<&str>) {
        match shard {
            Some(shard) => {
                let progress = self.shards.entry(shard.to_string()).or_default();
                match *update {
                    RecordUpdate::NamespaceProgress(seq) => progress.update_ts = Some(seq),
                    RecordUpdate::CommitTimestamp(seq) => progress.commit_ts = Some(seq),
                    RecordUpdate::ResetDumpCount => progress.dump_count = 0,
                    RecordUpdate::IncrementDumpCount(n) => progress.dump_count += n,
                    RecordUpdate::TotalDumpCount(n) => progress.total_dump_count = n,
                }
            }
            None => match *update {
                RecordUpdate::NamespaceProgress(seq) => self.update_ts = Some(seq),
                RecordUpdate::CommitTimestamp(seq) => self.commit_ts = Some(seq),
                RecordUpdate::ResetDumpCount => self.dump_count = 0,
                RecordUpdate::IncrementDumpCount(n) => self.dump_count += n,
                RecordUpdate::TotalDumpCount(n) => self.total_dump_count = n,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = self
            .namespace
            .split_once('.')
            .is_some_and(|(db, coll)| !db.is_empty() && !coll.is_empty());
        if !valid {
            return Err(SyncError::MalformedRecord {
                endpoint: self.endpoint.clone(),
                message: format!("namespace {:?} is not database.collection", self.namespace),
            });
        }
        Ok(())
    }
}

/// Progress mutation understood by every backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordUpdate {
    NamespaceProgress(Sequence),
    CommitTimestamp(Sequence),
    ResetDumpCount,
    IncrementDumpCount(u64),
    TotalDumpCount(u64),
}

impl RecordUpdate {
    /// Name of the field touched by this update
    pub fn field(&self) -> &'static str {
        match self {
            Self::NamespaceProgress(_) => "update_ts",
            Self::CommitTimestamp(_) => "commit_ts",
            Self::ResetDumpCount | Self::IncrementDumpCount(_) => "dump_count",
            Self::TotalDumpCount(_) => "total_dump_count",
        }
    }
}

/// Identity of one running engine
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EngineKey {
    pub endpoint: String,
    pub shard: Option<String>,
}

impl EngineKey {
    pub fn new(endpoint: impl Into<String>, shard: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            shard,
        }
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard {
            Some(ref shard) => write!(f, "{}@{}", self.endpoint, shard),
            None => f.write_str(&self.endpoint),
        }
    }
}

/// All configuration for one search endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub endpoint: String,
    pub namespaces: BTreeMap<String, FieldAllowlist>,
    /// Set when this view is scoped to one shard of a sharded deployment
    pub shard_id: Option<String>,
    pub replication: ReplicationWaitPolicy,
    pub commit_timestamp: Option<Sequence>,
    pub namespace_progress: BTreeMap<String, Sequence>,
}

impl TargetConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespaces: BTreeMap::new(),
            shard_id: None,
            replication: ReplicationWaitPolicy::default(),
            commit_timestamp: None,
            namespace_progress: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>, fields: FieldAllowlist) -> Self {
        self.namespaces.insert(namespace.into(), fields);
        self
    }

    /// Copy of this target scoped to a shard
    pub fn for_shard(&self, shard: impl Into<String>) -> Self {
        let mut scoped = self.clone();
        scoped.shard_id = Some(shard.into());
        scoped
    }

    pub fn key(&self) -> EngineKey {
        EngineKey::new(self.endpoint.clone(), self.shard_id.clone())
    }

    /// Fold the records of one endpoint into a target.
    ///
    /// Progress fields are read from the shard entry when `shard` is set.
    pub fn from_records(records: &[ConfigRecord], shard: Option<&str>) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| SyncError::config_store("cannot build a target from no records"))?;
        let mut target = TargetConfig::new(first.endpoint.clone());
        target.shard_id = shard.map(str::to_string);

        for record in records {
            if record.endpoint != target.endpoint {
                return Err(SyncError::MalformedRecord {
                    endpoint: target.endpoint.clone(),
                    message: format!("record for {} in the same group", record.endpoint),
                });
            }
            record.validate()?;
            target
                .namespaces
                .insert(record.namespace.clone(), record.fields.clone());
            if let Some(ref policy) = record.replication {
                target.replication = policy.clone();
            }

            let (commit_ts, update_ts) = match shard {
                Some(shard) => record
                    .shards
                    .get(shard)
                    .map(|p| (p.commit_ts, p.update_ts))
                    .unwrap_or_default(),
                None => (record.commit_ts, record.update_ts),
            };
            if let Some(ts) = commit_ts {
                target.commit_timestamp = Some(target.commit_timestamp.map_or(ts, |t| t.min(ts)));
            }
            if let Some(ts) = update_ts {
                target.namespace_progress.insert(record.namespace.clone(), ts);
            }
        }
        Ok(target)
    }
}
