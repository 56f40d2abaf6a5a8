//! # Search Sync Core
//!
//! Core types, collaborator traits and utilities for mirroring a document
//! database into a full-text search index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ OperationLog │────►│    Engine    │────►│ IndexClient  │
//! │ DocumentStore│     │ (per target) │     │ (retrying)   │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │ progress
//!                      ┌──────┴───────┐
//!                      │ RecordStore  │◄──── Reconciliation daemon
//!                      └──────────────┘
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flatten;
pub mod message;
pub mod metrics;
pub mod strategy;
pub mod target;

pub use checkpoint::*;
pub use config::*;
pub use error::*;
pub use flatten::*;
pub use message::*;
pub use metrics::*;
pub use strategy::*;
pub use target::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::checkpoint::Checkpoint;
    pub use crate::error::{Result, SyncError};
    pub use crate::flatten::{flatten, Flattener};
    pub use crate::message::{IndexedDocument, LogEntry, Operation, Sequence};
    pub use crate::strategy::{
        ConfigSource, Database, DatabaseConnector, DocumentStore, IndexClient, IndexConnector,
        LogCursor, LogMode, LogSource, OperationLog, RecordStore,
    };
    pub use crate::target::{
        ConfigRecord, EngineKey, FieldAllowlist, RecordUpdate, ReplicationWaitPolicy,
        TargetConfig,
    };
}
