//! # Search Sync Engine
//!
//! Mirrors the monitored namespaces of one search endpoint from the source
//! database's operation log into the search index.
//!
//! ## Components
//!
//! - `SyncEngine` / `EngineHandle`: per-target state machine and its control handle
//! - `BatchPlan`: turns a drained batch of log entries into index writes
//! - `ConfigStoreReader` / `ConfigWriter`: grouped reads and progress writes
//!   against a `RecordStore`
//! - `mongo`: MongoDB-backed database, log and configuration store
//! - `memory`: in-memory database for tests and local experiments
//!
//! ## Usage
//!
//! ```rust,ignore
//! let database = connector.connect(None).await?;
//! let handle = SyncEngine::new(target, database, index, store, EngineOptions::default()).start();
//!
//! handle.subscribe("shop.orders", None);
//! let state = handle.stop().await;
//! ```

pub mod batch;
pub mod config_store;
pub mod engine;
pub mod memory;
pub mod mongo;

pub use batch::{BatchPlan, Monitored};
pub use config_store::*;
pub use engine::*;
pub use memory::{MemoryConnector, MemoryDatabase};
pub use mongo::{MongoConfigStore, MongoConnector};
