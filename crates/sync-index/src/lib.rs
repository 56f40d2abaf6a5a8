//! # Search Sync Index
//!
//! Search index clients used by synchronization engines.
//!
//! ## Clients
//!
//! - `HttpIndexClient`: Solr-style JSON API over HTTP
//! - `MemoryIndex`: in-process index recording every call
//! - `ResilientIndexClient`: decorator retrying any client until it succeeds
//!   or its [`StopSignal`] fires

pub mod http;
pub mod memory;
pub mod retry;

pub use http::*;
pub use memory::*;
pub use retry::*;
