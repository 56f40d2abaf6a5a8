//! Error types for the search synchronizer
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

use crate::message::Sequence;

/// Result type alias for synchronizer operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed source error
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for all synchronizer operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No operation log collection exists for the database
    #[error("No operation log found in database {database}")]
    LogSourceNotFound { database: String },

    /// More than one operation log candidate and no mode to pick one
    #[error("Ambiguous operation log source, candidates: {candidates:?}")]
    LogSourceAmbiguous { candidates: Vec<String> },

    /// Tailing cursor fell outside the retained log window
    #[error("Stale cursor on {source_name}: {reason}")]
    StaleCursor { source_name: String, reason: String },

    /// Last applied sequence no longer exists after a failover
    #[error("Rollback detected on {source_name}: sequence {last_applied} is gone")]
    Rollback {
        source_name: String,
        last_applied: Sequence,
    },

    /// A retried call was interrupted by a stop request
    #[error("Retry of {operation} aborted after {attempts} attempts: {source}")]
    RetryAborted {
        operation: &'static str,
        attempts: u64,
        #[source]
        source: Box<SyncError>,
    },

    /// Source database connection or query errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Search index errors
    #[error("Index error: {message}")]
    Index {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Configuration store read/write errors
    #[error("Config store error: {message}")]
    ConfigStore {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid static configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A persisted configuration record could not be interpreted
    #[error("Malformed config record for {endpoint}: {message}")]
    MalformedRecord { endpoint: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error with source
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an index error
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
            source: None,
        }
    }

    /// Create an index error with source
    pub fn index_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Index {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config store error
    pub fn config_store(message: impl Into<String>) -> Self {
        Self::ConfigStore {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config store error with source
    pub fn config_store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigStore {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a stale cursor error
    pub fn stale_cursor(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleCursor {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Report a log discontinuity as a stale cursor.
    ///
    /// A rolled back sequence leaves the cursor as unusable as a truncated
    /// one; other errors pass through.
    pub fn into_stale_cursor(self) -> Self {
        match self {
            Self::Rollback {
                source_name,
                last_applied,
            } => Self::StaleCursor {
                source_name,
                reason: format!("sequence {last_applied} was rolled back"),
            },
            other => other,
        }
    }

    /// Check if error is retryable with a fixed backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Index { .. } | Self::ConfigStore { .. }
        )
    }

    /// Check if error is a connectivity problem with the source database
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. })
    }

    /// Check if error is a break in the operation log
    pub fn is_discontinuity(&self) -> bool {
        matches!(self, Self::StaleCursor { .. } | Self::Rollback { .. })
    }

    /// Check if error is an unrecoverable configuration problem
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::LogSourceNotFound { .. }
                | Self::LogSourceAmbiguous { .. }
                | Self::Configuration { .. }
                | Self::MalformedRecord { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LogSourceNotFound { .. } => "log_source_not_found",
            Self::LogSourceAmbiguous { .. } => "log_source_ambiguous",
            Self::StaleCursor { .. } => "stale_cursor",
            Self::Rollback { .. } => "rollback",
            Self::RetryAborted { .. } => "retry_aborted",
            Self::Database { .. } => "database",
            Self::Index { .. } => "index",
            Self::ConfigStore { .. } => "config_store",
            Self::Configuration { .. } => "configuration",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::Serialization { .. } => "serialization",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub endpoint: Option<String>,
    pub namespace: Option<String>,
    pub sequence: Option<Sequence>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            endpoint: None,
            namespace: None,
            sequence: None,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref endpoint) = self.endpoint {
            write!(f, " endpoint={}", endpoint)?;
        }
        if let Some(ref ns) = self.namespace {
            write!(f, " ns={}", ns)?;
        }
        if let Some(seq) = self.sequence {
            write!(f, " seq={}", seq)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            if matches!(e, SyncError::Shutdown) {
                return e;
            }
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                endpoint = ?ctx.endpoint,
                namespace = ?ctx.namespace,
                sequence = ?ctx.sequence,
                "Operation failed"
            );
            e
        })
    }
}
