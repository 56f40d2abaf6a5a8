//! Metrics for the search synchronizer
//!
//! Provides Prometheus-compatible metrics for observability.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Engine metrics
    pub const ENGINE_ENTRIES_APPLIED: &str = "search_sync_entries_applied_total";
    pub const ENGINE_ENTRIES_DISCARDED: &str = "search_sync_entries_discarded_total";
    pub const ENGINE_BATCH_LATENCY: &str = "search_sync_batch_latency_seconds";
    pub const ENGINE_REFETCHED: &str = "search_sync_refetched_total";
    pub const ENGINE_BULK_LOADED: &str = "search_sync_bulk_loaded_total";
    pub const ENGINE_ROLLBACKS: &str = "search_sync_rollbacks_total";
    pub const ENGINE_ERRORS: &str = "search_sync_errors_total";
    pub const ENGINE_LAST_APPLIED: &str = "search_sync_last_applied_seconds";

    // Index client metrics
    pub const INDEX_RETRIES: &str = "search_sync_index_retries_total";

    // Daemon metrics
    pub const DAEMON_RUNNING_ENGINES: &str = "search_sync_running_engines";
    pub const DAEMON_RECONCILE_DURATION: &str = "search_sync_reconcile_duration_seconds";
    pub const DAEMON_TOMBSTONES_PURGED: &str = "search_sync_tombstones_purged_total";
}

/// Labels for metrics
pub mod labels {
    pub const TARGET: &str = "target";
    pub const NAMESPACE: &str = "namespace";
    pub const OPERATION: &str = "operation";
    pub const REASON: &str = "reason";
    pub const ERROR_TYPE: &str = "error_type";
    pub const ENDPOINT: &str = "endpoint";
}

/// Engine metrics
#[derive(Clone)]
pub struct EngineMetrics {
    target: String,
}

impl EngineMetrics {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Record an applied log entry
    pub fn record_applied(&self, namespace: &str, operation: &str) {
        counter!(
            names::ENGINE_ENTRIES_APPLIED,
            labels::TARGET => self.target.clone(),
            labels::NAMESPACE => namespace.to_string(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Record entries dropped without touching the index
    pub fn record_discarded(&self, reason: &'static str, count: u64) {
        counter!(
            names::ENGINE_ENTRIES_DISCARDED,
            labels::TARGET => self.target.clone(),
            labels::REASON => reason,
        )
        .increment(count);
    }

    /// Record batch latency
    pub fn record_batch_latency(&self, duration: Duration) {
        histogram!(
            names::ENGINE_BATCH_LATENCY,
            labels::TARGET => self.target.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record documents re-read for updates
    pub fn record_refetched(&self, namespace: &str, count: u64) {
        counter!(
            names::ENGINE_REFETCHED,
            labels::TARGET => self.target.clone(),
            labels::NAMESPACE => namespace.to_string(),
        )
        .increment(count);
    }

    /// Record documents written by a bulk load
    pub fn record_bulk_loaded(&self, namespace: &str, count: u64) {
        counter!(
            names::ENGINE_BULK_LOADED,
            labels::TARGET => self.target.clone(),
            labels::NAMESPACE => namespace.to_string(),
        )
        .increment(count);
    }

    /// Record a log discontinuity
    pub fn record_rollback(&self, reason: &'static str) {
        counter!(
            names::ENGINE_ROLLBACKS,
            labels::TARGET => self.target.clone(),
            labels::REASON => reason,
        )
        .increment(1);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &'static str) {
        counter!(
            names::ENGINE_ERRORS,
            labels::TARGET => self.target.clone(),
            labels::ERROR_TYPE => error_type,
        )
        .increment(1);
    }

    /// Wall-clock seconds of the last committed sequence
    pub fn set_last_applied(&self, seconds: u32) {
        gauge!(
            names::ENGINE_LAST_APPLIED,
            labels::TARGET => self.target.clone(),
        )
        .set(seconds as f64);
    }
}

/// Index client metrics
#[derive(Clone)]
pub struct IndexMetrics {
    endpoint: String,
}

impl IndexMetrics {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Record retry
    pub fn record_retry(&self, operation: &'static str) {
        counter!(
            names::INDEX_RETRIES,
            labels::ENDPOINT => self.endpoint.clone(),
            labels::OPERATION => operation,
        )
        .increment(1);
    }
}

/// Daemon metrics
#[derive(Clone, Default)]
pub struct DaemonMetrics;

impl DaemonMetrics {
    pub fn set_running_engines(&self, count: usize) {
        gauge!(names::DAEMON_RUNNING_ENGINES).set(count as f64);
    }

    pub fn record_reconcile_duration(&self, duration: Duration) {
        histogram!(names::DAEMON_RECONCILE_DURATION).record(duration.as_secs_f64());
    }

    pub fn record_purged(&self, endpoint: &str, count: u64) {
        counter!(
            names::DAEMON_TOMBSTONES_PURGED,
            labels::ENDPOINT => endpoint.to_string(),
        )
        .increment(count);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Get elapsed time without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
