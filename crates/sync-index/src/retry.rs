//! Retrying index client
//!
//! [`ResilientIndexClient`] wraps any [`IndexClient`] and retries every call
//! forever with a fixed delay. The only way out of a failing call is a stop
//! request on the shared [`StopSignal`], which turns the failure into
//! `SyncError::RetryAborted`.

use async_trait::async_trait;
use search_sync_core::prelude::*;
use search_sync_core::IndexMetrics;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Cooperative stop flag shared by an engine loop and its index client
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request a stop and wake every sleeper
    pub fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns true if the signal is stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }

    /// Resolve once a stop has been requested
    pub async fn stopped(&self) {
        let notified = self.notify.notified();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Index client decorator that retries until success or stop
pub struct ResilientIndexClient {
    inner: Arc<dyn IndexClient>,
    stop: Arc<StopSignal>,
    retry_interval: Duration,
    metrics: IndexMetrics,
}

impl ResilientIndexClient {
    pub fn new(
        inner: Arc<dyn IndexClient>,
        stop: Arc<StopSignal>,
        retry_interval: Duration,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            stop,
            retry_interval,
            metrics: IndexMetrics::new(endpoint),
        }
    }


    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempts = 0u64;
        loop {
            let error = match call().await {
                Ok(value) => {
                    if attempts > 0 {
                        debug!(operation, attempts, "Index call recovered");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            attempts += 1;
            self.metrics.record_retry(operation);
            warn!(
                operation,
                attempts,
                error = %error,
                retry_in_ms = self.retry_interval.as_millis() as u64,
                "Index call failed, retrying"
            );

            if self.stop.sleep(self.retry_interval).await {
                return Err(SyncError::RetryAborted {
                    operation,
                    attempts,
                    source: Box::new(error),
                });
            }
        }
    }
}

#[async_trait]
impl IndexClient for ResilientIndexClient {
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        let inner = self.inner.as_ref();
        self.retrying("add", || inner.add(documents)).await
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let inner = self.inner.as_ref();
        self.retrying("delete_by_id", || inner.delete_by_id(id)).await
    }

    async fn commit(&self) -> Result<()> {
        let inner = self.inner.as_ref();
        self.retrying("commit", || inner.commit()).await
    }

    async fn tombstones_before(&self, cutoff: Sequence, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.as_ref();
        self.retrying("tombstones_before", || inner.tombstones_before(cutoff, limit))
            .await
    }

    async fn ping(&self) -> Result<()> {
        let inner = self.inner.as_ref();
        self.retrying("ping", || inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;
    use std::time::Instant;

    #[tokio::test]
    async fn test_retries_until_success() {
        let index = Arc::new(MemoryIndex::new());
        index.fail_next(3);
        let client = ResilientIndexClient::new(
            index.clone(),
            StopSignal::new(),
            Duration::from_millis(5),
            "mem",
        );

        client.commit().await.unwrap();
        assert_eq!(index.commits(), 1);
        assert_eq!(index.failed_calls(), 3);
    }

    #[tokio::test]
    async fn test_stop_aborts_within_one_tick() {
        let index = Arc::new(MemoryIndex::new());
        index.set_unavailable(true);
        let stop = StopSignal::new();
        let client = Arc::new(ResilientIndexClient::new(
            index.clone(),
            stop.clone(),
            Duration::from_millis(200),
            "mem",
        ));

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.commit().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped_at = Instant::now();
        stop.stop();
        let result = tokio::time::timeout(Duration::from_millis(400), task)
            .await
            .expect("retry loop did not observe the stop")
            .unwrap();

        assert!(stopped_at.elapsed() < Duration::from_millis(250));
        match result {
            Err(SyncError::RetryAborted {
                operation, source, ..
            }) => {
                assert_eq!(operation, "commit");
                assert!(matches!(*source, SyncError::Index { .. }));
            }
            other => panic!("expected RetryAborted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_signal_sleep() {
        let stop = StopSignal::new();
        assert!(!stop.sleep(Duration::from_millis(1)).await);
        stop.stop();
        assert!(stop.is_stopped());
        assert!(stop.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        stop.stop();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter did not observe the stop")
            .unwrap();
        // Already stopped resolves at once
        tokio::time::timeout(Duration::from_millis(50), stop.stopped())
            .await
            .unwrap();
    }
}
