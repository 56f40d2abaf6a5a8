//! Tombstone cleanup
//!
//! Deletes soft-deleted documents once their deletion sequence is older
//! than the configured age.

use chrono::Utc;
use search_sync_core::prelude::*;
use search_sync_core::{DaemonConfig, DaemonMetrics};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct TombstoneSweeper {
    index: Arc<dyn IndexConnector>,
    interval: Duration,
    age: Duration,
    batch_size: usize,
    last_run: Option<Instant>,
    metrics: DaemonMetrics,
}

impl TombstoneSweeper {
    pub fn new(index: Arc<dyn IndexConnector>, config: &DaemonConfig) -> Self {
        Self {
            index,
            interval: config.cleanup_interval,
            age: config.cleanup_age,
            batch_size: config.cleanup_batch_size.max(1),
            last_run: None,
            metrics: DaemonMetrics,
        }
    }

    pub fn is_due(&self) -> bool {
        self.last_run.map_or(true, |last| last.elapsed() >= self.interval)
    }

    /// Sequences before this one are old enough to purge
    pub fn cutoff(&self) -> Sequence {
        let now = Sequence::at(Utc::now());
        let age = self.age.as_secs().min(u32::MAX as u64) as u32;
        Sequence::new(now.seconds.saturating_sub(age), 0)
    }

    /// Purge every endpoint, logging failures. Returns the number of
    /// documents removed.
    pub async fn sweep<'a>(&mut self, endpoints: impl IntoIterator<Item = &'a str>) -> u64 {
        self.last_run = Some(Instant::now());
        let cutoff = self.cutoff();
        let mut total = 0;
        for endpoint in endpoints {
            match self.purge(endpoint, cutoff).await {
                Ok(0) => debug!(endpoint, "No tombstones to purge"),
                Ok(count) => {
                    info!(endpoint, count, cutoff = %cutoff, "Purged tombstones");
                    total += count;
                }
                Err(e) => warn!(endpoint, error = %e, "Tombstone cleanup failed"),
            }
        }
        total
    }

    /// Delete tombstones of one endpoint older than `cutoff`
    pub async fn purge(&self, endpoint: &str, cutoff: Sequence) -> Result<u64> {
        let index = self.index.connect(endpoint)?;
        let mut purged = 0;
        loop {
            let ids = index.tombstones_before(cutoff, self.batch_size).await?;
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                index.delete_by_id(id).await?;
            }
            index.commit().await?;
            purged += ids.len() as u64;
            self.metrics.record_purged(endpoint, ids.len() as u64);
            if ids.len() < self.batch_size {
                break;
            }
        }
        Ok(purged)
    }
}
