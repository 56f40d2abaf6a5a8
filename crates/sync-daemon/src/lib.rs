//! # Search Sync Daemon
//!
//! Keeps one synchronization engine running per configured search endpoint
//! (per shard on sharded deployments) and converges their monitored
//! namespaces with the configuration store.
//!
//! ## Features
//!
//! - Level-triggered reconciliation loop
//! - Periodic tombstone cleanup
//! - Admin API exposing engine states
//!
//! ```bash
//! search-sync --config /etc/search-sync.toml --auto-reconcile
//! ```

pub mod admin_api;
pub mod cleanup;

pub use admin_api::*;
pub use cleanup::*;

use futures::StreamExt;
use search_sync_core::prelude::*;
use search_sync_core::{DaemonMetrics, LatencyTimer};
use search_sync_engine::{
    EngineEvent, EngineHandle, EngineOptions, EngineState, EngineStatus, EventListener,
    SyncEngine, TracingListener,
};
use search_sync_index::StopSignal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ============================================================================
// Events
// ============================================================================

/// Counts events per engine and forwards them to another listener
pub struct EventCounter {
    inner: Arc<dyn EventListener>,
    seen: Mutex<HashMap<EngineKey, u64>>,
}

impl Default for EventCounter {
    fn default() -> Self {
        Self::new(Arc::new(TracingListener))
    }
}

impl EventCounter {
    pub fn new(inner: Arc<dyn EventListener>) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn events_seen(&self, key: &EngineKey) -> u64 {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn forget(&self, key: &EngineKey) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

impl EventListener for EventCounter {
    fn on_event(&self, key: &EngineKey, event: &EngineEvent) {
        *self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default() += 1;
        self.inner.on_event(key, event);
    }
}

/// Engine status as reported by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub events: u64,
}

// ============================================================================
// Launcher
// ============================================================================

/// Builds and starts engines for targets
pub struct EngineLauncher {
    database: Arc<dyn DatabaseConnector>,
    index: Arc<dyn IndexConnector>,
    store: Arc<dyn RecordStore>,
    options: EngineOptions,
    listener: Arc<dyn EventListener>,
}

impl EngineLauncher {
    pub fn new(
        database: Arc<dyn DatabaseConnector>,
        index: Arc<dyn IndexConnector>,
        store: Arc<dyn RecordStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            database,
            index,
            store,
            options,
            listener: Arc::new(TracingListener),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub async fn shards(&self) -> Result<Vec<String>> {
        self.database.shards().await
    }

    pub async fn launch(&self, target: TargetConfig) -> Result<EngineHandle> {
        let database = self.database.connect(target.shard_id.as_deref()).await?;
        let index = self.index.connect(&target.endpoint)?;
        Ok(SyncEngine::new(
            target,
            database,
            index,
            self.store.clone(),
            self.options.clone(),
        )
        .with_listener(self.listener.clone())
        .start())
    }
}

// ============================================================================
// Daemon
// ============================================================================

/// Control loop converging running engines with the configuration store
pub struct ReconciliationDaemon {
    source: Arc<dyn ConfigSource>,
    launcher: EngineLauncher,
    events: Arc<EventCounter>,
    running: BTreeMap<EngineKey, EngineHandle>,
    status: Arc<RwLock<Vec<EngineReport>>>,
    sweeper: Option<TombstoneSweeper>,
    metrics: DaemonMetrics,
}

impl ReconciliationDaemon {
    /// `events` becomes the listener of every launched engine
    pub fn new(
        source: Arc<dyn ConfigSource>,
        launcher: EngineLauncher,
        events: Arc<EventCounter>,
    ) -> Self {
        Self {
            source,
            launcher: launcher.with_listener(events.clone()),
            events,
            running: BTreeMap::new(),
            status: Arc::new(RwLock::new(Vec::new())),
            sweeper: None,
            metrics: DaemonMetrics,
        }
    }

    pub fn with_sweeper(mut self, sweeper: TombstoneSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Shared snapshot refreshed after every cycle
    pub fn status_handle(&self) -> Arc<RwLock<Vec<EngineReport>>> {
        self.status.clone()
    }

    pub fn engines(&self) -> impl Iterator<Item = &EngineKey> {
        self.running.keys()
    }

    pub fn engine(&self, key: &EngineKey) -> Option<&EngineHandle> {
        self.running.get(key)
    }

    /// Run until `shutdown` fires, then stop every engine
    pub async fn run(&mut self, poll_interval: Duration, shutdown: Arc<StopSignal>) {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "Reconciliation daemon started");
        loop {
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Reconciliation cycle failed");
            }
            if let Some(sweeper) = self.sweeper.as_mut() {
                if sweeper.is_due() {
                    let endpoints: BTreeSet<String> =
                        self.running.keys().map(|k| k.endpoint.clone()).collect();
                    sweeper.sweep(endpoints.iter().map(String::as_str)).await;
                }
            }
            if shutdown.sleep(poll_interval).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// One reconciliation cycle.
    ///
    /// Endpoints whose records cannot be read keep their current engine
    /// untouched. Any other read error aborts the cycle before anything is
    /// stopped.
    pub async fn reconcile(&mut self) -> Result<()> {
        let metrics = self.metrics.clone();
        let _timer = LatencyTimer::start(move |d| metrics.record_reconcile_duration(d));

        let shards = self.launcher.shards().await?;
        let mut desired: BTreeMap<EngineKey, TargetConfig> = BTreeMap::new();
        let mut frozen: BTreeSet<String> = BTreeSet::new();

        let mut targets = self.source.targets().await?;
        while let Some(target) = targets.next().await {
            match target {
                Ok(target) if shards.is_empty() => {
                    desired.insert(target.key(), target);
                }
                Ok(target) => {
                    for shard in &shards {
                        let scoped = target.for_shard(shard.clone());
                        desired.insert(scoped.key(), scoped);
                    }
                }
                Err(SyncError::MalformedRecord { endpoint, message }) => {
                    warn!(endpoint = %endpoint, reason = %message, "Skipping malformed configuration");
                    frozen.insert(endpoint);
                }
                Err(e) => return Err(e),
            }
        }
        desired.retain(|key, _| !frozen.contains(&key.endpoint));

        let removed: Vec<EngineKey> = self
            .running
            .keys()
            .filter(|key| !desired.contains_key(*key) && !frozen.contains(&key.endpoint))
            .cloned()
            .collect();
        for key in removed {
            if let Some(handle) = self.running.remove(&key) {
                let state = handle.stop().await;
                self.events.forget(&key);
                info!(engine = %key, state = %state, "Engine removed");
            }
        }

        for (key, target) in desired {
            if let Some(handle) = self.running.get(&key) {
                converge(handle, &target);
                continue;
            }
            match self.launcher.launch(target).await {
                Ok(handle) => {
                    info!(engine = %key, "Engine launched");
                    self.running.insert(key, handle);
                }
                Err(e) => {
                    warn!(engine = %key, error = %e, "Failed to launch engine, retrying next cycle");
                }
            }
        }

        self.metrics.set_running_engines(self.running.len());
        self.publish_status().await;
        Ok(())
    }

    /// Stop and join every engine
    pub async fn shutdown(&mut self) {
        info!(engines = self.running.len(), "Stopping engines");
        let mut reports = Vec::with_capacity(self.running.len());
        for (key, handle) in std::mem::take(&mut self.running) {
            let mut status = handle.status();
            status.state = handle.stop().await;
            reports.push(EngineReport {
                status,
                events: self.events.events_seen(&key),
            });
        }
        self.metrics.set_running_engines(0);
        *self.status.write().await = reports;
        info!("Reconciliation daemon stopped");
    }

    async fn publish_status(&self) {
        let reports = self
            .running
            .iter()
            .map(|(key, handle)| EngineReport {
                status: handle.status(),
                events: self.events.events_seen(key),
            })
            .collect();
        *self.status.write().await = reports;
    }
}

/// Bring a running engine's namespaces in line with its target
fn converge(handle: &EngineHandle, target: &TargetConfig) {
    if matches!(handle.state(), EngineState::Failed(_)) {
        debug!(engine = %handle.key(), "Engine failed, waiting for its target to be removed");
        return;
    }
    for (namespace, fields) in &target.namespaces {
        handle.subscribe(namespace.clone(), fields.clone());
    }
    for namespace in handle.namespaces().into_keys() {
        if !target.namespaces.contains_key(&namespace) {
            handle.unsubscribe(&namespace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_sync_engine::memory::document;
    use search_sync_engine::{ConfigStoreReader, MemoryConfigStore, MemoryConnector, MemoryDatabase};
    use search_sync_index::MemoryIndexConnector;
    use serde_json::json;
    use std::time::Instant;

    const A: &str = "mem://a";
    const B: &str = "mem://b";

    struct Fixture {
        db: MemoryDatabase,
        indexes: Arc<MemoryIndexConnector>,
        store: Arc<MemoryConfigStore>,
        events: Arc<EventCounter>,
    }

    fn options() -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_millis(10),
            retry_interval: Duration::from_millis(10),
            error_interval: Duration::from_millis(10),
            ..EngineOptions::default()
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            db: MemoryDatabase::new(),
            indexes: Arc::new(MemoryIndexConnector::new()),
            store: Arc::new(MemoryConfigStore::with_records([
                ConfigRecord::new(A, "shop.items"),
                ConfigRecord::new(A, "shop.users"),
                ConfigRecord::new(B, "shop.items"),
            ])),
            events: Arc::new(EventCounter::default()),
        }
    }

    impl Fixture {
        fn daemon_with(&self, connector: MemoryConnector) -> ReconciliationDaemon {
            let launcher = EngineLauncher::new(
                Arc::new(connector),
                self.indexes.clone(),
                self.store.clone(),
                options(),
            );
            ReconciliationDaemon::new(
                Arc::new(ConfigStoreReader::new(self.store.clone())),
                launcher,
                self.events.clone(),
            )
        }

        fn daemon(&self) -> ReconciliationDaemon {
            self.daemon_with(MemoryConnector::new(self.db.clone()))
        }
    }

    fn key(endpoint: &str) -> EngineKey {
        EngineKey::new(endpoint, None)
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_tailing(daemon: &ReconciliationDaemon, key: &EngineKey) {
        let handle = daemon.engine(key).unwrap();
        wait_for("tailing", || handle.state() == EngineState::Tailing).await;
    }

    #[tokio::test]
    async fn test_starts_and_stops_engines() {
        let f = fixture();
        let mut daemon = f.daemon();
        daemon.reconcile().await.unwrap();
        assert_eq!(daemon.engines().cloned().collect::<Vec<_>>(), vec![key(A), key(B)]);
        wait_tailing(&daemon, &key(B)).await;

        f.store.remove(B, "shop.items");
        daemon.reconcile().await.unwrap();
        assert_eq!(daemon.engines().count(), 1);
        assert!(daemon.engine(&key(B)).is_none());

        let status = daemon.status_handle();
        let reports = status.read().await.clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status.endpoint, A);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_through_config() {
        let f = fixture();
        let mut daemon = f.daemon();
        daemon.reconcile().await.unwrap();
        wait_tailing(&daemon, &key(A)).await;

        f.store.remove(A, "shop.users");
        daemon.reconcile().await.unwrap();
        let handle = daemon.engine(&key(A)).unwrap();
        assert!(!handle.namespaces().contains_key("shop.users"));

        let index = f.indexes.index(A);
        f.db.insert("shop.users", document("u1", json!({})));
        f.db.insert("shop.items", document("i1", json!({})));
        wait_for("items insert", || index.document("shop.items:i1").is_some()).await;
        assert!(index.document("shop.users:u1").is_none());
        assert_eq!(handle.state(), EngineState::Tailing);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_namespace_subscribed_in_place() {
        let f = fixture();
        f.db.put("shop.orders", document("o1", json!({})));
        let mut daemon = f.daemon();
        daemon.reconcile().await.unwrap();
        wait_tailing(&daemon, &key(B)).await;

        f.store.upsert(ConfigRecord::new(B, "shop.orders").with_fields(["total"]));
        daemon.reconcile().await.unwrap();
        let index = f.indexes.index(B);
        wait_for("orders load", || index.document("shop.orders:o1").is_some()).await;
        assert_eq!(
            daemon.engine(&key(B)).unwrap().namespaces()["shop.orders"],
            Some(vec!["total".to_string()])
        );
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_endpoint_keeps_engine() {
        let f = fixture();
        let mut daemon = f.daemon();
        daemon.reconcile().await.unwrap();
        wait_tailing(&daemon, &key(A)).await;

        f.store.upsert(ConfigRecord::new(A, "broken"));
        f.store.remove(B, "shop.items");
        daemon.reconcile().await.unwrap();

        let handle = daemon.engine(&key(A)).unwrap();
        assert_eq!(handle.state(), EngineState::Tailing);
        assert_eq!(handle.namespaces().len(), 2);
        assert!(daemon.engine(&key(B)).is_none());
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_engine_stays_registered() {
        let f = fixture();
        let db = MemoryDatabase::with_log_collections(Vec::<String>::new());
        let mut daemon = f.daemon_with(MemoryConnector::new(db));
        daemon.reconcile().await.unwrap();

        let handle = daemon.engine(&key(A)).unwrap();
        wait_for("failure", || handle.is_finished()).await;
        let seen = f.events.events_seen(&key(A));
        assert_eq!(seen, 1);

        daemon.reconcile().await.unwrap();
        assert_eq!(daemon.engines().count(), 2);
        assert!(matches!(
            daemon.engine(&key(A)).unwrap().state(),
            EngineState::Failed(_)
        ));
        assert_eq!(f.events.events_seen(&key(A)), seen);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_engine_per_shard() {
        let f = fixture();
        let connector = MemoryConnector::sharded(
            f.db.clone(),
            [
                ("s0".to_string(), MemoryDatabase::new()),
                ("s1".to_string(), MemoryDatabase::new()),
            ],
        );
        let mut daemon = f.daemon_with(connector);
        daemon.reconcile().await.unwrap();

        let keys: Vec<String> = daemon.engines().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["mem://a@s0", "mem://a@s1", "mem://b@s0", "mem://b@s1"]);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_store_outage_leaves_engines_running() {
        let f = fixture();
        let mut daemon = f.daemon();
        daemon.reconcile().await.unwrap();

        f.store.set_unavailable(true);
        assert!(daemon.reconcile().await.is_err());
        assert_eq!(daemon.engines().count(), 2);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_engines_on_shutdown() {
        let f = fixture();
        let mut daemon = f.daemon();
        let status = daemon.status_handle();
        let shutdown = StopSignal::new();

        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                daemon.run(Duration::from_millis(10), shutdown).await;
                daemon
            }
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while status.read().await.len() < 2 {
            assert!(Instant::now() < deadline, "timed out waiting for engines");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.stop();
        let daemon = task.await.unwrap();
        assert_eq!(daemon.engines().count(), 0);
        let reports = status.read().await.clone();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status.state.is_terminal()));
    }
}
