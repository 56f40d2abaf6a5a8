//! Search sync CLI
//!
//! Loads layered configuration, connects to the source database and runs
//! the reconciliation daemon until interrupted.

use clap::Parser;
use search_sync_core::prelude::*;
use search_sync_core::{ConfigStoreKind, SyncConfig};
use search_sync_daemon::{
    run_admin_server, AdminState, EngineLauncher, EventCounter, ReconciliationDaemon,
    TombstoneSweeper,
};
use search_sync_engine::{
    ConfigStoreReader, EngineOptions, FileConfigStore, MongoConfigStore, MongoConnector,
};
use search_sync_index::{HttpIndexConnector, StopSignal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "search-sync")]
#[command(about = "Mirrors a document database into a full-text search index")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "SEARCH_SYNC_CONFIG")]
    config: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Source database
    // ─────────────────────────────────────────────────────────────────────────
    /// Source database connection string
    #[arg(long, env = "DATABASE_URI")]
    database_uri: Option<String>,

    /// Read targets from this JSON file instead of the config collection
    #[arg(long, env = "CONFIG_STORE_PATH")]
    config_store_path: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Intervals
    // ─────────────────────────────────────────────────────────────────────────
    /// Milliseconds between tailing iterations of an engine
    #[arg(long, env = "POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Milliseconds between reads of the configuration store
    #[arg(long, env = "CONFIG_POLL_INTERVAL_MS")]
    config_poll_interval_ms: Option<u64>,

    /// Milliseconds between retries of a failed index call
    #[arg(long, env = "RETRY_INTERVAL_MS")]
    retry_interval_ms: Option<u64>,

    /// Milliseconds to back off after a database error
    #[arg(long, env = "ERROR_INTERVAL_MS")]
    error_interval_ms: Option<u64>,

    /// Seconds between tombstone cleanup sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: Option<u64>,

    /// Minimum tombstone age in seconds before it is purged
    #[arg(long, env = "CLEANUP_AGE_SECS")]
    cleanup_age_secs: Option<u64>,

    /// Re-bulk-load after a stale cursor or rollback instead of failing
    #[arg(long, env = "AUTO_RECONCILE")]
    auto_reconcile: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Admin API
    // ─────────────────────────────────────────────────────────────────────────
    /// Admin API listen address
    #[arg(long, env = "ADMIN_LISTEN")]
    admin_listen: Option<String>,

    /// Disable admin API
    #[arg(long, env = "ADMIN_DISABLED")]
    admin_disabled: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// "json" or "pretty"
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    /// Command line values win over the loaded configuration
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(uri) = self.database_uri {
            config.database.uri = uri;
        }
        if let Some(path) = self.config_store_path {
            config.config_store.kind = ConfigStoreKind::File;
            config.config_store.path = path;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.engine.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.config_poll_interval_ms {
            config.daemon.config_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_interval_ms {
            config.engine.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.error_interval_ms {
            config.engine.error_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.cleanup_interval_secs {
            config.daemon.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cleanup_age_secs {
            config.daemon.cleanup_age = Duration::from_secs(secs);
        }
        if self.auto_reconcile {
            config.engine.auto_reconcile = true;
        }
        if let Some(listen) = self.admin_listen {
            config.admin.listen = listen;
        }
        if self.admin_disabled {
            config.admin.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = format;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let loaded = SyncConfig::load(args.config.as_deref())?;
    let config = args.apply(loaded);

    let json = config.observability.log_format != "pretty";
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().pretty()))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?config.config_store.kind,
        auto_reconcile = config.engine.auto_reconcile,
        "Starting search-sync"
    );

    // ─────────────────────────────────────────────────────────────────────────
    // Collaborators
    // ─────────────────────────────────────────────────────────────────────────
    let database = MongoConnector::new(&config.database).await?;
    let store: Arc<dyn RecordStore> = match config.config_store.kind {
        ConfigStoreKind::Mongo => Arc::new(MongoConfigStore::new(
            database.client().clone(),
            config.config_store.database.clone(),
            config.config_store.collection.clone(),
        )),
        ConfigStoreKind::File => Arc::new(FileConfigStore::new(&config.config_store.path)),
    };
    let index: Arc<dyn IndexConnector> = Arc::new(HttpIndexConnector::new(config.index.clone()));

    let launcher = EngineLauncher::new(
        Arc::new(database),
        index.clone(),
        store.clone(),
        EngineOptions::from_config(&config.engine, &config.database),
    );
    let mut daemon = ReconciliationDaemon::new(
        Arc::new(ConfigStoreReader::new(store)),
        launcher,
        Arc::new(EventCounter::default()),
    )
    .with_sweeper(TombstoneSweeper::new(index, &config.daemon));

    // ─────────────────────────────────────────────────────────────────────────
    // Admin API
    // ─────────────────────────────────────────────────────────────────────────
    if config.admin.enabled {
        let state = AdminState {
            engines: daemon.status_handle(),
        };
        let listen = config.admin.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = run_admin_server(listen, state).await {
                error!(error = %e, "Admin API stopped");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run until interrupted
    // ─────────────────────────────────────────────────────────────────────────
    let shutdown = StopSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.stop();
                }
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            }
        }
    });

    daemon
        .run(config.daemon.config_poll_interval, shutdown)
        .await;
    info!("search-sync stopped");
    Ok(())
}
