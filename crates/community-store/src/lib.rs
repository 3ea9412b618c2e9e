//! Community Store Library
//!
//! Persistence for the community app: a SQLite transactional store, a JSON
//! key-value fallback that serves every call the database cannot, and the
//! sync engine that keeps the two converged.

pub mod auth;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod repository;
pub mod store;
pub mod sync;

pub use config::{BackendStrategy, StoreConfig};
pub use error::{ErrorKind, Outcome, StorageError, StorageResult};
pub use models::{Collection, Record};
pub use repository::{Repository, RepositoryError};
pub use store::{LocalStore, Readiness, RecordStore, Storage, TransactionalStore};
pub use sync::{SyncEngine, SyncReport};

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use auth::Sha256Hasher;
use export::Exporter;

/// A running store: every component built once and shared by `Arc`.
pub struct App {
    pub config: StoreConfig,
    pub storage: Arc<Storage>,
    pub repository: Arc<Repository>,
    pub sync: Arc<SyncEngine>,
    pub exporter: Arc<Exporter>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Open the stores, pull the database into the local copy, seed first-run
    /// data and start the background tasks.
    pub async fn start(config: StoreConfig) -> anyhow::Result<Self> {
        config
            .ensure_dirs()
            .await
            .context("Failed to create data directories")?;

        let local = Arc::new(LocalStore::from_config(&config).context("Failed to open local store")?);

        let primary = match config.strategy {
            BackendStrategy::Transactional => {
                let primary = Arc::new(TransactionalStore::new(config.clone(), local.clone()));
                if primary.open().await != Readiness::Ready {
                    warn!("[Store] Running on local fallback only");
                }
                Some(primary)
            }
            BackendStrategy::FallbackOnly => None,
        };

        let storage = Arc::new(Storage::new(&config, primary, local));
        let sync = Arc::new(SyncEngine::new(storage.clone()));
        sync.pull().await;

        let repository = Arc::new(Repository::new(storage.clone(), Arc::new(Sha256Hasher)));
        repository.init().await;

        let exporter = Arc::new(Exporter::new(storage.clone(), config.export_dir.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![sync
            .clone()
            .spawn_periodic(config.sync_interval, shutdown_rx.clone())];
        if let Some(period) = config.auto_export_interval {
            tasks.push(exporter.clone().spawn_auto_export(period, shutdown_rx));
        }

        info!(
            "[Store] Started ({})",
            if storage.is_primary_active() {
                "database + local fallback"
            } else {
                "local fallback only"
            }
        );

        Ok(Self {
            config,
            storage,
            repository,
            sync,
            exporter,
            shutdown_tx,
            tasks,
        })
    }

    /// Stop the background tasks, push once more and close the database.
    pub async fn shutdown(self) -> SyncReport {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("[Store] Background task ended abnormally: {}", e);
            }
        }

        let report = self.sync.push().await;
        if let Some(primary) = self.storage.primary() {
            primary.close().await;
        }
        info!("[Store] Shut down");
        report
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "community_store=info,info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("=== Community Store ===");

    let config = StoreConfig::from_env();
    info!("Data directory: {:?}", config.data_dir);
    info!("Backend: {:?}", config.strategy);
    info!("Sync interval: {:?}", config.sync_interval);

    let app = App::start(config).await?;
    info!(
        "[Repo] {} users, {} posts, {} announcements",
        app.repository.users().await.len(),
        app.repository.posts().await.len(),
        app.repository.announcements().await.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let report = app.shutdown().await;
    if !report.failed.is_empty() {
        warn!("[Sync] Final push left {} collections unsynced", report.failed.len());
    }
    Ok(())
}
