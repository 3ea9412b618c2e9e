//! Store configuration

use std::path::PathBuf;
use std::time::Duration;

/// Which backend the facade routes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendStrategy {
    /// SQLite primary with the local store as per-call fallback.
    Transactional,
    /// No transactional engine; the local store serves everything.
    FallbackOnly,
}

/// Configuration for the community store
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root directory for all persisted data
    pub data_dir: PathBuf,
    /// SQLite database file (None for an in-memory database)
    pub database_path: Option<PathBuf>,
    /// Directory of the local key-value store (None for in-memory)
    pub local_dir: Option<PathBuf>,
    /// Directory export documents are written to
    pub export_dir: PathBuf,
    /// Backend selection
    pub strategy: BackendStrategy,
    /// Prefix of every local key
    pub key_prefix: String,
    /// Period of the background push
    pub sync_interval: Duration,
    /// Upper bound on waiting for the transactional store to open
    pub ready_timeout: Duration,
    /// Max bytes of a single local value
    pub local_quota_bytes: Option<usize>,
    /// Period of the background full export (None disables it)
    pub auto_export_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::with_base_dir("community_data")
    }
}

impl StoreConfig {
    /// Create config with custom base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let data_dir = base_dir.into();
        Self {
            database_path: Some(data_dir.join("community.sqlite")),
            local_dir: Some(data_dir.join("local")),
            export_dir: data_dir.join("exports"),
            data_dir,
            strategy: BackendStrategy::Transactional,
            key_prefix: "wangpu_".to_string(),
            sync_interval: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(5),
            local_quota_bytes: Some(5 * 1024 * 1024),
            auto_export_interval: None,
        }
    }

    /// Nothing touches the disk except exports.
    pub fn in_memory() -> Self {
        Self {
            database_path: None,
            local_dir: None,
            ..Self::with_base_dir(std::env::temp_dir().join("community_store"))
        }
    }

    /// Build from `COMMUNITY_STORE_ROOT`, `COMMUNITY_STORE_FALLBACK_ONLY`,
    /// `COMMUNITY_STORE_SYNC_SECS` and `COMMUNITY_STORE_AUTO_EXPORT_MINS`.
    pub fn from_env() -> Self {
        let root = std::env::var("COMMUNITY_STORE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("community_data"));
        let mut config = Self::with_base_dir(root);

        if let Ok(val) = std::env::var("COMMUNITY_STORE_FALLBACK_ONLY") {
            if matches!(val.as_str(), "1" | "true" | "yes") {
                config.strategy = BackendStrategy::FallbackOnly;
            }
        }

        if let Some(secs) = std::env::var("COMMUNITY_STORE_SYNC_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.sync_interval = Duration::from_secs(secs);
        }

        config.auto_export_interval = std::env::var("COMMUNITY_STORE_AUTO_EXPORT_MINS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|mins| *mins > 0)
            .map(|mins| Duration::from_secs(mins * 60));

        config
    }

    pub fn fallback_only(mut self) -> Self {
        self.strategy = BackendStrategy::FallbackOnly;
        self
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.export_dir).await?;
        if let Some(local_dir) = &self.local_dir {
            tokio::fs::create_dir_all(local_dir).await?;
        }
        if let Some(parent) = self.database_path.as_ref().and_then(|p| p.parent()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}
