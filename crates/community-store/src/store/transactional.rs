//! SQLite-backed transactional store
//!
//! Asynchronous, indexed and schema-versioned. Successful writes are mirrored
//! into the [`LocalStore`]. Every public operation falls back to it when the
//! database is unavailable or the call fails, and reports that through
//! [`Outcome::Fallback`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{BackendStrategy, StoreConfig};
use crate::error::{ErrorKind, Outcome, StorageError, StorageResult};
use crate::models::{Collection, Record};
use crate::store::local::LocalStore;
use crate::store::schema::{self, SCHEMA_VERSION};
use crate::store::RecordStore;

/// Open state of the transactional store. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Unavailable,
}

impl Readiness {
    pub fn is_terminal(&self) -> bool {
        *self != Readiness::Pending
    }
}

pub struct TransactionalStore {
    config: StoreConfig,
    local: Arc<LocalStore>,
    /// The single persistent connection handle
    pool: RwLock<Option<SqlitePool>>,
    readiness: watch::Sender<Readiness>,
    open_lock: Mutex<()>,
}

impl TransactionalStore {
    pub fn new(config: StoreConfig, local: Arc<LocalStore>) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            config,
            local,
            pool: RwLock::new(None),
            readiness,
            open_lock: Mutex::new(()),
        }
    }

    /// Connect and bring the schema up to date.
    ///
    /// Resolves readiness in every case. A failed open is permanent: later
    /// calls return the recorded state without retrying.
    pub async fn open(&self) -> Readiness {
        let _guard = self.open_lock.lock().await;

        let current = self.readiness();
        if current.is_terminal() {
            return current;
        }

        let state = match self.config.strategy {
            BackendStrategy::FallbackOnly => {
                warn!("[Store] Transactional engine disabled, using local fallback only");
                Readiness::Unavailable
            }
            BackendStrategy::Transactional => match self.connect().await {
                Ok(pool) => {
                    *self.pool.write() = Some(pool);
                    info!(
                        "[Store] Database ready at {}",
                        self.config
                            .database_path
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| ":memory:".to_string())
                    );
                    Readiness::Ready
                }
                Err(e) => {
                    error!("[Store] Failed to open database, using local fallback: {}", e);
                    Readiness::Unavailable
                }
            },
        };

        self.readiness.send_replace(state);
        state
    }

    async fn connect(&self) -> StorageResult<SqlitePool> {
        let options = match &self.config.database_path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };

        // One connection that never expires, so an in-memory database
        // survives for the lifetime of the store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let current = match read_version(&pool).await {
            Ok(version) => version,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        if current > SCHEMA_VERSION {
            warn!(
                "[Store] Database schema v{} is newer than v{}, opening as is",
                current, SCHEMA_VERSION
            );
        } else if current < SCHEMA_VERSION {
            if let Err(e) = upgrade_schema(&pool, current, SCHEMA_VERSION).await {
                pool.close().await;
                return Err(e);
            }
        }

        Ok(pool)
    }

    /// Create every collection and index introduced after `from` up to `to`.
    ///
    /// Never drops or renames anything and re-indexes existing indexes, so
    /// repeated calls leave records and index entries unchanged.
    pub async fn upgrade(&self, from: i64, to: i64) -> StorageResult<()> {
        let pool = self.pool()?;
        upgrade_schema(&pool, from, to).await
    }

    pub async fn schema_version(&self) -> StorageResult<i64> {
        let pool = self.pool()?;
        read_version(&pool).await
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Whether calls can currently reach the database.
    pub fn is_usable(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Wait until `open` has reached a terminal state.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => Readiness::Unavailable,
        };
        state
    }

    /// Close the connection. Later calls are served by the local store.
    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("[Store] Database connection closed");
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    fn pool(&self) -> StorageResult<SqlitePool> {
        self.pool.read().clone().ok_or(StorageError::Unavailable)
    }

    // --- raw operations, no local mirroring ---

    pub(crate) async fn try_get_all(&self, collection: Collection) -> StorageResult<Vec<Record>> {
        let pool = self.pool()?;
        let sql = format!("SELECT data FROM {} ORDER BY seq, id", collection.as_str());
        let rows = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&pool)
            .await?;
        Ok(decode_rows(collection, rows))
    }

    pub(crate) async fn try_get_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        let pool = self.pool()?;
        let sql = format!("SELECT data FROM {} WHERE id = ?", collection.as_str());
        let row = sqlx::query_scalar::<_, String>(&sql)
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        Ok(row.and_then(|raw| decode_rows(collection, vec![raw]).pop()))
    }

    pub(crate) async fn try_put(&self, collection: Collection, record: &Record) -> StorageResult<String> {
        let id = record.id().ok_or(StorageError::MissingId)?.to_string();
        let pool = self.pool()?;
        let table = collection.as_str();
        let sql = format!(
            "INSERT INTO {table} (id, seq, data) \
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM {table}), ?) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(serde_json::to_string(record)?)
            .execute(&pool)
            .await?;
        debug!("[Store] Saved {}/{}", collection, id);
        Ok(id)
    }

    /// All records in one transaction, re-sequenced in the given order.
    pub(crate) async fn try_put_all(&self, collection: Collection, records: &[Record]) -> StorageResult<()> {
        if records.iter().any(|r| r.id().is_none()) {
            return Err(StorageError::MissingId);
        }
        if records.is_empty() {
            return Ok(());
        }

        let pool = self.pool()?;
        let table = collection.as_str();
        let mut tx = pool.begin().await?;

        let base = sqlx::query_scalar::<_, i64>(&format!("SELECT COALESCE(MAX(seq), 0) FROM {table}"))
            .fetch_one(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO {table} (id, seq, data) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, data = excluded.data"
        );
        for (offset, record) in records.iter().enumerate() {
            sqlx::query(&sql)
                .bind(record.id())
                .bind(base + offset as i64 + 1)
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("[Store] Saved {} records to {}", records.len(), collection);
        Ok(())
    }

    pub(crate) async fn try_delete(&self, collection: Collection, id: &str) -> StorageResult<()> {
        let pool = self.pool()?;
        let sql = format!("DELETE FROM {} WHERE id = ?", collection.as_str());
        sqlx::query(&sql).bind(id).execute(&pool).await?;
        Ok(())
    }

    pub(crate) async fn try_get_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> StorageResult<Vec<Record>> {
        let def = schema::find_index(collection, index).ok_or_else(|| StorageError::UnknownIndex {
            collection,
            index: index.to_string(),
        })?;
        let pool = self.pool()?;
        let sql = format!(
            "SELECT data FROM {} WHERE {} = ? ORDER BY seq, id",
            collection.as_str(),
            def.expression()
        );

        let query = sqlx::query_scalar::<_, String>(&sql);
        let query = match value {
            Value::String(s) => query.bind(s.clone()),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            other => return Err(StorageError::UnsupportedIndexValue(other.to_string())),
        };

        let rows = query.fetch_all(&pool).await?;
        Ok(decode_rows(collection, rows))
    }
}

/// Keep the local copy current after a successful database write.
fn mirror(op: &str, collection: Collection, result: StorageResult<()>) {
    if let Err(e) = result {
        warn!("[Store] {} on {} not mirrored to local store: {}", op, collection, e);
    }
}

fn log_degraded(op: &str, collection: Collection, err: &StorageError) {
    match err.kind() {
        ErrorKind::BackendUnavailable => {
            debug!("[Store] {} on {} served by local fallback", op, collection)
        }
        _ => warn!(
            "[Store] {} on {} failed, falling back to local store: {}",
            op, collection, err
        ),
    }
}

/// Rows that fail to parse are dropped, never raised.
fn decode_rows(collection: Collection, rows: Vec<String>) -> Vec<Record> {
    rows.into_iter()
        .filter_map(|raw| match serde_json::from_str::<Record>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("[Store] Skipping malformed row in {}: {}", collection, e);
                None
            }
        })
        .collect()
}

async fn read_version(pool: &SqlitePool) -> StorageResult<i64> {
    let version = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

async fn upgrade_schema(pool: &SqlitePool, from: i64, to: i64) -> StorageResult<()> {
    if to > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "target version {} is newer than known version {}",
            to, SCHEMA_VERSION
        )));
    }

    let stored = read_version(pool).await?;
    let mut tx = pool.begin().await?;

    for migration in schema::pending_migrations(from, to) {
        for collection in migration.collections {
            sqlx::query(&schema::create_table_sql(*collection))
                .execute(&mut *tx)
                .await?;
        }
        for index in migration.indexes {
            sqlx::query(&index.create_sql()).execute(&mut *tx).await?;
        }
        debug!("[Store] Applied schema v{}", migration.version);
    }

    // Index entries are derived data: rebuild them on every upgrade.
    for migration in schema::MIGRATIONS.iter().filter(|m| m.version <= to) {
        for index in migration.indexes {
            sqlx::query(&format!("REINDEX {}", index.sql_name()))
                .execute(&mut *tx)
                .await?;
        }
    }

    if to > stored {
        sqlx::query(&format!("PRAGMA user_version = {}", to))
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    info!("[Store] Schema upgraded v{} -> v{}", from, to);
    Ok(())
}

#[async_trait]
impl RecordStore for TransactionalStore {
    async fn get_all(&self, collection: Collection) -> Outcome<Vec<Record>> {
        match self.try_get_all(collection).await {
            Ok(records) => Outcome::Primary(records),
            Err(e) => {
                log_degraded("get_all", collection, &e);
                Outcome::Fallback(self.local.read_collection(collection))
            }
        }
    }

    async fn get_by_id(&self, collection: Collection, id: &str) -> Outcome<Option<Record>> {
        match self.try_get_by_id(collection, id).await {
            Ok(record) => Outcome::Primary(record),
            Err(e) => {
                log_degraded("get_by_id", collection, &e);
                Outcome::Fallback(self.local.get_by_id(collection, id))
            }
        }
    }

    async fn put(&self, collection: Collection, record: Record) -> Outcome<String> {
        match self.try_put(collection, &record).await {
            Ok(id) => {
                mirror("put", collection, self.local.upsert(collection, record).map(|_| ()));
                Outcome::Primary(id)
            }
            Err(e) => {
                log_degraded("put", collection, &e);
                Outcome::from_fallback(self.local.upsert(collection, record))
            }
        }
    }

    async fn put_all(&self, collection: Collection, records: Vec<Record>) -> Outcome<()> {
        match self.try_put_all(collection, &records).await {
            Ok(()) => {
                mirror("put_all", collection, self.local.put_many(collection, &records));
                Outcome::Primary(())
            }
            Err(StorageError::MissingId) => Outcome::Failed(StorageError::MissingId),
            Err(e) => {
                log_degraded("put_all", collection, &e);
                Outcome::from_fallback(self.local.put_many(collection, &records))
            }
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> Outcome<()> {
        match self.try_delete(collection, id).await {
            Ok(()) => {
                mirror("delete", collection, self.local.remove(collection, id));
                Outcome::Primary(())
            }
            Err(e) => {
                log_degraded("delete", collection, &e);
                Outcome::from_fallback(self.local.remove(collection, id))
            }
        }
    }

    async fn get_by_indexed_field(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Outcome<Vec<Record>> {
        match self.try_get_by_index(collection, index, value).await {
            Ok(records) => Outcome::Primary(records),
            Err(e @ StorageError::UnknownIndex { .. }) | Err(e @ StorageError::UnsupportedIndexValue(_)) => {
                Outcome::Failed(e)
            }
            Err(e) => {
                log_degraded("get_by_indexed_field", collection, &e);
                RecordStore::get_by_indexed_field(&*self.local, collection, index, value).await
            }
        }
    }
}
