//! Storage module
//!
//! Two tiers behind one API: a SQLite transactional store and a synchronous
//! key-value fallback. [`Storage`] routes each call to whichever is usable.

mod facade;
mod local;
pub mod schema;
mod transactional;

pub use facade::{merge_by_id, Storage};
pub use local::{FileKv, KeyValueBackend, LocalStore, MemoryKv};
pub use transactional::{Readiness, TransactionalStore};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Outcome;
use crate::models::{Collection, Record};

/// Collection-level operations shared by every tier.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records in stored order.
    async fn get_all(&self, collection: Collection) -> Outcome<Vec<Record>>;

    async fn get_by_id(&self, collection: Collection, id: &str) -> Outcome<Option<Record>>;

    /// Insert or replace by id. Yields the stored id.
    async fn put(&self, collection: Collection, record: Record) -> Outcome<String>;

    /// Insert or replace every record atomically.
    async fn put_all(&self, collection: Collection, records: Vec<Record>) -> Outcome<()>;

    /// Deleting an absent id succeeds.
    async fn delete(&self, collection: Collection, id: &str) -> Outcome<()>;

    async fn get_by_indexed_field(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Outcome<Vec<Record>>;
}
