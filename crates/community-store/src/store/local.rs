//! Synchronous key-value fallback store
//!
//! Every collection is one JSON array stored under `<prefix><collection>`.
//! Nothing here suspends, so the transactional store can degrade into it
//! from inside its own failure paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Outcome, StorageError, StorageResult};
use crate::models::{Collection, Record};
use crate::store::schema;
use crate::store::RecordStore;

/// Raw string storage under string keys.
pub trait KeyValueBackend: Send + Sync {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove_item(&self, key: &str) -> StorageResult<()>;
}

/// One `<key>.json` file per key inside a directory.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe_name = key.replace(['/', '\\'], "_");
        self.dir.join(format!("{}.json", safe_name))
    }
}

impl KeyValueBackend for FileKv {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.key_path(key);
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        fs::write(&temp_path, value)?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local map, used for in-memory configurations and tests.
#[derive(Default)]
pub struct MemoryKv {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryKv {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Collection-level view over a [`KeyValueBackend`].
pub struct LocalStore {
    kv: Box<dyn KeyValueBackend>,
    prefix: String,
    quota: Option<usize>,
}

impl LocalStore {
    pub fn new(kv: Box<dyn KeyValueBackend>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            quota: None,
        }
    }

    /// File-backed when `local_dir` is set, in-memory otherwise.
    pub fn from_config(config: &StoreConfig) -> StorageResult<Self> {
        let kv: Box<dyn KeyValueBackend> = match &config.local_dir {
            Some(dir) => Box::new(FileKv::open(dir)?),
            None => Box::new(MemoryKv::new()),
        };
        Ok(Self::new(kv, config.key_prefix.clone()).with_quota(config.local_quota_bytes))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryKv::new()), "wangpu_")
    }

    pub fn with_quota(mut self, quota: Option<usize>) -> Self {
        self.quota = quota;
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    // --- raw keys ---

    pub fn get_item(&self, name: &str) -> Option<String> {
        match self.kv.get_item(&self.key(name)) {
            Ok(value) => value,
            Err(e) => {
                warn!("[Local] Failed to read {}: {}", name, e);
                None
            }
        }
    }

    pub fn set_item(&self, name: &str, value: &str) -> StorageResult<()> {
        let key = self.key(name);
        if let Some(limit) = self.quota {
            if value.len() > limit {
                return Err(StorageError::QuotaExceeded {
                    key,
                    size: value.len(),
                    limit,
                });
            }
        }
        self.kv.set_item(&key, value)
    }

    pub fn remove_item(&self, name: &str) -> StorageResult<()> {
        self.kv.remove_item(&self.key(name))
    }

    /// Parse a raw key as JSON; unreadable values read as absent.
    pub fn get_json(&self, name: &str) -> Option<Value> {
        let raw = self.get_item(name)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[Local] Discarding malformed value under {}: {}", name, e);
                None
            }
        }
    }

    pub fn set_json(&self, name: &str, value: &Value) -> StorageResult<()> {
        self.set_item(name, &serde_json::to_string(value)?)
    }

    // --- collections ---

    /// Records in stored order. Absent or corrupt data reads as empty.
    pub fn read_collection(&self, collection: Collection) -> Vec<Record> {
        match self.get_json(collection.as_str()) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| Record::try_from(item).ok())
                .collect(),
            Some(_) => {
                warn!("[Local] {} is not an array, treating as empty", collection);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Replace the whole stored sequence.
    pub fn write_collection(&self, collection: Collection, records: &[Record]) -> StorageResult<()> {
        let json = serde_json::to_string(records)?;
        self.set_item(collection.as_str(), &json)?;
        debug!("[Local] Wrote {} records to {}", records.len(), collection);
        Ok(())
    }

    /// Replace the record with the same id in place, or append it.
    pub fn upsert(&self, collection: Collection, record: Record) -> StorageResult<String> {
        let id = record.id().ok_or(StorageError::MissingId)?.to_string();
        let mut records = self.read_collection(collection);
        match records.iter().position(|r| r.id() == Some(id.as_str())) {
            Some(index) => records[index] = record,
            None => records.push(record),
        }
        self.write_collection(collection, &records)?;
        Ok(id)
    }

    /// Upsert a batch. Records not in the batch keep their order; the batch
    /// follows them in the given order.
    pub fn put_many(&self, collection: Collection, records: &[Record]) -> StorageResult<()> {
        let incoming = records
            .iter()
            .map(|r| r.id().ok_or(StorageError::MissingId))
            .collect::<StorageResult<HashSet<&str>>>()?;
        if records.is_empty() {
            return Ok(());
        }

        let mut merged: Vec<Record> = self
            .read_collection(collection)
            .into_iter()
            .filter(|r| r.id().map_or(true, |id| !incoming.contains(id)))
            .collect();
        merged.extend(records.iter().cloned());
        self.write_collection(collection, &merged)
    }

    /// Remove the record with `id`; absent ids are not an error.
    pub fn remove(&self, collection: Collection, id: &str) -> StorageResult<()> {
        let records = self.read_collection(collection);
        let before = records.len();
        let remaining: Vec<Record> = records.into_iter().filter(|r| r.id() != Some(id)).collect();
        if remaining.len() != before {
            self.write_collection(collection, &remaining)?;
        }
        Ok(())
    }

    pub fn get_by_id(&self, collection: Collection, id: &str) -> Option<Record> {
        self.read_collection(collection)
            .into_iter()
            .find(|r| r.id() == Some(id))
    }

    pub fn find_by_field(&self, collection: Collection, field: &str, value: &Value) -> Vec<Record> {
        self.read_collection(collection)
            .into_iter()
            .filter(|r| r.get(field) == Some(value))
            .collect()
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn get_all(&self, collection: Collection) -> Outcome<Vec<Record>> {
        Outcome::Fallback(self.read_collection(collection))
    }

    async fn get_by_id(&self, collection: Collection, id: &str) -> Outcome<Option<Record>> {
        Outcome::Fallback(LocalStore::get_by_id(self, collection, id))
    }

    async fn put(&self, collection: Collection, record: Record) -> Outcome<String> {
        Outcome::from_fallback(self.upsert(collection, record))
    }

    async fn put_all(&self, collection: Collection, records: Vec<Record>) -> Outcome<()> {
        match self.put_many(collection, &records) {
            Err(StorageError::MissingId) => Outcome::Failed(StorageError::MissingId),
            result => Outcome::from_fallback(result),
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> Outcome<()> {
        Outcome::from_fallback(self.remove(collection, id))
    }

    async fn get_by_indexed_field(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Outcome<Vec<Record>> {
        match schema::find_index(collection, index) {
            Some(def) => Outcome::Fallback(self.find_by_field(collection, def.field, value)),
            None => Outcome::Failed(StorageError::UnknownIndex {
                collection,
                index: index.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let store = LocalStore::in_memory();
        store.upsert(Collection::Posts, record(json!({"id": "1", "title": "a"}))).unwrap();
        store.upsert(Collection::Posts, record(json!({"id": "2", "title": "b"}))).unwrap();
        store.upsert(Collection::Posts, record(json!({"id": "1", "title": "c"}))).unwrap();

        let posts = store.read_collection(Collection::Posts);
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id(), Some("1"));
        assert_eq!(posts[0].get_str("title"), Some("c"));
        assert_eq!(posts[1].id(), Some("2"));
    }

    #[test]
    fn test_put_many_keeps_unlisted_records() {
        let store = LocalStore::in_memory();
        for id in ["1", "2", "3"] {
            store.upsert(Collection::Posts, Record::with_id(id)).unwrap();
        }

        let mut edited = Record::with_id("1");
        edited.set("title", "edited");
        store
            .put_many(Collection::Posts, &[Record::with_id("4"), edited])
            .unwrap();

        let posts = store.read_collection(Collection::Posts);
        let ids: Vec<&str> = posts.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["2", "3", "4", "1"]);
        assert_eq!(posts[3].get_str("title"), Some("edited"));

        let err = store
            .put_many(Collection::Posts, &[record(json!({"title": "no id"}))])
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingId));
        assert_eq!(store.read_collection(Collection::Posts).len(), 4);
    }

    #[test]
    fn test_concurrent_file_writes_to_one_key() {
        let temp_dir = TempDir::new().unwrap();
        let kv = FileKv::open(temp_dir.path()).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| kv.set_item("wangpu_votes", "[]").unwrap());
            }
        });
        kv.set_item("wangpu_votes", r#"[{"id":"v1"}]"#).unwrap();

        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["wangpu_votes.json"]);
        assert_eq!(kv.get_item("wangpu_votes").unwrap().as_deref(), Some(r#"[{"id":"v1"}]"#));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = LocalStore::in_memory();
        store.upsert(Collection::Files, record(json!({"id": "f1"}))).unwrap();
        store.remove(Collection::Files, "f1").unwrap();
        store.remove(Collection::Files, "f1").unwrap();
        store.remove(Collection::Files, "never-existed").unwrap();
        assert!(store.read_collection(Collection::Files).is_empty());
    }

    #[test]
    fn test_corrupt_collection_reads_empty() {
        let store = LocalStore::in_memory();
        store.set_item("users", "{ malformed json ...").unwrap();
        assert!(store.read_collection(Collection::Users).is_empty());

        store.set_item("users", r#"{"id": "1"}"#).unwrap();
        assert!(store.read_collection(Collection::Users).is_empty());
    }

    #[test]
    fn test_upsert_without_id_fails() {
        let store = LocalStore::in_memory();
        let err = store.upsert(Collection::Votes, record(json!({"title": "x"}))).unwrap_err();
        assert!(matches!(err, StorageError::MissingId));
    }

    #[test]
    fn test_quota_exceeded() {
        let store = LocalStore::in_memory().with_quota(Some(16));
        let big = record(json!({"id": "1", "content": "a much longer body than sixteen bytes"}));
        let err = store.upsert(Collection::Posts, big).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert!(store.read_collection(Collection::Posts).is_empty());
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = LocalStore::new(Box::new(FileKv::open(temp_dir.path()).unwrap()), "wangpu_");
            store
                .upsert(Collection::Announcements, record(json!({"id": "1", "title": "hi"})))
                .unwrap();
        }

        assert!(temp_dir.path().join("wangpu_announcements.json").exists());

        let store = LocalStore::new(Box::new(FileKv::open(temp_dir.path()).unwrap()), "wangpu_");
        let found = store.get_by_id(Collection::Announcements, "1").unwrap();
        assert_eq!(found.get_str("title"), Some("hi"));
    }

    #[tokio::test]
    async fn test_indexed_read_scans_field() {
        let store = LocalStore::in_memory();
        store
            .upsert(Collection::Users, record(json!({"id": "1", "username": "admin"})))
            .unwrap();
        store
            .upsert(Collection::Users, record(json!({"id": "2", "username": "li"})))
            .unwrap();

        let found = RecordStore::get_by_indexed_field(&store, Collection::Users, "by_username", &json!("li"))
            .await
            .unwrap_or_default();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), Some("2"));

        let unknown =
            RecordStore::get_by_indexed_field(&store, Collection::Users, "by_email", &json!("x")).await;
        assert!(unknown.is_failed());
    }
}
