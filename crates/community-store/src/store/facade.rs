//! Unified storage facade
//!
//! Callers never pick a backend. Each call waits (bounded) for the
//! transactional store to finish opening, then goes to it when usable and to
//! the local store otherwise.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::Outcome;
use crate::models::{Collection, Record};
use crate::store::{LocalStore, RecordStore, TransactionalStore};

pub struct Storage {
    primary: Option<Arc<TransactionalStore>>,
    local: Arc<LocalStore>,
    ready_timeout: Duration,
}

impl Storage {
    /// `primary` is `None` when running fallback-only.
    pub fn new(
        config: &StoreConfig,
        primary: Option<Arc<TransactionalStore>>,
        local: Arc<LocalStore>,
    ) -> Self {
        Self {
            primary,
            local,
            ready_timeout: config.ready_timeout,
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn primary(&self) -> Option<&Arc<TransactionalStore>> {
        self.primary.as_ref()
    }

    /// Whether calls currently reach the transactional store.
    pub fn is_primary_active(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| p.is_usable())
    }

    async fn backend(&self) -> &dyn RecordStore {
        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.ready_timeout, primary.wait_ready()).await {
                Ok(_) if primary.is_usable() => return &**primary,
                Ok(state) => debug!("[Store] Database {:?}, routing to local store", state),
                Err(_) => warn!(
                    "[Store] Database not ready after {:?}, routing this call to local store",
                    self.ready_timeout
                ),
            }
        }
        &*self.local
    }

    pub async fn get_all(&self, collection: Collection) -> Outcome<Vec<Record>> {
        self.backend().await.get_all(collection).await
    }

    pub async fn get_by_id(&self, collection: Collection, id: &str) -> Outcome<Option<Record>> {
        self.backend().await.get_by_id(collection, id).await
    }

    pub async fn put(&self, collection: Collection, record: Record) -> Outcome<String> {
        self.backend().await.put(collection, record).await
    }

    pub async fn put_all(&self, collection: Collection, records: Vec<Record>) -> Outcome<()> {
        self.backend().await.put_all(collection, records).await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Outcome<()> {
        self.backend().await.delete(collection, id).await
    }

    pub async fn get_by_indexed_field(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Outcome<Vec<Record>> {
        self.backend()
            .await
            .get_by_indexed_field(collection, index, value)
            .await
    }

    /// Merge `incoming` into a collection, keeping existing records on id
    /// conflicts. Yields the number of records added.
    pub async fn merge_into(&self, collection: Collection, incoming: Vec<Record>) -> Outcome<usize> {
        let existing = self.get_all(collection).await.unwrap_or_default();
        let before = existing.len();
        let merged = merge_by_id(existing, incoming);
        let added = merged.len() - before;
        if added == 0 {
            return if self.is_primary_active() {
                Outcome::Primary(0)
            } else {
                Outcome::Fallback(0)
            };
        }
        self.put_all(collection, merged).await.map(|_| added)
    }
}

/// First writer wins: existing records keep their place, unseen incoming
/// records are appended in order, incoming records without an id are dropped.
pub fn merge_by_id(existing: Vec<Record>, incoming: Vec<Record>) -> Vec<Record> {
    let mut seen: HashSet<String> = existing
        .iter()
        .filter_map(|r| r.id().map(String::from))
        .collect();
    let mut merged = existing;
    for record in incoming {
        let Some(id) = record.id() else { continue };
        if seen.insert(id.to_string()) {
            merged.push(record);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Readiness;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(Record::id).collect()
    }

    async fn storage(fallback_only: bool) -> Storage {
        let mut config = StoreConfig::in_memory();
        if fallback_only {
            config = config.fallback_only();
        }
        let local = Arc::new(LocalStore::in_memory());
        let primary = Arc::new(TransactionalStore::new(config.clone(), local.clone()));
        primary.open().await;
        Storage::new(&config, Some(primary), local)
    }

    #[test]
    fn test_merge_first_writer_wins() {
        let existing = vec![
            record(json!({"id": "1", "name": "kept"})),
            record(json!({"id": "2"})),
        ];
        let incoming = vec![
            record(json!({"id": "1", "name": "ignored"})),
            record(json!({"name": "no id"})),
            record(json!({"id": "3"})),
        ];
        let merged = merge_by_id(existing, incoming);
        assert_eq!(ids(&merged), vec!["1", "2", "3"]);
        assert_eq!(merged[0].get_str("name"), Some("kept"));
    }

    #[tokio::test]
    async fn test_routes_to_primary_when_ready() {
        let storage = storage(false).await;
        assert!(storage.is_primary_active());
        let outcome = storage.put(Collection::Posts, Record::with_id("p1")).await;
        assert!(outcome.is_primary());
        assert_eq!(ids(&storage.local().read_collection(Collection::Posts)), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_put_all_agrees_across_backends() {
        let mut results = Vec::new();
        for fallback_only in [false, true] {
            let storage = storage(fallback_only).await;
            for id in ["1", "2"] {
                storage.put(Collection::Conversations, Record::with_id(id)).await;
            }
            storage
                .put_all(
                    Collection::Conversations,
                    vec![Record::with_id("3"), Record::with_id("1")],
                )
                .await;

            let all = storage.get_all(Collection::Conversations).await.unwrap_or_default();
            results.push(ids(&all).into_iter().map(String::from).collect::<Vec<_>>());
        }

        assert_eq!(results[0], vec!["2", "3", "1"]);
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn test_backends_agree() {
        for fallback_only in [false, true] {
            let storage = storage(fallback_only).await;
            assert_eq!(storage.is_primary_active(), !fallback_only);

            storage
                .put(Collection::Users, record(json!({"id": "1", "username": "admin"})))
                .await;
            storage
                .put(Collection::Users, record(json!({"id": "2", "username": "li"})))
                .await;
            storage
                .put(Collection::Users, record(json!({"id": "1", "username": "root"})))
                .await;
            storage.delete(Collection::Users, "missing").await;

            let users = storage.get_all(Collection::Users).await;
            assert_eq!(users.is_primary(), !fallback_only);
            let users = users.unwrap_or_default();
            assert_eq!(ids(&users), vec!["1", "2"]);
            assert_eq!(users[0].get_str("username"), Some("root"));

            let by_name = storage
                .get_by_indexed_field(Collection::Users, "by_username", &json!("li"))
                .await
                .unwrap_or_default();
            assert_eq!(ids(&by_name), vec!["2"]);
        }
    }

    #[tokio::test]
    async fn test_pending_primary_times_out_to_local() {
        let mut config = StoreConfig::in_memory();
        config.ready_timeout = Duration::from_millis(20);
        let local = Arc::new(LocalStore::in_memory());
        let primary = Arc::new(TransactionalStore::new(config.clone(), local.clone()));
        let storage = Storage::new(&config, Some(primary.clone()), local);

        let outcome = storage.put(Collection::Files, Record::with_id("f1")).await;
        assert!(outcome.is_fallback());
        // A timeout does not decide readiness.
        assert_eq!(primary.readiness(), Readiness::Pending);
    }

    #[tokio::test]
    async fn test_merge_into_counts_added() {
        let storage = storage(false).await;
        storage.put(Collection::Users, Record::with_id("1")).await;

        let added = storage
            .merge_into(
                Collection::Users,
                vec![Record::with_id("1"), Record::with_id("2"), Record::with_id("3")],
            )
            .await;
        assert_eq!(added.value(), Some(2));

        let again = storage
            .merge_into(Collection::Users, vec![Record::with_id("2")])
            .await;
        assert!(again.is_primary());
        assert_eq!(again.value(), Some(0));
    }
}
