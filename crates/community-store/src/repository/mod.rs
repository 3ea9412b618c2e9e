//! Domain repository
//!
//! Users, session, posts, announcements, conversations, files and votes on
//! top of [`Storage`]. Storage failures are logged and turned into the
//! operation's empty value; only user creation reports errors.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{protect_credentials, CredentialHasher};
use crate::error::{Outcome, StorageError};
use crate::models::{now_timestamp, Collection, Record};
use crate::store::schema::{MESSAGES_BY_CONVERSATION, USERS_BY_USERNAME};
use crate::store::Storage;

const INITIALIZED_KEY: &str = "initialized";
const CURRENT_USER_ID_KEY: &str = "currentUserId";
const CURRENT_USER_KEY: &str = "currentUser";

pub const DEFAULT_ADMIN_ID: &str = "1";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Repository {
    storage: Arc<Storage>,
    hasher: Arc<dyn CredentialHasher>,
}

/// Log a failed outcome and yield its fallback value.
fn settle<T: Default>(op: &str, outcome: Outcome<T>) -> T {
    if let Some(e) = outcome.error() {
        warn!("[Repo] {} failed: {}", op, e);
    }
    outcome.unwrap_or_default()
}

/// One more than the largest numeric id, as a string.
fn next_numeric_id(records: &[Record]) -> String {
    let max = records
        .iter()
        .filter_map(|r| r.id().and_then(|id| id.parse::<u64>().ok()))
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn ids_of(records: &[Record]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|r| r.id().map(String::from))
        .collect()
}

impl Repository {
    pub fn new(storage: Arc<Storage>, hasher: Arc<dyn CredentialHasher>) -> Self {
        Self { storage, hasher }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Seed default data on first run. Returns whether seeding ran.
    pub async fn init(&self) -> bool {
        let local = self.storage.local();
        if local.get_item(INITIALIZED_KEY).is_some() {
            return false;
        }

        if self.user_by_username(DEFAULT_ADMIN_USERNAME).await.is_none() {
            let admin = Record::try_from(json!({
                "id": DEFAULT_ADMIN_ID,
                "username": DEFAULT_ADMIN_USERNAME,
                "password": DEFAULT_ADMIN_PASSWORD,
                "name": "Administrator",
                "role": "admin",
                "avatar": null,
                "avatarData": null,
                "bio": "System administrator"
            }));
            match admin {
                Ok(admin) => {
                    if let Err(e) = self.add_user(admin).await {
                        warn!("[Repo] Failed to seed admin user: {}", e);
                    }
                }
                Err(e) => warn!("[Repo] Invalid admin seed: {}", e),
            }
        }

        if self.posts().await.is_empty() {
            let mut welcome = Record::with_id("1");
            welcome.set("title", "Welcome to the community");
            welcome.set(
                "content",
                "Welcome to the school community! Please follow the community guidelines.",
            );
            welcome.set("authorId", DEFAULT_ADMIN_ID);
            welcome.set("authorName", "Administrator");
            self.add_post(welcome).await;
        }

        if self.announcements().await.is_empty() {
            let mut launch = Record::with_id("1");
            launch.set("title", "Community platform is live");
            launch.set(
                "content",
                "The platform is now open. Register an account to get started.",
            );
            self.add_announcement(launch).await;
        }

        if let Err(e) = local.set_item(INITIALIZED_KEY, "true") {
            warn!("[Repo] Failed to mark store initialized: {}", e);
        }
        info!("[Repo] Seeded default data");
        true
    }

    // --- users ---

    pub async fn users(&self) -> Vec<Record> {
        settle("users", self.storage.get_all(Collection::Users).await)
    }

    pub async fn user_by_id(&self, id: &str) -> Option<Record> {
        settle("user_by_id", self.storage.get_by_id(Collection::Users, id).await)
    }

    pub async fn user_by_username(&self, username: &str) -> Option<Record> {
        let found = self
            .storage
            .get_by_indexed_field(Collection::Users, USERS_BY_USERNAME.name, &json!(username))
            .await;
        settle("user_by_username", found).into_iter().next()
    }

    /// Store a new user. Assigns the next numeric id when none is given and
    /// never persists a plaintext password.
    pub async fn add_user(&self, mut user: Record) -> Result<Record, RepositoryError> {
        if let Some(username) = user.get_str("username").map(String::from) {
            if self.user_by_username(&username).await.is_some() {
                return Err(RepositoryError::UsernameTaken(username));
            }
        }

        if user.id().is_none() {
            let users = self.users().await;
            user.set("id", next_numeric_id(&users));
        }
        user.set_default("createdAt", now_timestamp());
        protect_credentials(&mut user, self.hasher.as_ref());

        let id = self
            .storage
            .put(Collection::Users, user.clone())
            .await
            .into_result()?;
        debug!("[Repo] Added user {}", id);
        Ok(user)
    }

    /// Merge `changes` into the user. `false` if the user does not exist.
    pub async fn update_user(&self, id: &str, mut changes: Record) -> bool {
        let Some(mut user) = self.user_by_id(id).await else {
            return false;
        };
        changes.remove("id");
        if changes.contains("password") && !changes.contains("salt") {
            user.remove("salt");
        }
        user.merge(changes);
        user.set("updatedAt", now_timestamp());
        protect_credentials(&mut user, self.hasher.as_ref());

        let saved = self.storage.put(Collection::Users, user.clone()).await;
        if let Some(e) = saved.error() {
            warn!("[Repo] Failed to update user {}: {}", id, e);
            return false;
        }

        if self.current_user_id().as_deref() == Some(id) {
            self.cache_current_user(&user);
        }
        true
    }

    // --- session ---

    fn current_user_id(&self) -> Option<String> {
        self.storage.local().get_item(CURRENT_USER_ID_KEY)
    }

    fn cache_current_user(&self, user: &Record) {
        let local = self.storage.local();
        if let Err(e) = local.set_json(CURRENT_USER_KEY, &user.clone().into_value()) {
            warn!("[Repo] Failed to cache current user: {}", e);
        }
    }

    /// The signed-in user, served from the cache when it matches.
    pub async fn current_user(&self) -> Option<Record> {
        let id = self.current_user_id()?;

        let cached = self
            .storage
            .local()
            .get_json(CURRENT_USER_KEY)
            .and_then(|value| Record::try_from(value).ok());
        if let Some(user) = cached.filter(|u| u.id() == Some(id.as_str())) {
            return Some(user);
        }

        let user = self.user_by_id(&id).await?;
        self.cache_current_user(&user);
        Some(user)
    }

    pub async fn set_current_user(&self, id: &str) -> bool {
        let Some(user) = self.user_by_id(id).await else {
            return false;
        };
        if let Err(e) = self.storage.local().set_item(CURRENT_USER_ID_KEY, id) {
            warn!("[Repo] Failed to store current user id: {}", e);
            return false;
        }
        self.cache_current_user(&user);
        true
    }

    pub fn clear_current_user(&self) {
        let local = self.storage.local();
        for key in [CURRENT_USER_ID_KEY, CURRENT_USER_KEY] {
            if let Err(e) = local.remove_item(key) {
                warn!("[Repo] Failed to clear {}: {}", key, e);
            }
        }
    }

    // --- posts and announcements ---

    pub async fn posts(&self) -> Vec<Record> {
        settle("posts", self.storage.get_all(Collection::Posts).await)
    }

    /// New posts go first.
    pub async fn add_post(&self, mut post: Record) -> Record {
        let mut posts = self.posts().await;
        if post.id().is_none() {
            post.set("id", next_numeric_id(&posts));
        }
        post.set_default("createdAt", now_timestamp());
        post.set_default("likes", 0);
        post.set_default("comments", Value::Array(Vec::new()));

        self.prepend(Collection::Posts, &mut posts, post.clone()).await;
        post
    }

    pub async fn announcements(&self) -> Vec<Record> {
        settle("announcements", self.storage.get_all(Collection::Announcements).await)
    }

    pub async fn add_announcement(&self, mut announcement: Record) -> Record {
        let mut announcements = self.announcements().await;
        if announcement.id().is_none() {
            announcement.set("id", next_numeric_id(&announcements));
        }
        announcement.set_default("createdAt", now_timestamp());

        self.prepend(Collection::Announcements, &mut announcements, announcement.clone())
            .await;
        announcement
    }

    async fn prepend(&self, collection: Collection, records: &mut Vec<Record>, record: Record) {
        records.retain(|r| r.id() != record.id());
        records.insert(0, record);
        settle(
            "prepend",
            self.storage.put_all(collection, std::mem::take(records)).await,
        );
    }

    // --- conversations ---

    pub async fn conversations(&self) -> Vec<Record> {
        settle("conversations", self.storage.get_all(Collection::Conversations).await)
    }

    pub async fn conversation_by_id(&self, id: &str) -> Option<Record> {
        settle(
            "conversation_by_id",
            self.storage.get_by_id(Collection::Conversations, id).await,
        )
    }

    /// Insert or replace a conversation, assigning an id when missing.
    pub async fn save_conversation(&self, mut conversation: Record) -> Option<String> {
        if conversation.id().is_none() {
            conversation.set("id", Uuid::new_v4().to_string());
        }
        conversation.set_default("createdAt", now_timestamp());
        self.storage
            .put(Collection::Conversations, conversation)
            .await
            .value()
    }

    /// Embedded messages followed by any decomposed message rows not
    /// already embedded.
    pub async fn messages_for_conversation(&self, conversation_id: &str) -> Vec<Record> {
        let mut messages = self
            .conversation_by_id(conversation_id)
            .await
            .map(|c| c.embedded("messages"))
            .unwrap_or_default();
        let mut seen = ids_of(&messages);

        let rows = self
            .storage
            .get_by_indexed_field(
                Collection::Messages,
                MESSAGES_BY_CONVERSATION.name,
                &json!(conversation_id),
            )
            .await;
        for row in settle("messages_for_conversation", rows) {
            if row.id().is_some_and(|id| seen.insert(id.to_string())) {
                messages.push(row);
            }
        }
        messages
    }

    /// Remove a conversation and its decomposed message rows.
    pub async fn delete_conversation(&self, id: &str) -> bool {
        let rows = self
            .storage
            .get_by_indexed_field(Collection::Messages, MESSAGES_BY_CONVERSATION.name, &json!(id))
            .await;
        for row in settle("delete_conversation", rows) {
            if let Some(message_id) = row.id() {
                settle(
                    "delete_message",
                    self.storage.delete(Collection::Messages, message_id).await,
                );
            }
        }
        self.storage
            .delete(Collection::Conversations, id)
            .await
            .succeeded()
    }

    // --- files ---

    pub async fn files(&self) -> Vec<Record> {
        settle("files", self.storage.get_all(Collection::Files).await)
    }

    pub async fn add_file(&self, mut file: Record) -> Record {
        if file.id().is_none() {
            let files = self.files().await;
            file.set("id", next_numeric_id(&files));
        }
        file.set_default("createdAt", now_timestamp());
        settle("add_file", self.storage.put(Collection::Files, file.clone()).await);
        file
    }

    /// Always succeeds, present or not.
    pub async fn delete_file(&self, id: &str) -> bool {
        settle("delete_file", self.storage.delete(Collection::Files, id).await);
        true
    }

    // --- votes ---

    pub async fn votes(&self) -> Vec<Record> {
        settle("votes", self.storage.get_all(Collection::Votes).await)
    }

    pub async fn vote_by_id(&self, id: &str) -> Option<Record> {
        settle("vote_by_id", self.storage.get_by_id(Collection::Votes, id).await)
    }

    /// Merge into an existing vote with the same id, or store a new one.
    pub async fn save_vote(&self, vote: Record) -> Option<Record> {
        let id = vote.id()?.to_string();
        let merged = match self.vote_by_id(&id).await {
            Some(mut existing) => {
                existing.merge(vote);
                existing
            }
            None => vote,
        };
        settle("save_vote", self.storage.put(Collection::Votes, merged.clone()).await);
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{verify_credentials, Sha256Hasher};
    use crate::config::StoreConfig;
    use crate::store::{LocalStore, TransactionalStore};

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    async fn repository(fallback_only: bool) -> Repository {
        let mut config = StoreConfig::in_memory();
        if fallback_only {
            config = config.fallback_only();
        }
        let local = Arc::new(LocalStore::in_memory());
        let primary = Arc::new(TransactionalStore::new(config.clone(), local.clone()));
        primary.open().await;
        let storage = Arc::new(Storage::new(&config, Some(primary), local));
        Repository::new(storage, Arc::new(Sha256Hasher))
    }

    #[tokio::test]
    async fn test_init_seeds_once() {
        let repo = repository(false).await;
        assert!(repo.init().await);
        assert!(!repo.init().await);

        let admin = repo.user_by_username("admin").await.unwrap();
        assert_eq!(admin.id(), Some("1"));
        assert_eq!(admin.get_str("role"), Some("admin"));
        assert_ne!(admin.get_str("password"), Some("admin123"));
        assert!(verify_credentials(&admin, "admin123", &Sha256Hasher));

        assert_eq!(repo.posts().await.len(), 1);
        assert_eq!(repo.announcements().await.len(), 1);
        assert_eq!(repo.users().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_user_assigns_next_id() {
        for fallback_only in [false, true] {
            let repo = repository(fallback_only).await;
            repo.init().await;

            let user = repo
                .add_user(record(json!({"username": "li", "password": "pass1234"})))
                .await
                .unwrap();
            assert_eq!(user.id(), Some("2"));
            assert!(user.contains("createdAt"));
            assert!(user.contains("salt"));

            let taken = repo
                .add_user(record(json!({"username": "li", "password": "other123"})))
                .await;
            assert!(matches!(taken, Err(RepositoryError::UsernameTaken(_))));
        }
    }

    #[tokio::test]
    async fn test_update_refreshes_current_user() {
        let repo = repository(false).await;
        repo.init().await;

        assert!(!repo.set_current_user("99").await);
        assert!(repo.set_current_user("1").await);
        assert!(repo.update_user("1", record(json!({"bio": "updated"}))).await);
        assert!(!repo.update_user("99", record(json!({"bio": "x"}))).await);

        let current = repo.current_user().await.unwrap();
        assert_eq!(current.get_str("bio"), Some("updated"));
        assert!(current.contains("updatedAt"));

        repo.clear_current_user();
        assert!(repo.current_user().await.is_none());
    }

    #[tokio::test]
    async fn test_posts_newest_first() {
        let repo = repository(false).await;
        repo.init().await;
        let post = repo.add_post(record(json!({"title": "second"}))).await;
        assert_eq!(post.id(), Some("2"));
        assert_eq!(post.get("likes"), Some(&json!(0)));

        let titles: Vec<String> = repo
            .posts()
            .await
            .iter()
            .filter_map(|p| p.get_str("title").map(String::from))
            .collect();
        assert_eq!(titles[0], "second");
        assert_eq!(titles.len(), 2);
    }

    #[tokio::test]
    async fn test_conversation_messages_and_delete() {
        let repo = repository(false).await;
        let id = repo
            .save_conversation(record(json!({
                "participants": ["1", "2"],
                "messages": [{"id": "m1", "sender": "1", "content": "hi"}]
            })))
            .await
            .unwrap();

        repo.storage()
            .put(
                Collection::Messages,
                record(json!({"id": "m2", "conversationId": id, "sender": "2"})),
            )
            .await;
        repo.storage()
            .put(
                Collection::Messages,
                record(json!({"id": "m1", "conversationId": id, "sender": "1"})),
            )
            .await;

        let messages = repo.messages_for_conversation(&id).await;
        let ids: Vec<&str> = messages.iter().filter_map(Record::id).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        assert!(repo.delete_conversation(&id).await);
        assert!(repo.conversation_by_id(&id).await.is_none());
        assert!(repo.messages_for_conversation(&id).await.is_empty());
    }

    #[tokio::test]
    async fn test_files_and_votes() {
        let repo = repository(true).await;
        let file = repo.add_file(record(json!({"name": "notes.pdf"}))).await;
        assert_eq!(file.id(), Some("1"));
        assert!(repo.delete_file("1").await);
        assert!(repo.delete_file("1").await);
        assert!(repo.files().await.is_empty());

        repo.save_vote(record(json!({"id": "v1", "title": "Trip", "options": ["a", "b"]})))
            .await;
        repo.save_vote(record(json!({"id": "v1", "closed": true}))).await;
        let vote = repo.vote_by_id("v1").await.unwrap();
        assert_eq!(vote.get_str("title"), Some("Trip"));
        assert_eq!(vote.get("closed"), Some(&json!(true)));
        assert_eq!(repo.votes().await.len(), 1);
    }
}
