//! Chat data export and import
//!
//! Export documents bundle conversations, the users taking part in them and
//! message statistics. They are written as pretty JSON under the export
//! directory, and every written export is remembered in a short history.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{now_timestamp, parse_timestamp, Collection, Record};
use crate::store::Storage;

pub const EXPORT_VERSION: &str = "1.0";
pub const HISTORY_LIMIT: usize = 20;
const HISTORY_KEY: &str = "export_history";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid export document: {0}")]
    InvalidFormat(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMeta {
    pub export_time: String,
    pub version: String,
    pub total_conversations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_by: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_time: Option<String>,
}

impl ExportMeta {
    fn new(total_conversations: usize) -> Self {
        Self {
            export_time: now_timestamp(),
            version: EXPORT_VERSION.to_string(),
            total_conversations,
            exported_by: None,
            target_user: None,
            days: None,
            cutoff_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatistics {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub messages_per_conversation: f64,
    pub message_count_by_user: BTreeMap<String, usize>,
    /// Messages per `YYYY/M/D` day
    pub conversations_by_date: BTreeMap<String, usize>,
    pub export_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub meta: ExportMeta,
    pub conversations: Vec<Record>,
    pub users: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ChatStatistics>,
}

/// One entry of the export history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub file_name: String,
    pub file_path: PathBuf,
    pub conversations_count: usize,
    pub export_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub conversations: usize,
    pub users_added: usize,
}

pub struct Exporter {
    storage: Arc<Storage>,
    export_dir: PathBuf,
}

fn participates(conversation: &Record, user_id: &str) -> bool {
    match conversation.get("participants") {
        Some(Value::Array(ids)) => ids.iter().any(|id| id.as_str() == Some(user_id)),
        _ => false,
    }
}

fn participants_of(conversations: &[Record]) -> HashSet<String> {
    conversations
        .iter()
        .filter_map(|c| match c.get("participants") {
            Some(Value::Array(ids)) => Some(ids.iter().filter_map(Value::as_str).map(String::from)),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Message counts per sender and per day.
pub fn statistics(conversations: &[Record]) -> ChatStatistics {
    let mut total_messages = 0;
    let mut message_count_by_user: BTreeMap<String, usize> = BTreeMap::new();
    let mut conversations_by_date: BTreeMap<String, usize> = BTreeMap::new();

    for conversation in conversations {
        let messages = conversation.embedded("messages");
        total_messages += messages.len();

        for message in &messages {
            let sender = message.get_str("sender").unwrap_or("unknown");
            *message_count_by_user.entry(sender.to_string()).or_default() += 1;

            if let Some(at) = message.get("timestamp").and_then(parse_timestamp) {
                let date = at.format("%Y/%-m/%-d").to_string();
                *conversations_by_date.entry(date).or_default() += 1;
            }
        }
    }

    let messages_per_conversation = if conversations.is_empty() {
        0.0
    } else {
        (total_messages as f64 / conversations.len() as f64 * 100.0).round() / 100.0
    };

    ChatStatistics {
        total_conversations: conversations.len(),
        total_messages,
        messages_per_conversation,
        message_count_by_user,
        conversations_by_date,
        export_time: now_timestamp(),
    }
}

/// `chat_data_2025-01-31T10-00-00-000Z.json` style names.
fn timestamped_name(stem: &str) -> String {
    format!("{}_{}.json", stem, now_timestamp().replace([':', '.'], "-"))
}

impl Exporter {
    pub fn new(storage: Arc<Storage>, export_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            export_dir: export_dir.into(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    async fn load(&self, collection: Collection) -> Vec<Record> {
        let outcome = self.storage.get_all(collection).await;
        if let Some(e) = outcome.error() {
            warn!("[Export] Failed to read {}: {}", collection, e);
        }
        outcome.unwrap_or_default()
    }

    /// Every conversation and user, with statistics.
    pub async fn export_all(&self, exported_by: Option<Value>) -> ExportDocument {
        let conversations = self.load(Collection::Conversations).await;
        let users = self.load(Collection::Users).await;

        let mut meta = ExportMeta::new(conversations.len());
        meta.exported_by = Some(exported_by.unwrap_or_else(|| Value::from("system")));

        ExportDocument {
            meta,
            statistics: Some(statistics(&conversations)),
            conversations,
            users,
        }
    }

    /// Conversations `user_id` takes part in and the users involved.
    pub async fn export_for_user(&self, user_id: &str) -> Result<ExportDocument, ExportError> {
        let users = self.load(Collection::Users).await;
        let target = users
            .iter()
            .find(|u| u.id() == Some(user_id))
            .cloned()
            .ok_or_else(|| ExportError::UserNotFound(user_id.to_string()))?;

        let conversations: Vec<Record> = self
            .load(Collection::Conversations)
            .await
            .into_iter()
            .filter(|c| participates(c, user_id))
            .collect();
        let involved = participants_of(&conversations);
        let users = users
            .into_iter()
            .filter(|u| u.id().is_some_and(|id| id == user_id || involved.contains(id)))
            .collect();

        let mut meta = ExportMeta::new(conversations.len());
        meta.target_user = Some(target);

        Ok(ExportDocument {
            meta,
            conversations,
            users,
            statistics: None,
        })
    }

    /// Conversations whose last message is at most `days` old.
    pub async fn export_recent(&self, days: i64) -> ExportDocument {
        let cutoff = Utc::now() - ChronoDuration::days(days);

        let conversations: Vec<Record> = self
            .load(Collection::Conversations)
            .await
            .into_iter()
            .filter(|c| {
                c.embedded("messages")
                    .last()
                    .and_then(|m| m.get("timestamp").and_then(parse_timestamp))
                    .is_some_and(|at| at >= cutoff)
            })
            .collect();
        let involved = participants_of(&conversations);
        let users = self
            .load(Collection::Users)
            .await
            .into_iter()
            .filter(|u| u.id().is_some_and(|id| involved.contains(id)))
            .collect();

        let mut meta = ExportMeta::new(conversations.len());
        meta.days = Some(days);
        meta.cutoff_time = Some(cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));

        ExportDocument {
            meta,
            conversations,
            users,
            statistics: None,
        }
    }

    /// Write `doc` as pretty JSON and record it in the history.
    pub async fn write_document(
        &self,
        doc: &ExportDocument,
        file_name: Option<&str>,
    ) -> Result<ExportRecord, ExportError> {
        let file_name = file_name
            .map(String::from)
            .unwrap_or_else(|| timestamped_name("chat_data"));
        let path = self.export_dir.join(&file_name);
        let temp_path = self.export_dir.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::create_dir_all(&self.export_dir).await?;
        let json = serde_json::to_string_pretty(doc)?;
        fs::write(&temp_path, json).await?;

        // Atomic rename
        fs::rename(&temp_path, &path).await?;

        let record = ExportRecord {
            file_name,
            file_path: path,
            conversations_count: doc.conversations.len(),
            export_time: doc.meta.export_time.clone(),
        };
        self.remember(record.clone());
        info!("[Export] Wrote {}", record.file_path.display());
        Ok(record)
    }

    /// Newest first.
    pub fn history(&self) -> Vec<ExportRecord> {
        self.storage
            .local()
            .get_json(HISTORY_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    fn remember(&self, record: ExportRecord) {
        let mut history = self.history();
        history.insert(0, record);
        history.truncate(HISTORY_LIMIT);

        let stored = serde_json::to_value(&history)
            .map_err(StorageError::from)
            .and_then(|value| self.storage.local().set_json(HISTORY_KEY, &value));
        if let Err(e) = stored {
            warn!("[Export] Failed to update export history: {}", e);
        }
    }

    pub fn clear_history(&self) {
        if let Err(e) = self.storage.local().remove_item(HISTORY_KEY) {
            warn!("[Export] Failed to clear export history: {}", e);
        }
    }

    /// Load an export document. Conversations are upserted; users are merged,
    /// keeping existing users on id conflicts.
    pub async fn import(&self, json: &str) -> Result<ImportSummary, ExportError> {
        let doc: Value = serde_json::from_str(json)
            .map_err(|e| ExportError::InvalidFormat(e.to_string()))?;

        let conversations = match doc.get("conversations") {
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(Record::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ExportError::InvalidFormat("conversation is not an object".into()))?,
            _ => {
                return Err(ExportError::InvalidFormat(
                    "missing conversations array".into(),
                ))
            }
        };
        if conversations.iter().any(|c| c.id().is_none()) {
            return Err(ExportError::InvalidFormat("conversation without id".into()));
        }

        let users: Vec<Record> = match doc.get("users") {
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .filter_map(|item| Record::try_from(item).ok())
                .collect(),
            _ => Vec::new(),
        };

        let imported = conversations.len();
        if !conversations.is_empty() {
            self.storage
                .put_all(Collection::Conversations, conversations)
                .await
                .into_result()?;
        }

        let users_added = if users.is_empty() {
            0
        } else {
            self.storage
                .merge_into(Collection::Users, users)
                .await
                .into_result()?
        };

        info!(
            "[Export] Imported {} conversations, {} new users",
            imported, users_added
        );
        Ok(ImportSummary {
            conversations: imported,
            users_added,
        })
    }

    /// Write a full export every `period` until `shutdown` turns true.
    pub fn spawn_auto_export(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("[Export] Auto export every {:?}", period);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let doc = self.export_all(None).await;
                        if let Err(e) = self.write_document(&doc, None).await {
                            warn!("[Export] Auto export failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::LocalStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn exporter(dir: &Path) -> Exporter {
        let config = StoreConfig::in_memory().fallback_only();
        let storage = Arc::new(Storage::new(&config, None, Arc::new(LocalStore::in_memory())));
        Exporter::new(storage, dir)
    }

    async fn seed(exporter: &Exporter) {
        let storage = &exporter.storage;
        for user in [
            json!({"id": "1", "username": "admin"}),
            json!({"id": "2", "username": "li"}),
            json!({"id": "3", "username": "wang"}),
        ] {
            storage.put(Collection::Users, record(user)).await;
        }
        let recent = now_timestamp();
        storage
            .put(
                Collection::Conversations,
                record(json!({
                    "id": "c1",
                    "participants": ["1", "2"],
                    "messages": [
                        {"id": "m1", "sender": "1", "timestamp": "2024-03-05T08:00:00Z"},
                        {"id": "m2", "sender": "2", "timestamp": "2024-03-05T09:00:00Z"},
                        {"id": "m3", "sender": "1", "timestamp": recent}
                    ]
                })),
            )
            .await;
        storage
            .put(
                Collection::Conversations,
                record(json!({
                    "id": "c2",
                    "participants": ["1", "3"],
                    "messages": [{"id": "m4", "sender": "3", "timestamp": "2024-03-06T08:00:00Z"}]
                })),
            )
            .await;
    }

    #[test]
    fn test_statistics() {
        let conversations = vec![
            record(json!({"id": "a", "messages": [
                {"sender": "1", "timestamp": "2024-03-05T08:00:00Z"},
                {"sender": "2", "timestamp": "2024-03-05T09:00:00Z"}
            ]})),
            record(json!({"id": "b", "messages": [{"sender": "1", "timestamp": "2024-12-25T08:00:00Z"}]})),
            record(json!({"id": "c"})),
        ];
        let stats = statistics(&conversations);
        assert_eq!(stats.total_conversations, 3);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.messages_per_conversation, 1.0);
        assert_eq!(stats.message_count_by_user.get("1"), Some(&2));
        assert_eq!(stats.conversations_by_date.get("2024/3/5"), Some(&2));
        assert_eq!(stats.conversations_by_date.get("2024/12/25"), Some(&1));

        let two_of_three = statistics(&conversations[1..]);
        assert_eq!(two_of_three.messages_per_conversation, 0.5);
        assert_eq!(statistics(&[]).messages_per_conversation, 0.0);
    }

    #[tokio::test]
    async fn test_export_for_user() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = exporter(temp_dir.path());
        seed(&exporter).await;

        let doc = exporter.export_for_user("2").await.unwrap();
        assert_eq!(doc.meta.total_conversations, 1);
        let user_ids: Vec<&str> = doc.users.iter().filter_map(Record::id).collect();
        assert_eq!(user_ids, vec!["1", "2"]);

        assert!(matches!(
            exporter.export_for_user("42").await,
            Err(ExportError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_export_recent() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = exporter(temp_dir.path());
        seed(&exporter).await;

        let doc = exporter.export_recent(7).await;
        assert_eq!(doc.meta.days, Some(7));
        assert!(doc.meta.cutoff_time.is_some());
        assert_eq!(doc.conversations.len(), 1);
        assert_eq!(doc.conversations[0].id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_write_and_history() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = exporter(temp_dir.path());
        seed(&exporter).await;

        let doc = exporter.export_all(None).await;
        assert_eq!(doc.meta.exported_by, Some(json!("system")));
        assert_eq!(doc.statistics.as_ref().map(|s| s.total_messages), Some(4));

        for i in 0..(HISTORY_LIMIT + 2) {
            let name = format!("export_{}.json", i);
            exporter.write_document(&doc, Some(&name)).await.unwrap();
        }

        let history = exporter.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].file_name, format!("export_{}.json", HISTORY_LIMIT + 1));

        let written = std::fs::read_to_string(temp_dir.path().join("export_0.json")).unwrap();
        let parsed: ExportDocument = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, doc);

        exporter.clear_history();
        assert!(exporter.history().is_empty());
    }

    #[tokio::test]
    async fn test_import() {
        let temp_dir = TempDir::new().unwrap();
        let exporter = exporter(temp_dir.path());
        seed(&exporter).await;

        assert!(matches!(
            exporter.import("{ not json").await,
            Err(ExportError::InvalidFormat(_))
        ));
        assert!(matches!(
            exporter.import(r#"{"users": []}"#).await,
            Err(ExportError::InvalidFormat(_))
        ));

        let doc = json!({
            "conversations": [{"id": "c9", "participants": ["1", "4"], "messages": []}],
            "users": [
                {"id": "1", "username": "replaced?"},
                {"id": "4", "username": "zhao"}
            ]
        });
        let summary = exporter.import(&doc.to_string()).await.unwrap();
        assert_eq!(summary, ImportSummary { conversations: 1, users_added: 1 });

        let admin = exporter
            .storage
            .get_by_id(Collection::Users, "1")
            .await
            .unwrap_or_default()
            .unwrap();
        assert_eq!(admin.get_str("username"), Some("admin"));
        assert_eq!(
            exporter.storage.get_all(Collection::Conversations).await.unwrap_or_default().len(),
            3
        );
    }
}
