//! Reconciliation between the local store and the transactional store
//!
//! * `push` copies local collections into the database, resolving each record
//!   against the stored copy by revision, and fans embedded conversation
//!   messages out into the `messages` table.
//! * `pull` overwrites local collections with the database contents and puts
//!   the `messages` rows back into their conversations.
//!
//! Neither direction ever runs when the database is unusable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::models::{Collection, Record};
use crate::store::{Storage, TransactionalStore};

/// Collections pushed, in order. `messages` is derived from conversations.
pub const PUSH_ORDER: [Collection; 6] = [
    Collection::Users,
    Collection::Posts,
    Collection::Announcements,
    Collection::Files,
    Collection::Votes,
    Collection::Conversations,
];

const MESSAGES_FIELD: &str = "messages";
const CONVERSATION_ID_FIELD: &str = "conversationId";

/// What one push or pull did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The database was unusable and nothing ran
    pub skipped: bool,
    pub synced: Vec<Collection>,
    pub failed: Vec<(Collection, String)>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed.is_empty()
    }

    fn record(&mut self, collection: Collection, result: StorageResult<usize>, direction: &str) {
        match result {
            Ok(count) => {
                debug!("[Sync] {} {}: {} records", direction, collection, count);
                self.synced.push(collection);
            }
            Err(e) => {
                warn!("[Sync] {} {} failed: {}", direction, collection, e);
                self.failed.push((collection, e.to_string()));
            }
        }
    }
}

pub struct SyncEngine {
    storage: Arc<Storage>,
}

impl SyncEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    fn usable_primary(&self) -> Option<&TransactionalStore> {
        self.storage
            .primary()
            .filter(|p| p.is_usable())
            .map(Arc::as_ref)
    }

    /// Local to database.
    pub async fn push(&self) -> SyncReport {
        let Some(primary) = self.usable_primary() else {
            debug!("[Sync] Database unavailable, skipping push");
            return SyncReport::skipped();
        };

        let mut report = SyncReport::default();
        for collection in PUSH_ORDER {
            let records = self.storage.local().read_collection(collection);
            if records.is_empty() {
                continue;
            }

            let resolved = match resolve_against_primary(primary, collection, records).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    report.record(collection, Err(e), "push");
                    continue;
                }
            };

            let count = resolved.len();
            let result = primary
                .try_put_all(collection, &resolved)
                .await
                .map(|_| count);
            let pushed = result.is_ok();
            report.record(collection, result, "push");

            if pushed && collection == Collection::Conversations {
                let messages = decompose_messages(&resolved);
                if !messages.is_empty() {
                    let count = messages.len();
                    let result = primary
                        .try_put_all(Collection::Messages, &messages)
                        .await
                        .map(|_| count);
                    report.record(Collection::Messages, result, "push");
                }
            }
        }

        info!(
            "[Sync] Pushed {} collections to database ({} failed)",
            report.synced.len(),
            report.failed.len()
        );
        report
    }

    /// Database to local.
    pub async fn pull(&self) -> SyncReport {
        let Some(primary) = self.usable_primary() else {
            debug!("[Sync] Database unavailable, skipping pull");
            return SyncReport::skipped();
        };

        let local = self.storage.local();
        let mut report = SyncReport::default();

        for collection in Collection::ALL {
            if collection == Collection::Messages {
                continue;
            }
            match primary.try_get_all(collection).await {
                // A fresh database must not clobber existing local data.
                Ok(records) if records.is_empty() => {}
                Ok(records) => {
                    let count = records.len();
                    let result = local.write_collection(collection, &records).map(|_| count);
                    report.record(collection, result, "pull");
                }
                Err(e) => report.record(collection, Err(e), "pull"),
            }
        }

        match primary.try_get_all(Collection::Messages).await {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                let result = self.reattach_messages(messages);
                report.record(Collection::Messages, result, "pull");
            }
            Err(e) => report.record(Collection::Messages, Err(e), "pull"),
        }

        info!(
            "[Sync] Pulled {} collections from database ({} failed)",
            report.synced.len(),
            report.failed.len()
        );
        report
    }

    /// Append each message to its local conversation unless already there.
    fn reattach_messages(&self, messages: Vec<Record>) -> StorageResult<usize> {
        let local = self.storage.local();
        let mut conversations = local.read_collection(Collection::Conversations);
        if conversations.is_empty() {
            return Ok(0);
        }

        let mut by_conversation: HashMap<String, Vec<Record>> = HashMap::new();
        for message in messages {
            if let Some(conversation_id) = message.get_str(CONVERSATION_ID_FIELD) {
                by_conversation
                    .entry(conversation_id.to_string())
                    .or_default()
                    .push(message);
            }
        }

        let mut attached = 0;
        for conversation in conversations.iter_mut() {
            let Some(incoming) = conversation
                .id()
                .and_then(|id| by_conversation.remove(id))
            else {
                continue;
            };

            let mut list = conversation.embedded(MESSAGES_FIELD);
            let mut seen: HashSet<String> = list
                .iter()
                .filter_map(|m| m.id().map(String::from))
                .collect();
            let before = list.len();
            for message in incoming {
                if message.id().is_some_and(|id| seen.insert(id.to_string())) {
                    list.push(message);
                }
            }
            if list.len() > before {
                attached += list.len() - before;
                conversation.set_embedded(MESSAGES_FIELD, list);
            }
        }

        if attached > 0 {
            local.write_collection(Collection::Conversations, &conversations)?;
        }
        Ok(attached)
    }

    /// Push every `period` until `shutdown` turns true. The first push
    /// happens one full period after spawning.
    pub fn spawn_periodic(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("[Sync] Periodic push every {:?}", period);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        self.push().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("[Sync] Periodic push stopped");
        })
    }
}

/// Keep the stored record only when its revision is strictly newer.
async fn resolve_against_primary(
    primary: &TransactionalStore,
    collection: Collection,
    records: Vec<Record>,
) -> StorageResult<Vec<Record>> {
    let mut stored: HashMap<String, Record> = HashMap::new();
    for record in primary.try_get_all(collection).await? {
        if let Some(id) = record.id().map(String::from) {
            stored.insert(id, record);
        }
    }

    let mut resolved = Vec::with_capacity(records.len());
    for record in records {
        let Some(id) = record.id() else {
            warn!("[Sync] Skipping {} record without id", collection);
            continue;
        };
        match stored.remove(id) {
            Some(current) if is_newer(&current, &record) => resolved.push(current),
            _ => resolved.push(record),
        }
    }
    Ok(resolved)
}

fn is_newer(stored: &Record, local: &Record) -> bool {
    match (stored.revision(), local.revision()) {
        (Some(stored), Some(local)) => stored > local,
        _ => false,
    }
}

/// `{id, conversationId, ...message}` for every embedded message.
fn decompose_messages(conversations: &[Record]) -> Vec<Record> {
    let mut messages = Vec::new();
    for conversation in conversations {
        let Some(conversation_id) = conversation.id() else {
            continue;
        };
        for message in conversation.embedded(MESSAGES_FIELD) {
            if message.id().is_none() {
                continue;
            }
            let mut row = Record::new();
            row.set(CONVERSATION_ID_FIELD, conversation_id);
            row.merge(message);
            messages.push(row);
        }
    }
    messages
}
