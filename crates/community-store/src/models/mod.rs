use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::StorageError;

/// A named set of same-kind records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    Posts,
    Announcements,
    Conversations,
    Messages,
    Files,
    Votes,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Users,
        Collection::Posts,
        Collection::Announcements,
        Collection::Conversations,
        Collection::Messages,
        Collection::Files,
        Collection::Votes,
    ];

    /// Table name in the transactional store and key suffix in the local store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Posts => "posts",
            Collection::Announcements => "announcements",
            Collection::Conversations => "conversations",
            Collection::Messages => "messages",
            Collection::Files => "files",
            Collection::Votes => "votes",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection: {}", s))
    }
}

/// One persisted entity: a JSON object carrying a string `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut record = Self::new();
        record.set("id", id.into());
        record
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Set a field only when it is not present yet.
    pub fn set_default(&mut self, field: &str, value: impl Into<Value>) {
        if !self.0.contains_key(field) {
            self.0.insert(field.to_string(), value.into());
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Shallow merge: every field of `other` overwrites the field of `self`.
    pub fn merge(&mut self, other: Record) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Records embedded in an array field, e.g. a conversation's `messages`.
    pub fn embedded(&self, field: &str) -> Vec<Record> {
        match self.0.get(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| Record::try_from(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_embedded(&mut self, field: &str, records: Vec<Record>) {
        let items = records.into_iter().map(Record::into_value).collect();
        self.0.insert(field.to_string(), Value::Array(items));
    }

    /// `updatedAt` if present, else `createdAt`.
    pub fn revision(&self) -> Option<DateTime<Utc>> {
        self.get("updatedAt")
            .and_then(parse_timestamp)
            .or_else(|| self.get("createdAt").and_then(parse_timestamp))
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(StorageError::InvalidRecord),
        }
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Current time in the format records carry (`createdAt`, `updatedAt`).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_requires_object() {
        assert!(Record::try_from(json!([1, 2])).is_err());
        let record = Record::try_from(json!({"id": "7", "name": "x"})).unwrap();
        assert_eq!(record.id(), Some("7"));
    }

    #[test]
    fn test_numeric_id_is_not_an_id() {
        let record = Record::try_from(json!({"id": 7})).unwrap();
        assert_eq!(record.id(), None);
    }

    #[test]
    fn test_revision_prefers_updated_at() {
        let record = Record::try_from(json!({
            "id": "1",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-02-01T00:00:00Z"
        }))
        .unwrap();
        let revision = record.revision().unwrap();
        assert_eq!(revision.to_rfc3339(), "2024-02-01T00:00:00+00:00");
    }

    #[test]
    fn test_collection_round_trips_through_str() {
        for collection in Collection::ALL {
            assert_eq!(collection.as_str().parse::<Collection>().unwrap(), collection);
        }
        assert!("comments".parse::<Collection>().is_err());
    }
}
