//! # Database Schema
//!
//! Every collection is a table of JSON documents keyed by `id`:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ <collection>                 │
//! ├──────────────────────────────┤
//! │ id   TEXT PRIMARY KEY        │
//! │ seq  INTEGER  (read order)   │
//! │ data TEXT     (JSON object)  │
//! └──────────────────────────────┘
//! ```
//!
//! Secondary indexes are expression indexes over `json_extract(data, '$.<field>')`.
//! The schema version lives in `PRAGMA user_version`. Migrations only ever
//! create what is missing.

use crate::models::Collection;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 2;

/// A secondary index over one field of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub collection: Collection,
    /// Logical name callers look the index up by
    pub name: &'static str,
    /// Record field the index covers
    pub field: &'static str,
    pub unique: bool,
}

impl IndexDef {
    /// SQLite index names are database-global, so they carry the table name.
    pub fn sql_name(&self) -> String {
        format!("{}_{}", self.collection.as_str(), self.name)
    }

    pub fn expression(&self) -> String {
        field_expression(self.field)
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.sql_name(),
            self.collection.as_str(),
            self.expression()
        )
    }
}

/// One step of the schema history.
#[derive(Debug)]
pub struct Migration {
    pub version: i64,
    pub collections: &'static [Collection],
    pub indexes: &'static [IndexDef],
}

pub const USERS_BY_USERNAME: IndexDef = IndexDef {
    collection: Collection::Users,
    name: "by_username",
    field: "username",
    unique: true,
};

pub const MESSAGES_BY_CONVERSATION: IndexDef = IndexDef {
    collection: Collection::Messages,
    name: "by_conversationId",
    field: "conversationId",
    unique: false,
};

pub const INDEXES: &[IndexDef] = &[USERS_BY_USERNAME, MESSAGES_BY_CONVERSATION];

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        collections: &[
            Collection::Users,
            Collection::Conversations,
            Collection::Posts,
            Collection::Announcements,
            Collection::Messages,
        ],
        indexes: &[USERS_BY_USERNAME, MESSAGES_BY_CONVERSATION],
    },
    Migration {
        version: 2,
        collections: &[Collection::Files, Collection::Votes],
        indexes: &[],
    },
];

pub fn create_table_sql(collection: Collection) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY NOT NULL,
            seq INTEGER NOT NULL,
            data TEXT NOT NULL
        )",
        collection.as_str()
    )
}

/// Migrations that move a database from `from` to `to`.
pub fn pending_migrations(from: i64, to: i64) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |m| m.version > from && m.version <= to)
}

pub fn find_index(collection: Collection, name: &str) -> Option<&'static IndexDef> {
    INDEXES
        .iter()
        .find(|idx| idx.collection == collection && idx.name == name)
}

/// Field names are interpolated into SQL, so only plain identifiers pass.
pub fn field_expression(field: &str) -> String {
    debug_assert!(is_plain_identifier(field));
    format!("json_extract(data, '$.{}')", field)
}

pub fn is_plain_identifier(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_collection_has_a_table() {
        for collection in Collection::ALL {
            assert!(
                MIGRATIONS.iter().any(|m| m.collections.contains(&collection)),
                "{} has no migration",
                collection
            );
        }
    }

    #[test]
    fn test_versions_are_increasing_and_end_at_current() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.last().copied(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_pending_migrations() {
        assert_eq!(pending_migrations(0, SCHEMA_VERSION).count(), 2);
        assert_eq!(pending_migrations(1, 2).map(|m| m.version).collect::<Vec<_>>(), vec![2]);
        assert_eq!(pending_migrations(2, 2).count(), 0);
    }

    #[test]
    fn test_index_sql() {
        assert_eq!(
            USERS_BY_USERNAME.create_sql(),
            "CREATE UNIQUE INDEX IF NOT EXISTS users_by_username ON users (json_extract(data, '$.username'))"
        );
        assert!(find_index(Collection::Messages, "by_conversationId").is_some());
        assert!(find_index(Collection::Users, "by_conversationId").is_none());
        assert!(INDEXES.iter().all(|idx| is_plain_identifier(idx.field)));
    }
}
