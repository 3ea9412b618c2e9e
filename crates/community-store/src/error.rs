//! Storage errors and the two-tier operation outcome.

use thiserror::Error;

use crate::models::Collection;

/// Result type for raw storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised inside the storage core.
///
/// None of these reach callers of the facade directly: they are folded into
/// an [`Outcome`] with a defined fallback value.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The transactional engine is missing or failed to open.
    #[error("transactional backend unavailable")]
    Unavailable,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("quota exceeded for {key}: {size} bytes (limit {limit})")]
    QuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("record has no string id")]
    MissingId,

    #[error("invalid record: expected a JSON object")]
    InvalidRecord,

    #[error("unknown index {index} on {collection}")]
    UnknownIndex { collection: Collection, index: String },

    #[error("unsupported index value: {0}")]
    UnsupportedIndexValue(String),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Coarse failure classes used for logging and routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Permanent for the session; everything goes to the fallback store.
    BackendUnavailable,
    /// Transient; this one call is served by the fallback store.
    OperationFailed,
    /// Stored data could not be parsed; treated as absent.
    MalformedData,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Unavailable => ErrorKind::BackendUnavailable,
            StorageError::Serialization(_) | StorageError::InvalidRecord => {
                ErrorKind::MalformedData
            }
            _ => ErrorKind::OperationFailed,
        }
    }
}

/// Result of a public storage operation.
///
/// `Primary` means the transactional store served the call. `Fallback` means
/// the local key-value store served it, either because it is the selected
/// backend or because the primary was unavailable or failed. `Failed` means
/// neither could serve it; [`Outcome::unwrap_or_default`] still yields a
/// usable value.
#[derive(Debug)]
pub enum Outcome<T> {
    Primary(T),
    Fallback(T),
    Failed(StorageError),
}

impl<T> Outcome<T> {
    pub fn is_primary(&self) -> bool {
        matches!(self, Outcome::Primary(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Outcome::Fallback(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Whether the operation succeeded through either tier.
    pub fn succeeded(&self) -> bool {
        !self.is_failed()
    }

    /// The value, regardless of which tier produced it.
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Primary(v) | Outcome::Fallback(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    /// The value only if the primary served the call. A degraded result
    /// reads as `None`.
    pub fn primary(self) -> Option<T> {
        match self {
            Outcome::Primary(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StorageError> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.value().unwrap_or(default)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Primary(v) => Outcome::Primary(f(v)),
            Outcome::Fallback(v) => Outcome::Fallback(f(v)),
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }

    /// Drop the tier, keep the error.
    pub fn into_result(self) -> StorageResult<T> {
        match self {
            Outcome::Primary(v) | Outcome::Fallback(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
        }
    }

    /// Build a fallback-tier outcome from a raw local result.
    pub fn from_fallback(result: StorageResult<T>) -> Self {
        match result {
            Ok(v) => Outcome::Fallback(v),
            Err(e) => Outcome::Failed(e),
        }
    }
}

impl<T: Default> Outcome<T> {
    /// The value, or the operation's defined fallback value on failure.
    pub fn unwrap_or_default(self) -> T {
        self.value().unwrap_or_default()
    }
}
