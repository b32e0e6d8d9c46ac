//! # Error Handling
//!
//! Error types for PeerComm Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lookup Errors                                                     │
//! │  │   └── NotFound              - Entity expected but absent            │
//! │  │                                                                      │
//! │  ├── Storage Faults                                                    │
//! │  │   ├── StorageCorrupted      - Row holds an unreadable value         │
//! │  │   ├── DatabaseError         - Engine error, constraint violation    │
//! │  │   ├── Timeout               - Busy timeout elapsed                  │
//! │  │   └── InvalidInput          - Caller supplied a malformed value     │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      └── SerializationError    - JSON encode/decode failed             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Absence vs. Failure
//!
//! Components that treat absence as a contract violation (clients,
//! properties, single message lookups) return [`Error::NotFound`].
//! Components where absence is a normal answer (a single ephemeral key,
//! a session that is not established yet) return `Ok(None)` instead.
//!
//! Nothing in this crate retries. A [`Error::Timeout`] is reported as
//! recoverable so the caller can decide whether to try again.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for PeerComm Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of record an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// Generic key/value property
    Property,
    /// Self or peer client identity
    Client,
    /// Short-lived key owned by a client
    EphemeralKey,
    /// Pairwise message session
    Session,
    /// Persisted message envelope
    Message,
}

impl Entity {
    /// Lowercase name used in error messages and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Property => "property",
            Entity::Client => "client",
            Entity::EphemeralKey => "ephemeral key",
            Entity::Session => "session",
            Entity::Message => "message",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for PeerComm Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lookup Errors (400-403)
    // ========================================================================

    /// An entity the caller expected to exist is absent or soft-deleted
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of record was looked up
        entity: Entity,
        /// The identifier (or description of the lookup) that missed
        id: String,
    },

    // ========================================================================
    // Storage Faults (404-499)
    // ========================================================================

    /// A stored value could not be decoded
    #[error("Data corruption detected: {0}")]
    StorageCorrupted(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The engine did not get the database lock within the statement timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed caller input rejected before reaching the engine
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Build a [`Error::NotFound`] for the given entity and identifier
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Wrap an engine error with the entity, operation and identifier it
    /// happened on.
    ///
    /// Busy and locked errors become [`Error::Timeout`], undecodable
    /// column values become [`Error::StorageCorrupted`] and everything
    /// else becomes [`Error::DatabaseError`].
    pub fn storage(entity: Entity, operation: &str, id: &str, err: rusqlite::Error) -> Self {
        let context = format!("Failed to {} {} '{}': {}", operation, entity, id, err);
        if is_busy(&err) {
            Error::Timeout(context)
        } else if is_corrupt(&err) {
            Error::StorageCorrupted(context)
        } else {
            Error::DatabaseError(context)
        }
    }

    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 400-403: Lookup
    /// - 404-499: Storage faults
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 403,
            Error::StorageCorrupted(_) => 404,
            Error::DatabaseError(_) => 405,
            Error::Timeout(_) => 406,
            Error::InvalidInput(_) => 407,
            Error::SerializationError(_) => 902,
        }
    }

    /// True for the "expected entity is absent" kind
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for every failure coming from (or rejected before) the engine
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::StorageCorrupted(_)
                | Error::DatabaseError(_)
                | Error::Timeout(_)
                | Error::InvalidInput(_)
        )
    }

    /// Check if this error is recoverable
    ///
    /// Only timeouts qualify: the same call may succeed once the competing
    /// writer releases the database.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn is_corrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..)
    )
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            Error::Timeout(err.to_string())
        } else if is_corrupt(&err) {
            Error::StorageCorrupted(err.to_string())
        } else {
            Error::DatabaseError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_found(Entity::Client, "c1").code(), 403);
        assert_eq!(Error::StorageCorrupted("x".into()).code(), 404);
        assert_eq!(Error::DatabaseError("x".into()).code(), 405);
        assert_eq!(Error::Timeout("x".into()).code(), 406);
        assert_eq!(Error::InvalidInput("x".into()).code(), 407);
        assert_eq!(Error::SerializationError("x".into()).code(), 902);
    }

    #[test]
    fn test_fault_kinds() {
        let missing = Error::not_found(Entity::Message, "42");
        assert!(missing.is_not_found());
        assert!(!missing.is_storage_fault());

        let db = Error::DatabaseError("constraint failed".into());
        assert!(db.is_storage_fault());
        assert!(!db.is_not_found());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout("busy".into()).is_recoverable());
        assert!(!Error::DatabaseError("x".into()).is_recoverable());
        assert!(!Error::not_found(Entity::Property, "k").is_recoverable());
    }

    #[test]
    fn test_not_found_message_names_entity() {
        let err = Error::not_found(Entity::EphemeralKey, "key-1");
        assert_eq!(err.to_string(), "ephemeral key not found: key-1");
    }

    #[test]
    fn test_storage_context() {
        let err = Error::storage(
            Entity::Client,
            "update",
            "abc",
            rusqlite::Error::QueryReturnedNoRows,
        );
        assert!(matches!(err, Error::DatabaseError(_)));
        let msg = err.to_string();
        assert!(msg.contains("update client 'abc'"));
    }

    #[test]
    fn test_busy_maps_to_timeout() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err = Error::storage(Entity::Session, "create", "s1", busy);
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_decode_failure_is_corruption() {
        let bad = rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            "unknown key status 'lost'".into(),
        );
        let err = Error::storage(Entity::EphemeralKey, "read", "k1", bad);
        assert!(matches!(err, Error::StorageCorrupted(_)));
        assert!(err.is_storage_fault());
    }
}
