//! # Messages
//!
//! Persisted message envelopes. Content is opaque ciphertext written once;
//! afterwards only the read and deleted flags change.
//!
//! ## Lazy Session Bootstrap
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE CREATE FLOW                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  NewMessage { session, envelope fields, content }                      │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌──────────────────┐   no    ┌──────────────────────────┐             │
//! │  │ session stored?  │────────►│ insert session from the  │             │
//! │  └────────┬─────────┘         │ embedded descriptor      │             │
//! │           │ yes               └────────────┬─────────────┘             │
//! │           ▼                                ▼                            │
//! │  ┌──────────────────────────────────────────────────────┐              │
//! │  │ insert message, return engine-assigned id            │              │
//! │  └──────────────────────────────────────────────────────┘              │
//! │                                                                         │
//! │  Both steps share one transaction.                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every message read is joined with the current state of its session.

use rusqlite::{params, Connection, Row, ToSql};
use serde::{Deserialize, Serialize};

use super::database::{atomically, Handle};
use super::sessions::{self, MessageSession, SessionPhase};
use crate::error::{Entity, Error, Result};

/// A stored message with its session snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Engine-assigned id, increasing with insertion order
    pub id: i64,
    /// Session the message belongs to
    pub session_id: String,
    /// Sending client
    pub source_client_id: String,
    /// Sender's ephemeral key
    pub source_key_id: String,
    /// Receiving client
    pub destination_client_id: String,
    /// Receiver's ephemeral key
    pub destination_key_id: String,
    /// Envelope protocol version
    pub protocol_version: String,
    /// Position in the sender's sequence
    pub sequence: i64,
    /// Application-level message type
    pub message_type: String,
    /// Opaque content
    pub content: String,
    /// Last write (Unix seconds)
    pub modified_at: i64,
    /// Read flag
    pub is_read: bool,
    /// Soft-delete flag
    pub deleted: bool,
    /// Current state of the session
    pub session: MessageSession,
}

/// A message to store
///
/// The session descriptor is inserted first if the session does not exist
/// yet. The message is always filed under the descriptor's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Session the message belongs to
    pub session: MessageSession,
    /// Sending client
    pub source_client_id: String,
    /// Sender's ephemeral key
    pub source_key_id: String,
    /// Receiving client
    pub destination_client_id: String,
    /// Receiver's ephemeral key
    pub destination_key_id: String,
    /// Envelope protocol version
    pub protocol_version: String,
    /// Position in the sender's sequence
    pub sequence: i64,
    /// Application-level message type
    pub message_type: String,
    /// Opaque content
    pub content: String,
}

impl NewMessage {
    /// Id of the session the message will be filed under
    pub fn session_id(&self) -> &str {
        &self.session.id
    }
}

/// Filter for [`MessageStore::list`]
///
/// Every field that is set must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFilter {
    /// Only messages of this session
    pub session_id: Option<String>,
    /// Only messages of this type
    pub message_type: Option<String>,
    /// Only messages whose session is in this phase
    pub phase: Option<SessionPhase>,
    /// Include messages already read
    pub include_read: bool,
    /// Include soft-deleted messages
    pub include_deleted: bool,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            session_id: None,
            message_type: None,
            phase: None,
            include_read: true,
            include_deleted: false,
        }
    }
}

impl MessageFilter {
    /// Restrict to one session
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Restrict to one message type
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Restrict to sessions in one phase
    pub fn phase(mut self, phase: SessionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Skip messages already read
    pub fn unread_only(mut self) -> Self {
        self.include_read = false;
        self
    }

    /// Also return soft-deleted messages
    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Message repository
#[derive(Clone, Copy)]
pub struct MessageStore<'a> {
    handle: Handle<'a>,
}

impl<'a> MessageStore<'a> {
    pub(crate) fn new(handle: Handle<'a>) -> Self {
        Self { handle }
    }

    /// Get a message; fails with NotFound if unknown or soft-deleted
    pub fn get(&self, id: i64) -> Result<Message> {
        self.handle.run(|conn| find(conn, id, false))
    }

    /// Get a message even if it has been soft-deleted
    pub fn get_including_deleted(&self, id: i64) -> Result<Message> {
        self.handle.run(|conn| find(conn, id, true))
    }

    /// Messages matching `filter`, ordered by id
    pub fn list(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(session_id) = &filter.session_id {
            conditions.push("m.session_id = ?");
            param_values.push(Box::new(session_id.clone()));
        }

        if let Some(message_type) = &filter.message_type {
            conditions.push("m.message_type = ?");
            param_values.push(Box::new(message_type.clone()));
        }

        if let Some(phase) = filter.phase {
            conditions.push("s.phase = ?");
            param_values.push(Box::new(phase));
        }

        if !filter.include_read {
            conditions.push("m.is_read = 0");
        }

        if !filter.include_deleted {
            conditions.push("m.deleted = 0");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!("{} {} ORDER BY m.id", SELECT_JOINED, where_clause);
        let params: Vec<&dyn ToSql> = param_values.iter().map(|v| v.as_ref()).collect();

        self.handle.run(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

            let messages = stmt
                .query_map(params.as_slice(), read_message)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| Error::storage(Entity::Message, "list", "*", e))?;

            Ok(messages)
        })
    }

    /// Store a message, creating its session first if needed
    ///
    /// Returns the id assigned to the message.
    pub fn create(&self, message: &NewMessage) -> Result<i64> {
        super::require_id("session", message.session_id())?;
        self.handle.run(|conn| atomically(conn, |conn| insert(conn, message)))
    }

    /// Set both flags of a message
    pub fn update_flags(&self, id: i64, is_read: bool, is_deleted: bool) -> Result<()> {
        self.set_flags(id, "is_read = ?, deleted = ?", &[&is_read, &is_deleted])
    }

    /// Soft-delete a message, keeping its read flag
    pub fn delete(&self, id: i64) -> Result<()> {
        self.set_flags(id, "deleted = 1", &[])?;
        tracing::debug!("Message {} deleted", id);
        Ok(())
    }

    /// Mark a message read, keeping its deleted flag
    pub fn mark_read(&self, id: i64) -> Result<()> {
        self.set_flags(id, "is_read = 1", &[])
    }

    fn set_flags(&self, id: i64, assignments: &str, values: &[&dyn ToSql]) -> Result<()> {
        let now = crate::time::now_timestamp();
        let sql = format!(
            "UPDATE message SET {}, modified_at = ? WHERE id = ?",
            assignments
        );

        let mut params: Vec<&dyn ToSql> = values.to_vec();
        params.push(&now);
        params.push(&id);

        let rows = self.handle.run(|conn| {
            conn.execute(&sql, params.as_slice())
                .map_err(|e| Error::storage(Entity::Message, "update", &id.to_string(), e))
        })?;

        if rows == 0 {
            return Err(Error::not_found(Entity::Message, id.to_string()));
        }
        Ok(())
    }
}

const SELECT_JOINED: &str = "SELECT m.id, m.session_id, m.source_client_id, m.source_key_id, \
                             m.destination_client_id, m.destination_key_id, m.protocol_version, \
                             m.sequence, m.message_type, m.content, m.modified_at, m.is_read, m.deleted, \
                             s.id, s.local_ephemeral_key_id, s.local_sequence, s.remote_client_id, \
                             s.remote_identity_key, s.remote_ephemeral_key_id, s.remote_ephemeral_key, \
                             s.remote_sequence, s.phase \
                             FROM message m JOIN message_session s ON s.id = m.session_id";

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        source_client_id: row.get(2)?,
        source_key_id: row.get(3)?,
        destination_client_id: row.get(4)?,
        destination_key_id: row.get(5)?,
        protocol_version: row.get(6)?,
        sequence: row.get(7)?,
        message_type: row.get(8)?,
        content: row.get(9)?,
        modified_at: row.get(10)?,
        is_read: row.get(11)?,
        deleted: row.get(12)?,
        session: sessions::read_session_at(row, 13)?,
    })
}

fn find(conn: &Connection, id: i64, include_deleted: bool) -> Result<Message> {
    let result = conn.query_row(
        &format!("{} WHERE m.id = ? AND (? OR m.deleted = 0)", SELECT_JOINED),
        params![id, include_deleted],
        read_message,
    );

    match result {
        Ok(message) => Ok(message),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(Error::not_found(Entity::Message, id.to_string()))
        }
        Err(e) => Err(Error::storage(Entity::Message, "get", &id.to_string(), e)),
    }
}

fn insert(conn: &Connection, message: &NewMessage) -> Result<i64> {
    if sessions::find(conn, message.session_id())?.is_none() {
        sessions::insert(conn, &message.session)?;
        tracing::debug!(
            "Session {} established with {} on first message",
            message.session.id,
            message.session.remote_client_id
        );
    }

    let now = crate::time::now_timestamp();
    conn.execute(
        "INSERT INTO message (session_id, source_client_id, source_key_id, destination_client_id,
                              destination_key_id, protocol_version, sequence, message_type, content,
                              modified_at, is_read, deleted)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)",
        params![
            message.session.id,
            message.source_client_id,
            message.source_key_id,
            message.destination_client_id,
            message.destination_key_id,
            message.protocol_version,
            message.sequence,
            message.message_type,
            message.content,
            now,
        ],
    )
    .map_err(|e| Error::storage(Entity::Message, "create", message.session_id(), e))?;

    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, SessionUpdate};

    fn new_message(session_id: &str, sequence: i64, message_type: &str) -> NewMessage {
        NewMessage {
            session: MessageSession::new(
                session_id,
                "my-key",
                "bob",
                "bob-identity",
                "bob-key",
                "bob-key-pub",
            ),
            source_client_id: "me".into(),
            source_key_id: "my-key".into(),
            destination_client_id: "bob".into(),
            destination_key_id: "bob-key".into(),
            protocol_version: "1".into(),
            sequence,
            message_type: message_type.into(),
            content: format!("ciphertext-{}", sequence),
        }
    }

    #[test]
    fn test_create_bootstraps_session() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.sessions().get("s1").unwrap().is_none());

        let id = db.messages().create(&new_message("s1", 1, "text")).unwrap();

        assert!(db.sessions().get("s1").unwrap().is_some());
        let message = db.messages().get(id).unwrap();
        assert_eq!(message.session_id, "s1");
        assert_eq!(message.content, "ciphertext-1");
        assert_eq!(message.session.remote_client_id, "bob");
        assert!(!message.is_read);
        assert!(!message.deleted);
    }

    #[test]
    fn test_create_reuses_existing_session() {
        let db = Database::open_in_memory().unwrap();
        db.messages().create(&new_message("s1", 1, "text")).unwrap();
        db.sessions()
            .update("s1", SessionUpdate::default().phase(SessionPhase::Active))
            .unwrap();

        // A stale descriptor on the second message does not overwrite the session
        let id = db.messages().create(&new_message("s1", 2, "text")).unwrap();

        let message = db.messages().get(id).unwrap();
        assert_eq!(message.session.phase, SessionPhase::Active);
        assert_eq!(db.sessions().list_for_client("bob", true).unwrap().len(), 1);
    }

    #[test]
    fn test_ids_increase() {
        let db = Database::open_in_memory().unwrap();
        let first = db.messages().create(&new_message("s1", 1, "text")).unwrap();
        let second = db.messages().create(&new_message("s1", 2, "text")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.messages().get(99).unwrap_err().is_not_found());
        assert!(db.messages().get_including_deleted(99).unwrap_err().is_not_found());
    }

    #[test]
    fn test_reads_see_current_session_state() {
        let db = Database::open_in_memory().unwrap();
        let id = db.messages().create(&new_message("s1", 1, "text")).unwrap();

        db.sessions()
            .update("s1", SessionUpdate::default().remote_sequence(5))
            .unwrap();

        assert_eq!(db.messages().get(id).unwrap().session.remote_sequence, 5);
    }

    #[test]
    fn test_soft_delete() {
        let db = Database::open_in_memory().unwrap();
        let id = db.messages().create(&new_message("s1", 1, "text")).unwrap();
        db.messages().mark_read(id).unwrap();

        db.messages().delete(id).unwrap();

        assert!(db.messages().get(id).unwrap_err().is_not_found());
        let stored = db.messages().get_including_deleted(id).unwrap();
        assert!(stored.deleted);
        assert!(stored.is_read);

        assert!(db.messages().list(&MessageFilter::default()).unwrap().is_empty());
        assert_eq!(
            db.messages()
                .list(&MessageFilter::default().with_deleted())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_update_flags() {
        let db = Database::open_in_memory().unwrap();
        let id = db.messages().create(&new_message("s1", 1, "text")).unwrap();

        db.messages().update_flags(id, true, false).unwrap();
        assert!(db.messages().get(id).unwrap().is_read);

        db.messages().update_flags(id, false, true).unwrap();
        let stored = db.messages().get_including_deleted(id).unwrap();
        assert!(!stored.is_read);
        assert!(stored.deleted);

        // Flags can bring a message back
        db.messages().update_flags(id, false, false).unwrap();
        assert!(db.messages().get(id).is_ok());
    }

    #[test]
    fn test_flag_changes_on_unknown_id() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.messages().update_flags(7, true, true).unwrap_err().is_not_found());
        assert!(db.messages().delete(7).unwrap_err().is_not_found());
        assert!(db.messages().mark_read(7).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_filters() {
        let db = Database::open_in_memory().unwrap();
        let m1 = db.messages().create(&new_message("s1", 1, "text")).unwrap();
        let m2 = db.messages().create(&new_message("s1", 2, "receipt")).unwrap();
        let m3 = db.messages().create(&new_message("s2", 1, "text")).unwrap();
        db.messages().mark_read(m1).unwrap();
        db.sessions().close("s2").unwrap();

        let ids = |filter: MessageFilter| -> Vec<i64> {
            db.messages()
                .list(&filter)
                .unwrap()
                .into_iter()
                .map(|m| m.id)
                .collect()
        };

        assert_eq!(ids(MessageFilter::default()), vec![m1, m2, m3]);
        assert_eq!(ids(MessageFilter::default().session("s1")), vec![m1, m2]);
        assert_eq!(ids(MessageFilter::default().message_type("text")), vec![m1, m3]);
        assert_eq!(ids(MessageFilter::default().unread_only()), vec![m2, m3]);
        assert_eq!(ids(MessageFilter::default().phase(SessionPhase::Closed)), vec![m3]);
        assert_eq!(
            ids(MessageFilter::default()
                .session("s1")
                .message_type("text")
                .unread_only()),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn test_create_rejects_empty_session_id() {
        let db = Database::open_in_memory().unwrap();
        let err = db.messages().create(&new_message("", 1, "text")).unwrap_err();
        assert_eq!(err.code(), 407);
        assert!(db.messages().list(&MessageFilter::default()).unwrap().is_empty());
    }
}
