//! # Message Sessions
//!
//! Pairwise session records: which key pair anchors the session, how many
//! messages each side has sent, and what phase it is in.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SESSION PHASES                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ┌─────────┐  first exchange  ┌─────────┐     close()     ┌────────┐  │
//! │   │ pending │─────────────────►│ active  │────────────────►│ closed │  │
//! │   └─────────┘                  └─────────┘                 └────────┘  │
//! │                                                                         │
//! │   local_sequence   messages sent by self in this session               │
//! │   remote_sequence  messages the peer reports having sent               │
//! │                                                                         │
//! │   Both counters only move forward. The store writes whatever it is     │
//! │   given; keeping them monotonic is up to the caller.                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions are never deleted. The remote ephemeral key is copied into the
//! session when it is established, so revoking that key later does not
//! change the session.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::database::Handle;
use crate::error::{Entity, Error, Result};

/// Phase of a message session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Created, no message exchanged yet
    Pending,
    /// In use
    Active,
    /// Finished; hidden from default listings
    Closed,
}

impl SessionPhase {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Pending => "pending",
            SessionPhase::Active => "active",
            SessionPhase::Closed => "closed",
        }
    }

    /// Parse the stored representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionPhase::Pending),
            "active" => Some(SessionPhase::Active),
            "closed" => Some(SessionPhase::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SessionPhase {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SessionPhase {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        SessionPhase::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown session phase '{}'", s).into()))
    }
}

/// A pairwise message session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSession {
    /// Unique session id
    pub id: String,
    /// Self ephemeral key used for this session
    pub local_ephemeral_key_id: String,
    /// Messages sent by self
    pub local_sequence: i64,
    /// The peer
    pub remote_client_id: String,
    /// Peer identity key at establishment
    pub remote_identity_key: String,
    /// Peer ephemeral key id at establishment
    pub remote_ephemeral_key_id: String,
    /// Peer ephemeral key at establishment (snapshot)
    pub remote_ephemeral_key: String,
    /// Messages the peer reports having sent
    pub remote_sequence: i64,
    /// Current phase
    pub phase: SessionPhase,
}

impl MessageSession {
    /// A pending session with both counters at zero
    pub fn new(
        id: impl Into<String>,
        local_ephemeral_key_id: impl Into<String>,
        remote_client_id: impl Into<String>,
        remote_identity_key: impl Into<String>,
        remote_ephemeral_key_id: impl Into<String>,
        remote_ephemeral_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            local_ephemeral_key_id: local_ephemeral_key_id.into(),
            local_sequence: 0,
            remote_client_id: remote_client_id.into(),
            remote_identity_key: remote_identity_key.into(),
            remote_ephemeral_key_id: remote_ephemeral_key_id.into(),
            remote_ephemeral_key: remote_ephemeral_key.into(),
            remote_sequence: 0,
            phase: SessionPhase::Pending,
        }
    }

    /// Set the phase
    pub fn with_phase(mut self, phase: SessionPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Derive a session id from the two ephemeral key ids
    ///
    /// The ids are sorted first, so both peers derive the same value.
    pub fn derive_id(local_key_id: &str, remote_key_id: &str) -> String {
        let (first, second) = if local_key_id < remote_key_id {
            (local_key_id, remote_key_id)
        } else {
            (remote_key_id, local_key_id)
        };

        let mut hasher = Sha256::new();
        hasher.update(first.as_bytes());
        hasher.update(b"|");
        hasher.update(second.as_bytes());

        let hash = hasher.finalize();
        hex::encode(&hash[..16])
    }

    /// True once the session has been closed
    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }
}

/// Fields to change in [`SessionStore::update`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// New phase
    pub phase: Option<SessionPhase>,
    /// New local counter
    pub local_sequence: Option<i64>,
    /// New remote counter
    pub remote_sequence: Option<i64>,
}

impl SessionUpdate {
    /// Change the phase
    pub fn phase(mut self, phase: SessionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Change the local counter
    pub fn local_sequence(mut self, sequence: i64) -> Self {
        self.local_sequence = Some(sequence);
        self
    }

    /// Change the remote counter
    pub fn remote_sequence(mut self, sequence: i64) -> Self {
        self.remote_sequence = Some(sequence);
        self
    }

    /// True if nothing would change
    pub fn is_empty(&self) -> bool {
        self.phase.is_none() && self.local_sequence.is_none() && self.remote_sequence.is_none()
    }
}

/// Session repository
#[derive(Clone, Copy)]
pub struct SessionStore<'a> {
    handle: Handle<'a>,
}

impl<'a> SessionStore<'a> {
    pub(crate) fn new(handle: Handle<'a>) -> Self {
        Self { handle }
    }

    /// Get a session; `None` means it is not established yet
    pub fn get(&self, id: &str) -> Result<Option<MessageSession>> {
        self.handle.run(|conn| find(conn, id))
    }

    /// Sessions with a peer, ordered by id
    pub fn list_for_client(
        &self,
        remote_client_id: &str,
        include_closed: bool,
    ) -> Result<Vec<MessageSession>> {
        self.handle.run(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM message_session WHERE remote_client_id = ? AND (? OR closed = 0) ORDER BY id",
                    SESSION_COLUMNS
                ))
                .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

            let sessions = stmt
                .query_map(params![remote_client_id, include_closed], read_session)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| {
                    Error::storage(Entity::Session, "list sessions of client", remote_client_id, e)
                })?;

            Ok(sessions)
        })
    }

    /// Store a new session
    pub fn create(&self, session: &MessageSession) -> Result<()> {
        super::require_id("session", &session.id)?;
        self.handle.run(|conn| insert(conn, session))
    }

    /// Apply a partial update
    ///
    /// An empty update logs a warning and leaves storage untouched.
    /// Returns whether a row was changed.
    pub fn update(&self, id: &str, update: SessionUpdate) -> Result<bool> {
        if update.is_empty() {
            tracing::warn!("Session update for {} has nothing to change", id);
            return Ok(false);
        }

        let mut updates = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(phase) = update.phase {
            updates.push("phase = ?");
            values.push(Box::new(phase));
            updates.push("closed = ?");
            values.push(Box::new(phase == SessionPhase::Closed));
        }

        if let Some(sequence) = update.local_sequence {
            updates.push("local_sequence = ?");
            values.push(Box::new(sequence));
        }

        if let Some(sequence) = update.remote_sequence {
            updates.push("remote_sequence = ?");
            values.push(Box::new(sequence));
        }

        let sql = format!("UPDATE message_session SET {} WHERE id = ?", updates.join(", "));
        values.push(Box::new(id.to_string()));

        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let rows = self.handle.run(|conn| {
            conn.execute(&sql, params.as_slice())
                .map_err(|e| Error::storage(Entity::Session, "update", id, e))
        })?;

        Ok(rows > 0)
    }

    /// Move a session to the closed phase
    pub fn close(&self, id: &str) -> Result<bool> {
        self.update(id, SessionUpdate::default().phase(SessionPhase::Closed))
    }
}

const SESSION_COLUMNS: &str = "id, local_ephemeral_key_id, local_sequence, remote_client_id, \
                               remote_identity_key, remote_ephemeral_key_id, remote_ephemeral_key, \
                               remote_sequence, phase";

/// Reads the nine session columns starting at `offset`
pub(crate) fn read_session_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<MessageSession> {
    Ok(MessageSession {
        id: row.get(offset)?,
        local_ephemeral_key_id: row.get(offset + 1)?,
        local_sequence: row.get(offset + 2)?,
        remote_client_id: row.get(offset + 3)?,
        remote_identity_key: row.get(offset + 4)?,
        remote_ephemeral_key_id: row.get(offset + 5)?,
        remote_ephemeral_key: row.get(offset + 6)?,
        remote_sequence: row.get(offset + 7)?,
        phase: row.get(offset + 8)?,
    })
}

fn read_session(row: &Row<'_>) -> rusqlite::Result<MessageSession> {
    read_session_at(row, 0)
}

pub(crate) fn find(conn: &Connection, id: &str) -> Result<Option<MessageSession>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM message_session WHERE id = ?", SESSION_COLUMNS),
        params![id],
        read_session,
    );

    match result {
        Ok(session) => Ok(Some(session)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::storage(Entity::Session, "get", id, e)),
    }
}

pub(crate) fn insert(conn: &Connection, session: &MessageSession) -> Result<()> {
    conn.execute(
        "INSERT INTO message_session (id, local_ephemeral_key_id, local_sequence, remote_client_id,
                                      remote_identity_key, remote_ephemeral_key_id, remote_ephemeral_key,
                                      remote_sequence, phase, closed)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            session.id,
            session.local_ephemeral_key_id,
            session.local_sequence,
            session.remote_client_id,
            session.remote_identity_key,
            session.remote_ephemeral_key_id,
            session.remote_ephemeral_key,
            session.remote_sequence,
            session.phase,
            session.is_closed(),
        ],
    )
    .map_err(|e| Error::storage(Entity::Session, "create", &session.id, e))?;
    Ok(())
}
