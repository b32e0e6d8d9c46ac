//! # Ephemeral Keys
//!
//! Lifecycle and reconciliation of a client's short-lived key bundle.
//!
//! ## Key Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       EPHEMERAL KEY LIFECYCLE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ┌───────────┐   publish    ┌───────────┐   withdraw   ┌───────────┐  │
//! │   │ generated │─────────────►│ published │─────────────►│  revoked  │  │
//! │   └───────────┘              └───────────┘              └───────────┘  │
//! │                                    │                          ▲        │
//! │                                    │  delete() / reconcile()  │        │
//! │                                    └──────────────────────────┘        │
//! │                                          (also sets deleted)           │
//! │                                                                         │
//! │  Reconciliation (peer republishes its bundle):                         │
//! │                                                                         │
//! │    stored published {A, B}      incoming {B, C}                        │
//! │             │                          │                                │
//! │             ▼                          ▼                                │
//! │    revoke_missing: {A,B} \ {B,C} = {A}  ──► A revoked + deleted        │
//! │    upsert:  B seen before ──► updated in place                         │
//! │             C never seen  ──► created                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! "Seen before" includes soft-deleted rows, so a withdrawn key that a peer
//! advertises again is updated rather than inserted twice. Updating does
//! not clear its `deleted` flag.

use std::collections::HashSet;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::database::{atomically, Handle};
use crate::error::{Entity, Error, Result};
use crate::keys::PrivateKey;

// ============================================================================
// TYPES
// ============================================================================

/// Where an ephemeral key is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Created locally, not yet advertised
    Generated,
    /// Advertised and usable for new sessions
    Published,
    /// Withdrawn; must not be used for new sessions
    Revoked,
}

impl KeyStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Generated => "generated",
            KeyStatus::Published => "published",
            KeyStatus::Revoked => "revoked",
        }
    }

    /// Parse the stored representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(KeyStatus::Generated),
            "published" => Some(KeyStatus::Published),
            "revoked" => Some(KeyStatus::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for KeyStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for KeyStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        KeyStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown key status '{}'", s).into()))
    }
}

/// A short-lived key owned by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralKey {
    /// Unique key id
    pub id: String,
    /// Owning client
    pub client_id: String,
    /// Encoded public key
    pub public_key: String,
    /// Encoded private key (only for keys of the self client)
    pub private_key: Option<PrivateKey>,
    /// Lifecycle status
    pub status: KeyStatus,
    /// Last write (Unix seconds); set by storage
    pub modified_at: i64,
    /// Soft-delete flag
    pub deleted: bool,
}

impl EphemeralKey {
    /// A new, not yet stored key
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        public_key: impl Into<String>,
        status: KeyStatus,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            public_key: public_key.into(),
            private_key: None,
            status,
            modified_at: 0,
            deleted: false,
        }
    }

    /// Attach the private half (self client only)
    pub fn with_private_key(mut self, private_key: PrivateKey) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Fresh random key id
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Published and not soft-deleted
    pub fn is_live(&self) -> bool {
        self.status == KeyStatus::Published && !self.deleted
    }
}

/// Key ids touched by a reconciliation, by outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Ids inserted because they had never been stored for the client
    pub created: Vec<String>,
    /// Ids that already existed and were rewritten
    pub updated: Vec<String>,
    /// Previously published ids missing from the incoming set
    pub revoked: Vec<String>,
}

impl ReconcileReport {
    /// True if nothing was written
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.revoked.is_empty()
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Ephemeral key repository
#[derive(Clone, Copy)]
pub struct EphemeralKeyManager<'a> {
    handle: Handle<'a>,
}

impl<'a> EphemeralKeyManager<'a> {
    pub(crate) fn new(handle: Handle<'a>) -> Self {
        Self { handle }
    }

    /// Look up one key of a client
    ///
    /// Absence is a normal answer and returns `Ok(None)`.
    pub fn get(
        &self,
        client_id: &str,
        key_id: &str,
        include_deleted: bool,
    ) -> Result<Option<EphemeralKey>> {
        self.handle
            .run(|conn| find(conn, client_id, key_id, include_deleted))
    }

    /// Published, non-deleted keys of a client
    pub fn list_published(&self, client_id: &str) -> Result<Vec<EphemeralKey>> {
        self.handle.run(|conn| list_published(conn, client_id))
    }

    /// Every key of a client regardless of status
    pub fn list(&self, client_id: &str, include_deleted: bool) -> Result<Vec<EphemeralKey>> {
        self.handle.run(|conn| {
            query(
                conn,
                &format!(
                    "SELECT {} FROM ephemeral_key WHERE client_id = ? AND (? OR deleted = 0) ORDER BY id",
                    KEY_COLUMNS
                ),
                params![client_id, include_deleted],
                client_id,
            )
        })
    }

    /// Store a new key for `client_id`
    ///
    /// The key is stored under `client_id` whatever its own `client_id`
    /// field says, with `deleted` cleared.
    pub fn create(&self, client_id: &str, key: &EphemeralKey) -> Result<()> {
        super::require_id("client", client_id)?;
        super::require_id("ephemeral key", &key.id)?;
        self.handle.run(|conn| insert(conn, client_id, key))
    }

    /// Rewrite the public key, private key and status of a stored key
    pub fn update(&self, key: &EphemeralKey) -> Result<()> {
        self.handle.run(|conn| update(conn, key))
    }

    /// Revoke and soft-delete a key
    ///
    /// Returns `false` if no such key exists.
    pub fn delete(&self, key_id: &str) -> Result<bool> {
        self.handle.run(|conn| {
            let revoked = revoke(conn, key_id)?;
            if revoked {
                tracing::debug!("Ephemeral key {} revoked and deleted", key_id);
            }
            Ok(revoked)
        })
    }

    /// Replace a client's advertised key set with `keys`
    ///
    /// With `revoke_missing`, every currently published key whose id is not
    /// in `keys` is revoked and soft-deleted first. Every incoming key is
    /// then created or updated. Both phases run in one transaction.
    pub fn reconcile(
        &self,
        client_id: &str,
        keys: &[EphemeralKey],
        revoke_missing: bool,
    ) -> Result<ReconcileReport> {
        super::require_id("client", client_id)?;
        self.handle.run(|conn| {
            atomically(conn, |conn| reconcile(conn, client_id, keys, revoke_missing))
        })
    }
}

// ============================================================================
// QUERIES
// ============================================================================

const KEY_COLUMNS: &str = "id, client_id, public_key, private_key, status, modified_at, deleted";

fn read_key(row: &Row<'_>) -> rusqlite::Result<EphemeralKey> {
    Ok(EphemeralKey {
        id: row.get(0)?,
        client_id: row.get(1)?,
        public_key: row.get(2)?,
        private_key: row.get(3)?,
        status: row.get(4)?,
        modified_at: row.get(5)?,
        deleted: row.get(6)?,
    })
}

fn query(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    client_id: &str,
) -> Result<Vec<EphemeralKey>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

    let keys = stmt
        .query_map(params, read_key)
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| Error::storage(Entity::EphemeralKey, "list keys of client", client_id, e))?;

    Ok(keys)
}

fn find(
    conn: &Connection,
    client_id: &str,
    key_id: &str,
    include_deleted: bool,
) -> Result<Option<EphemeralKey>> {
    let result = conn.query_row(
        &format!(
            "SELECT {} FROM ephemeral_key WHERE client_id = ? AND id = ? AND (? OR deleted = 0)",
            KEY_COLUMNS
        ),
        params![client_id, key_id, include_deleted],
        read_key,
    );

    match result {
        Ok(key) => Ok(Some(key)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::storage(Entity::EphemeralKey, "get", key_id, e)),
    }
}

pub(crate) fn list_published(conn: &Connection, client_id: &str) -> Result<Vec<EphemeralKey>> {
    query(
        conn,
        &format!(
            "SELECT {} FROM ephemeral_key WHERE client_id = ? AND status = ? AND deleted = 0 ORDER BY id",
            KEY_COLUMNS
        ),
        params![client_id, KeyStatus::Published],
        client_id,
    )
}

fn insert(conn: &Connection, client_id: &str, key: &EphemeralKey) -> Result<()> {
    let now = crate::time::now_timestamp();
    conn.execute(
        "INSERT INTO ephemeral_key (id, client_id, public_key, private_key, status, modified_at, deleted)
         VALUES (?, ?, ?, ?, ?, ?, 0)",
        params![key.id, client_id, key.public_key, key.private_key, key.status, now],
    )
    .map_err(|e| Error::storage(Entity::EphemeralKey, "create", &key.id, e))?;
    Ok(())
}

fn update(conn: &Connection, key: &EphemeralKey) -> Result<()> {
    let now = crate::time::now_timestamp();
    let rows = conn
        .execute(
            "UPDATE ephemeral_key SET public_key = ?, private_key = ?, status = ?, modified_at = ?
             WHERE id = ?",
            params![key.public_key, key.private_key, key.status, now, key.id],
        )
        .map_err(|e| Error::storage(Entity::EphemeralKey, "update", &key.id, e))?;

    if rows == 0 {
        return Err(Error::not_found(Entity::EphemeralKey, key.id.as_str()));
    }
    Ok(())
}

fn revoke(conn: &Connection, key_id: &str) -> Result<bool> {
    let now = crate::time::now_timestamp();
    let rows = conn
        .execute(
            "UPDATE ephemeral_key SET status = ?, deleted = 1, modified_at = ? WHERE id = ?",
            params![KeyStatus::Revoked, now, key_id],
        )
        .map_err(|e| Error::storage(Entity::EphemeralKey, "revoke", key_id, e))?;
    Ok(rows > 0)
}

/// Two-phase reconciliation. Callers provide the transaction.
pub(crate) fn reconcile(
    conn: &Connection,
    client_id: &str,
    keys: &[EphemeralKey],
    revoke_missing: bool,
) -> Result<ReconcileReport> {
    for key in keys {
        super::require_id("ephemeral key", &key.id)?;
    }

    let mut report = ReconcileReport::default();

    if revoke_missing {
        let incoming: HashSet<&str> = keys.iter().map(|k| k.id.as_str()).collect();
        let withdrawn: Vec<String> = list_published(conn, client_id)?
            .into_iter()
            .map(|k| k.id.clone())
            .filter(|id| !incoming.contains(id.as_str()))
            .collect();

        for id in withdrawn {
            revoke(conn, &id)?;
            report.revoked.push(id);
        }
    }

    for key in keys {
        if find(conn, client_id, &key.id, true)?.is_none() {
            insert(conn, client_id, key)?;
            report.created.push(key.id.clone());
        } else {
            update(conn, key)?;
            report.updated.push(key.id.clone());
        }
    }

    tracing::debug!(
        "Reconciled keys for client {}: {} created, {} updated, {} revoked",
        client_id,
        report.created.len(),
        report.updated.len(),
        report.revoked.len()
    );

    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
