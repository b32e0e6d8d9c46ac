//! # Client Registry
//!
//! Identity store for the self client and paired peers.
//!
//! Every client read comes back with the client's published, non-deleted
//! ephemeral keys attached. Writes go the other way: `create` and `update`
//! store the row and then reconcile the attached keys in create-only mode,
//! so keys the record no longer lists are left alone.
//!
//! ## Deletion
//!
//! Deleting a client only flags the client row. Its ephemeral keys and
//! sessions stay as they are and remain reachable through the key and
//! session stores, which keeps a full audit trail of what was exchanged
//! with a peer after it is unpaired.

use rusqlite::{params, Connection, Row, ToSql};
use serde::{Deserialize, Serialize};

use super::database::{atomically, Handle};
use super::ephemeral_keys::{self, EphemeralKey};
use crate::error::{Entity, Error, Result};
use crate::keys::PrivateKey;

/// A self or peer client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Unique, immutable client id
    pub id: String,
    /// True for the local client
    pub is_self: bool,
    /// Human-readable name
    pub display_name: String,
    /// Encoded long-term identity public key
    pub public_key: String,
    /// Encoded long-term private key (self client only)
    pub private_key: Option<PrivateKey>,
    /// Pairing status (free-form, owned by the pairing layer)
    pub status: String,
    /// Authorization level granted to the client
    pub auth_level: String,
    /// Protocol version the client speaks
    pub protocol_version: String,
    /// Last write (Unix seconds); set by storage
    pub modified_at: i64,
    /// Soft-delete flag
    pub deleted: bool,
    /// Published, non-deleted ephemeral keys
    pub ephemeral_keys: Vec<EphemeralKey>,
}

impl Client {
    /// A peer client with empty status fields and no keys
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            is_self: false,
            display_name: display_name.into(),
            public_key: public_key.into(),
            private_key: None,
            status: String::new(),
            auth_level: String::new(),
            protocol_version: String::new(),
            modified_at: 0,
            deleted: false,
            ephemeral_keys: Vec::new(),
        }
    }

    /// Mark as the local client and attach its private key
    pub fn as_self(mut self, private_key: PrivateKey) -> Self {
        self.is_self = true;
        self.private_key = Some(private_key);
        self
    }

    /// Set the pairing status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the authorization level
    pub fn with_auth_level(mut self, auth_level: impl Into<String>) -> Self {
        self.auth_level = auth_level.into();
        self
    }

    /// Set the protocol version
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Attach ephemeral keys to store alongside the client
    pub fn with_ephemeral_keys(mut self, keys: Vec<EphemeralKey>) -> Self {
        self.ephemeral_keys = keys;
        self
    }
}

/// Client repository
#[derive(Clone, Copy)]
pub struct ClientRegistry<'a> {
    handle: Handle<'a>,
}

impl<'a> ClientRegistry<'a> {
    pub(crate) fn new(handle: Handle<'a>) -> Self {
        Self { handle }
    }

    /// Get a client by id
    pub fn get_by_id(&self, id: &str) -> Result<Client> {
        self.handle.run(|conn| {
            find_one(conn, "id = ?", &[&id], id)?
                .ok_or_else(|| Error::not_found(Entity::Client, id))
        })
    }

    /// Get a client by display name
    ///
    /// Display names are not unique. The match with the lowest id wins.
    pub fn get_by_name(&self, name: &str) -> Result<Client> {
        self.handle.run(|conn| {
            find_one(conn, "display_name = ?", &[&name], name)?
                .ok_or_else(|| Error::not_found(Entity::Client, format!("name '{}'", name)))
        })
    }

    /// Get the local client
    ///
    /// Fails with NotFound if no non-deleted self client exists. If more
    /// than one exists, the one with the lowest id is returned.
    pub fn get_self(&self) -> Result<Client> {
        self.handle.run(|conn| {
            find_one(conn, "is_self = 1", &[], "self")?
                .ok_or_else(|| Error::not_found(Entity::Client, "self"))
        })
    }

    /// All non-deleted clients ordered by id
    pub fn list(&self) -> Result<Vec<Client>> {
        self.handle.run(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM client WHERE deleted = 0 ORDER BY id",
                    CLIENT_COLUMNS
                ))
                .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

            let mut clients = stmt
                .query_map([], read_client)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| Error::storage(Entity::Client, "list", "*", e))?;

            for client in &mut clients {
                client.ephemeral_keys = ephemeral_keys::list_published(conn, &client.id)?;
            }

            Ok(clients)
        })
    }

    /// Store a new client and its attached ephemeral keys
    pub fn create(&self, client: &Client) -> Result<()> {
        super::require_id("client", &client.id)?;
        self.handle.run(|conn| {
            atomically(conn, |conn| {
                let now = crate::time::now_timestamp();
                conn.execute(
                    "INSERT INTO client (id, is_self, display_name, public_key, private_key, status,
                                         auth_level, protocol_version, modified_at, deleted)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                    params![
                        client.id,
                        client.is_self,
                        client.display_name,
                        client.public_key,
                        client.private_key,
                        client.status,
                        client.auth_level,
                        client.protocol_version,
                        now,
                    ],
                )
                .map_err(|e| Error::storage(Entity::Client, "create", &client.id, e))?;

                ephemeral_keys::reconcile(conn, &client.id, &client.ephemeral_keys, false)?;
                Ok(())
            })
        })
    }

    /// Replace every mutable field of a stored client
    ///
    /// Attached ephemeral keys are created or updated; keys the record no
    /// longer lists are not revoked.
    pub fn update(&self, client: &Client) -> Result<()> {
        self.handle.run(|conn| {
            atomically(conn, |conn| {
                let now = crate::time::now_timestamp();
                let rows = conn
                    .execute(
                        "UPDATE client SET is_self = ?, display_name = ?, public_key = ?, private_key = ?,
                                           status = ?, auth_level = ?, protocol_version = ?, modified_at = ?
                         WHERE id = ?",
                        params![
                            client.is_self,
                            client.display_name,
                            client.public_key,
                            client.private_key,
                            client.status,
                            client.auth_level,
                            client.protocol_version,
                            now,
                            client.id,
                        ],
                    )
                    .map_err(|e| Error::storage(Entity::Client, "update", &client.id, e))?;

                if rows == 0 {
                    return Err(Error::not_found(Entity::Client, client.id.as_str()));
                }

                ephemeral_keys::reconcile(conn, &client.id, &client.ephemeral_keys, false)?;
                Ok(())
            })
        })
    }

    /// Soft-delete a client
    ///
    /// Keys and sessions of the client are kept. Returns `false` if no such
    /// client exists.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let now = crate::time::now_timestamp();
        self.handle.run(|conn| {
            let rows = conn
                .execute(
                    "UPDATE client SET deleted = 1, modified_at = ? WHERE id = ?",
                    params![now, id],
                )
                .map_err(|e| Error::storage(Entity::Client, "delete", id, e))?;

            if rows > 0 {
                tracing::debug!("Client {} deleted", id);
            }
            Ok(rows > 0)
        })
    }
}

const CLIENT_COLUMNS: &str = "id, is_self, display_name, public_key, private_key, status, \
                              auth_level, protocol_version, modified_at, deleted";

fn read_client(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        is_self: row.get(1)?,
        display_name: row.get(2)?,
        public_key: row.get(3)?,
        private_key: row.get(4)?,
        status: row.get(5)?,
        auth_level: row.get(6)?,
        protocol_version: row.get(7)?,
        modified_at: row.get(8)?,
        deleted: row.get(9)?,
        ephemeral_keys: Vec::new(),
    })
}

/// First non-deleted client matching `condition`, with its keys
fn find_one(
    conn: &Connection,
    condition: &str,
    params: &[&dyn ToSql],
    lookup: &str,
) -> Result<Option<Client>> {
    let result = conn.query_row(
        &format!(
            "SELECT {} FROM client WHERE deleted = 0 AND {} ORDER BY id LIMIT 1",
            CLIENT_COLUMNS, condition
        ),
        params,
        read_client,
    );

    let mut client = match result {
        Ok(client) => client,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(Error::storage(Entity::Client, "get", lookup, e)),
    };

    client.ephemeral_keys = ephemeral_keys::list_published(conn, &client.id)?;
    Ok(Some(client))
}
