//! # Database
//!
//! SQLite handle shared by every repository.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │   Application   │                                                   │
//! │  └────────┬────────┘                                                   │
//! │           │  db.clients() / db.sessions() / db.transaction(..)         │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │  Repositories   │  One per entity                                   │
//! │  │                 │  - PropertyStore, ClientRegistry                  │
//! │  │                 │  - EphemeralKeyManager                            │
//! │  │                 │  - SessionStore, MessageStore                     │
//! │  └────────┬────────┘                                                   │
//! │           │  Handle::run(|conn| ..)                                     │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    Database     │  Arc<Mutex<Connection>>                           │
//! │  │   (this file)   │  - Schema creation / migration                    │
//! │  │                 │  - Busy timeout from DatabaseConfig               │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │   SQLite DB     │  - In-memory for tests                            │
//! │  │                 │  - File (WAL) for production                      │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking and Transactions
//!
//! A repository obtained from [`Database`] takes the connection lock for
//! the length of one call. Calls through one handle (and its clones) are
//! therefore serialized, but nothing groups two calls together.
//!
//! [`Database::transaction`] holds the lock and an open SQLite transaction
//! for the whole closure. Repositories obtained from the [`Transaction`]
//! passed to the closure run against that transaction. Operations that are
//! internally atomic (key reconciliation, client create/update, message
//! create) join the open transaction under a savepoint instead of starting
//! their own. If one of them fails, its partial writes are rolled back even
//! when the closure handles the error and goes on to commit.
//!
//! Do not call repositories of the outer [`Database`] from inside a
//! transaction closure: the connection lock is not reentrant.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::schema;
use super::{ClientRegistry, EphemeralKeyManager, MessageStore, PropertyStore, SessionStore};
use crate::error::{Error, Result};

/// Default per-statement timeout in milliseconds
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 10_000;

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the database file (None for in-memory)
    pub path: Option<PathBuf>,
    /// How long a statement may wait for the database lock
    pub statement_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// Configuration for a file-backed database
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Override the statement timeout
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The statement timeout as a [`Duration`]
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// The main database handle
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
    config: DatabaseConfig,
}

impl Database {
    /// Open or create a database
    ///
    /// If `config.path` is None, creates an in-memory database.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(p) => {
                let conn = Connection::open(p).map_err(|e| {
                    Error::DatabaseError(format!(
                        "Failed to open database at {}: {}",
                        p.display(),
                        e
                    ))
                })?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")
                    .map_err(|e| Error::DatabaseError(format!("Failed to enable WAL: {}", e)))?;
                conn
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        conn.busy_timeout(config.statement_timeout())
            .map_err(|e| Error::DatabaseError(format!("Failed to set busy timeout: {}", e)))?;

        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Open a fresh in-memory database with default settings
    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseConfig::default())
    }

    /// The configuration this handle was opened with
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    /// Drop every table and recreate an empty schema
    pub fn reset(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::DROP_TABLES)
            .map_err(|e| Error::DatabaseError(format!("Failed to drop tables: {}", e)))?;
        create_schema(&conn)?;
        tracing::info!("Database reset (version {})", schema::SCHEMA_VERSION);
        Ok(())
    }

    /// Run `f` inside one SQLite transaction
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let value = f(&Transaction { conn: &*tx })?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }

    /// Property repository
    pub fn properties(&self) -> PropertyStore<'_> {
        PropertyStore::new(self.handle())
    }

    /// Client repository
    pub fn clients(&self) -> ClientRegistry<'_> {
        ClientRegistry::new(self.handle())
    }

    /// Ephemeral key repository
    pub fn ephemeral_keys(&self) -> EphemeralKeyManager<'_> {
        EphemeralKeyManager::new(self.handle())
    }

    /// Session repository
    pub fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(self.handle())
    }

    /// Message repository
    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(self.handle())
    }

    fn handle(&self) -> Handle<'_> {
        Handle::Shared(self.conn.as_ref())
    }
}

/// An open transaction handed to [`Database::transaction`] closures
pub struct Transaction<'a> {
    conn: &'a Connection,
}

impl<'a> Transaction<'a> {
    /// Property repository bound to this transaction
    pub fn properties(&self) -> PropertyStore<'a> {
        PropertyStore::new(self.handle())
    }

    /// Client repository bound to this transaction
    pub fn clients(&self) -> ClientRegistry<'a> {
        ClientRegistry::new(self.handle())
    }

    /// Ephemeral key repository bound to this transaction
    pub fn ephemeral_keys(&self) -> EphemeralKeyManager<'a> {
        EphemeralKeyManager::new(self.handle())
    }

    /// Session repository bound to this transaction
    pub fn sessions(&self) -> SessionStore<'a> {
        SessionStore::new(self.handle())
    }

    /// Message repository bound to this transaction
    pub fn messages(&self) -> MessageStore<'a> {
        MessageStore::new(self.handle())
    }

    fn handle(&self) -> Handle<'a> {
        Handle::Scoped(self.conn)
    }
}

// ============================================================================
// CONNECTION ACCESS
// ============================================================================

/// Where a repository gets its connection from
#[derive(Clone, Copy)]
pub(crate) enum Handle<'a> {
    /// Lock the shared connection for each call
    Shared(&'a Mutex<Connection>),
    /// Use a connection that is already locked (open transaction)
    Scoped(&'a Connection),
}

impl<'a> Handle<'a> {
    pub(crate) fn run<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match *self {
            Handle::Shared(conn) => {
                let guard = conn.lock();
                f(&*guard)
            }
            Handle::Scoped(conn) => f(conn),
        }
    }
}

/// Run `f` atomically
///
/// Inside a caller's transaction `f` runs under a savepoint, so a failure
/// undoes only its own writes and leaves the outer transaction usable.
pub(crate) fn atomically<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    if !conn.is_autocommit() {
        conn.execute_batch("SAVEPOINT peercomm_op")
            .map_err(|e| Error::DatabaseError(format!("Failed to open savepoint: {}", e)))?;

        return match f(conn) {
            Ok(value) => {
                conn.execute_batch("RELEASE peercomm_op").map_err(|e| {
                    Error::DatabaseError(format!("Failed to release savepoint: {}", e))
                })?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) =
                    conn.execute_batch("ROLLBACK TO peercomm_op; RELEASE peercomm_op")
                {
                    tracing::warn!("Failed to roll back savepoint: {}", e);
                }
                Err(err)
            }
        };
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;
    let value = f(&*tx)?;
    tx.commit()
        .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
    Ok(value)
}

// ============================================================================
// SCHEMA
// ============================================================================

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![schema::SCHEMA_VERSION],
    )
    .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<()> {
    // Check current schema version
    let has_version_table: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to inspect schema: {}", e)))?;

    let version: Option<i32> = if has_version_table {
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::DatabaseError(format!("Failed to read schema version: {}", e)))?
    } else {
        None
    };

    match version {
        None => {
            create_schema(conn)?;
            tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
        }
        Some(v) if v < schema::SCHEMA_VERSION => {
            tracing::info!(
                "Database schema version {} is older than current {}, running migrations",
                v,
                schema::SCHEMA_VERSION
            );

            if v < 2 {
                tracing::info!("Running migration v1 → v2 (session closed flag)");
                let tx = conn.unchecked_transaction().map_err(|e| {
                    Error::DatabaseError(format!("Failed to begin migration: {}", e))
                })?;
                tx.execute_batch(schema::MIGRATE_V1_TO_V2)
                    .map_err(|e| Error::DatabaseError(format!("Migration v1→v2 failed: {}", e)))?;
                tx.commit()
                    .map_err(|e| Error::DatabaseError(format!("Migration v1→v2 failed: {}", e)))?;
            }

            tracing::info!("All migrations complete (now at version {})", schema::SCHEMA_VERSION);
        }
        Some(v) if v > schema::SCHEMA_VERSION => {
            return Err(Error::DatabaseError(format!(
                "Database schema version {} is newer than supported version {}",
                v,
                schema::SCHEMA_VERSION
            )));
        }
        Some(v) => {
            tracing::debug!("Database schema version: {}", v);
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
