//! # Storage Module
//!
//! Persistent state for peer sessions and key lifecycles.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Repositories (borrowed from Database or Transaction)           │   │
//! │  │  ─────────────────────────────────────────────────              │   │
//! │  │                                                                 │   │
//! │  │  MessageStore ──► SessionStore ──► ClientRegistry               │   │
//! │  │       │                                 │                       │   │
//! │  │       │ lazy session bootstrap          ▼                       │   │
//! │  │       │                        EphemeralKeyManager              │   │
//! │  │       │                                                         │   │
//! │  │  PropertyStore (independent)                                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite Database                                                │   │
//! │  │  ───────────────                                                │   │
//! │  │                                                                 │   │
//! │  │  Tables:                                                       │   │
//! │  │  • property - Generic key/value pairs                          │   │
//! │  │  • client - Self and peer identities                           │   │
//! │  │  • ephemeral_key - Rotating per-client key bundle              │   │
//! │  │  • message_session - Pairwise session counters and phase       │   │
//! │  │  • message - Envelopes with opaque content                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Soft Delete
//!
//! Clients, ephemeral keys and messages are never removed. Deleting one
//! sets its `deleted` flag; default reads skip flagged rows and every read
//! that can see them says so with an explicit `include_deleted` argument.
//! Sessions are never deleted at all; they move to the `closed` phase.

mod clients;
mod database;
mod ephemeral_keys;
mod messages;
mod properties;
mod schema;
mod sessions;

pub use clients::{Client, ClientRegistry};
pub use database::{Database, DatabaseConfig, Transaction, DEFAULT_STATEMENT_TIMEOUT_MS};
pub use ephemeral_keys::{EphemeralKey, EphemeralKeyManager, KeyStatus, ReconcileReport};
pub use messages::{Message, MessageFilter, MessageStore, NewMessage};
pub use properties::{Property, PropertyStore};
pub use sessions::{MessageSession, SessionPhase, SessionStore, SessionUpdate};

use crate::error::{Error, Result};

/// Reject an empty identifier before it reaches the engine
pub(crate) fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} id must not be empty", kind)));
    }
    Ok(())
}
