//! # PeerComm Core
//!
//! Session and key-lifecycle store for pairwise encrypted messaging
//! between paired clients.
//!
//! The crate keeps the bookkeeping a peer messaging protocol depends on:
//! who the paired clients are, which ephemeral keys each of them currently
//! advertises, which sessions exist and how far their sequence counters
//! have advanced, and the message envelopes exchanged in each session. It
//! performs no key agreement, signature checks or network I/O itself.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PEERCOMM CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                │
//! │  │ MessageStore │──►│ SessionStore │──►│ClientRegistry│                │
//! │  │              │   │              │   │              │                │
//! │  │ - Envelopes  │   │ - Counters   │   │ - Self/peers │                │
//! │  │ - Bootstrap  │   │ - Phase      │   │ - Soft delete│                │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘                │
//! │                                               │                         │
//! │  ┌──────────────┐                      ┌──────▼──────────────┐         │
//! │  │PropertyStore │                      │ EphemeralKeyManager │         │
//! │  │              │                      │                     │         │
//! │  │ - Key/value  │                      │ - Publish / revoke  │         │
//! │  └──────────────┘                      │ - Reconcile bundle  │         │
//! │                                        └─────────────────────┘         │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │ Database: one SQLite connection, schema versioning, transactions  │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`keys`] - Private key wrapper that zeroizes on drop
//! - [`storage`] - Database handle and the five repositories
//! - [`time`] - Timestamp helper
//!
//! ## Example
//!
//! ```
//! use peercomm_core::{Client, Database, EphemeralKey, KeyStatus};
//!
//! let db = Database::open_in_memory()?;
//!
//! let peer = Client::new("bob", "Bob", "bob-identity-key")
//!     .with_ephemeral_keys(vec![
//!         EphemeralKey::new("k1", "bob", "k1-pub", KeyStatus::Published),
//!     ]);
//! db.clients().create(&peer)?;
//!
//! // Bob republishes: k1 is withdrawn, k2 is new
//! let report = db.ephemeral_keys().reconcile(
//!     "bob",
//!     &[EphemeralKey::new("k2", "bob", "k2-pub", KeyStatus::Published)],
//!     true,
//! )?;
//! assert_eq!(report.revoked, vec!["k1"]);
//! assert_eq!(db.clients().get_by_id("bob")?.ephemeral_keys.len(), 1);
//! # Ok::<(), peercomm_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod error;
pub mod keys;
pub mod storage;
/// Timestamp helper shared by every repository.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use error::{Entity, Error, Result};
pub use keys::PrivateKey;
pub use storage::{
    Client, ClientRegistry, Database, DatabaseConfig, EphemeralKey, EphemeralKeyManager,
    KeyStatus, Message, MessageFilter, MessageSession, MessageStore, NewMessage, Property,
    PropertyStore, ReconcileReport, SessionPhase, SessionStore, SessionUpdate, Transaction,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of PeerComm Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
