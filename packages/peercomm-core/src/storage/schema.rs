//! # Database Schema
//!
//! SQL schema definitions for the PeerComm store.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐                            │
//! │  │     client      │    │  ephemeral_key  │                            │
//! │  ├─────────────────┤    ├─────────────────┤                            │
//! │  │ id              │◄───│ client_id       │                            │
//! │  │ is_self         │    │ id              │                            │
//! │  │ display_name    │    │ public_key      │                            │
//! │  │ public_key      │    │ private_key     │                            │
//! │  │ private_key     │    │ status          │                            │
//! │  │ status          │    │ modified_at     │                            │
//! │  │ auth_level      │    │ deleted         │                            │
//! │  │ protocol_version│    └─────────────────┘                            │
//! │  │ modified_at     │                                                   │
//! │  │ deleted         │                                                   │
//! │  └─────────────────┘                                                   │
//! │           ▲                                                             │
//! │           │ remote_client_id                                            │
//! │  ┌─────────────────────────┐      ┌─────────────────────────┐          │
//! │  │    message_session      │      │        message          │          │
//! │  ├─────────────────────────┤      ├─────────────────────────┤          │
//! │  │ id                      │◄─────│ session_id              │          │
//! │  │ local_ephemeral_key_id  │      │ id (rowid)              │          │
//! │  │ local_sequence          │      │ source_client_id        │          │
//! │  │ remote_client_id        │      │ source_key_id           │          │
//! │  │ remote_identity_key     │      │ destination_client_id   │          │
//! │  │ remote_ephemeral_key_id │      │ destination_key_id      │          │
//! │  │ remote_ephemeral_key    │      │ protocol_version        │          │
//! │  │ remote_sequence         │      │ sequence                │          │
//! │  │ phase                   │      │ message_type            │          │
//! │  │ closed                  │      │ content                 │          │
//! │  └─────────────────────────┘      │ modified_at             │          │
//! │                                   │ is_read                 │          │
//! │  ┌─────────────────┐              │ deleted                 │          │
//! │  │    property     │              └─────────────────────────┘          │
//! │  ├─────────────────┤                                                   │
//! │  │ key             │                                                   │
//! │  │ value           │                                                   │
//! │  │ modified_at     │                                                   │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! References between tables are logical only. No foreign keys are
//! declared: soft-deleting a client leaves its keys and sessions intact.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Generic key/value properties
CREATE TABLE IF NOT EXISTS property (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    modified_at INTEGER NOT NULL
);

-- Clients (self and peers)
CREATE TABLE IF NOT EXISTS client (
    id TEXT PRIMARY KEY NOT NULL,
    -- 1 for the local client; at most one live row should carry it
    is_self INTEGER NOT NULL DEFAULT 0,
    display_name TEXT NOT NULL,
    -- Long-term identity public key
    public_key TEXT NOT NULL,
    -- Only present for the self client
    private_key TEXT,
    status TEXT NOT NULL,
    auth_level TEXT NOT NULL,
    protocol_version TEXT NOT NULL,
    modified_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_client_display_name ON client(display_name);

-- Ephemeral keys advertised by (or generated for) a client
CREATE TABLE IF NOT EXISTS ephemeral_key (
    id TEXT PRIMARY KEY NOT NULL,
    client_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    -- Only present for keys owned by the self client
    private_key TEXT,
    status TEXT NOT NULL CHECK (status IN ('generated', 'published', 'revoked')),
    modified_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_ephemeral_key_client ON ephemeral_key(client_id, status);

-- Pairwise message sessions
CREATE TABLE IF NOT EXISTS message_session (
    id TEXT PRIMARY KEY NOT NULL,
    local_ephemeral_key_id TEXT NOT NULL,
    local_sequence INTEGER NOT NULL DEFAULT 0,
    remote_client_id TEXT NOT NULL,
    remote_identity_key TEXT NOT NULL,
    remote_ephemeral_key_id TEXT NOT NULL,
    -- Snapshot taken at establishment, not a live reference
    remote_ephemeral_key TEXT NOT NULL,
    remote_sequence INTEGER NOT NULL DEFAULT 0,
    phase TEXT NOT NULL,
    closed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_message_session_remote ON message_session(remote_client_id);

-- Message envelopes; id is assigned by the engine
CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    source_client_id TEXT NOT NULL,
    source_key_id TEXT NOT NULL,
    destination_client_id TEXT NOT NULL,
    destination_key_id TEXT NOT NULL,
    protocol_version TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    -- Opaque ciphertext, never rewritten
    content TEXT NOT NULL,
    modified_at INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id);
"#;

/// Migration SQL from schema version 1 → 2
///
/// Version 1 filtered sessions on a closed marker it never declared.
/// Adds the `closed` column and backfills it from the phase.
pub const MIGRATE_V1_TO_V2: &str = r#"
ALTER TABLE message_session ADD COLUMN closed INTEGER NOT NULL DEFAULT 0;
UPDATE message_session SET closed = 1 WHERE phase = 'closed';

-- Update schema version
UPDATE schema_version SET version = 2;
"#;

/// SQL to drop all tables (for reset)
pub const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS message;
DROP TABLE IF EXISTS message_session;
DROP TABLE IF EXISTS ephemeral_key;
DROP TABLE IF EXISTS client;
DROP TABLE IF EXISTS property;
DROP TABLE IF EXISTS schema_version;
"#;
