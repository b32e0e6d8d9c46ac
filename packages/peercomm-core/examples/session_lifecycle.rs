//! # Session Lifecycle Demo
//!
//! This example walks through the bookkeeping side of a peer exchange:
//! 1. Register the local client and a paired peer
//! 2. The peer rotates its ephemeral key bundle
//! 3. The first message lazily establishes a session
//! 4. Counters advance, messages are read and deleted, the session closes
//!
//! ## Run
//!
//! ```bash
//! RUST_LOG=peercomm_core=debug cargo run --example session_lifecycle
//! ```

use peercomm_core::{
    Client, Database, EphemeralKey, KeyStatus, MessageFilter, MessageSession, NewMessage,
    PrivateKey, SessionPhase, SessionUpdate,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=================================================");
    println!("        PEERCOMM SESSION LIFECYCLE DEMO");
    println!("=================================================\n");

    let db = Database::open_in_memory().expect("Failed to open database");

    // =========================================================================
    // STEP 1: Register self and peer
    // =========================================================================
    println!("1. Registering clients...\n");

    let my_key_id = EphemeralKey::generate_id();
    let me = Client::new("alice", "Alice", "alice-identity-pub")
        .as_self(PrivateKey::new("alice-identity-secret"))
        .with_status("active")
        .with_protocol_version("1")
        .with_ephemeral_keys(vec![EphemeralKey::new(
            &my_key_id,
            "alice",
            "alice-ephemeral-pub",
            KeyStatus::Published,
        )
        .with_private_key(PrivateKey::new("alice-ephemeral-secret"))]);
    db.clients().create(&me).expect("Failed to store self");

    let bob = Client::new("bob", "Bob", "bob-identity-pub")
        .with_status("paired")
        .with_auth_level("full")
        .with_protocol_version("1")
        .with_ephemeral_keys(vec![
            EphemeralKey::new("bob-k1", "bob", "bob-k1-pub", KeyStatus::Published),
            EphemeralKey::new("bob-k2", "bob", "bob-k2-pub", KeyStatus::Published),
        ]);
    db.clients().create(&bob).expect("Failed to store peer");

    let stored_self = db.clients().get_self().expect("Self client missing");
    println!("   Self:  {} ({:?})", stored_self.display_name, stored_self.private_key);
    for client in db.clients().list().expect("Failed to list clients") {
        println!(
            "   Client {} has {} published key(s)",
            client.id,
            client.ephemeral_keys.len()
        );
    }
    println!();

    // =========================================================================
    // STEP 2: Bob republishes his bundle
    // =========================================================================
    println!("2. Bob rotates his ephemeral keys...\n");

    let report = db
        .ephemeral_keys()
        .reconcile(
            "bob",
            &[
                EphemeralKey::new("bob-k2", "bob", "bob-k2-pub", KeyStatus::Published),
                EphemeralKey::new("bob-k3", "bob", "bob-k3-pub", KeyStatus::Published),
            ],
            true,
        )
        .expect("Reconciliation failed");
    println!("   Created: {:?}", report.created);
    println!("   Updated: {:?}", report.updated);
    println!("   Revoked: {:?}", report.revoked);
    println!();

    // =========================================================================
    // STEP 3: First message establishes the session
    // =========================================================================
    println!("3. Sending the first message...\n");

    let session_id = MessageSession::derive_id(&my_key_id, "bob-k3");
    let session = MessageSession::new(
        &session_id,
        &my_key_id,
        "bob",
        "bob-identity-pub",
        "bob-k3",
        "bob-k3-pub",
    );

    let first = NewMessage {
        session: session.clone(),
        source_client_id: "alice".into(),
        source_key_id: my_key_id.clone(),
        destination_client_id: "bob".into(),
        destination_key_id: "bob-k3".into(),
        protocol_version: "1".into(),
        sequence: 1,
        message_type: "text".into(),
        content: "b64:ciphertext-one".into(),
    };
    let first_id = db.messages().create(&first).expect("Failed to store message");
    db.sessions()
        .update(
            &session_id,
            SessionUpdate::default()
                .phase(SessionPhase::Active)
                .local_sequence(1),
        )
        .expect("Failed to advance session");

    let second = NewMessage {
        sequence: 2,
        content: "b64:ciphertext-two".into(),
        ..first
    };
    let second_id = db.messages().create(&second).expect("Failed to store message");

    let stored = db.messages().get(second_id).expect("Message missing");
    println!("   Session id:     {}", session_id);
    println!("   Message ids:    {}, {}", first_id, second_id);
    println!("   Session phase:  {}", stored.session.phase);
    println!(
        "   Sessions with bob: {}",
        db.sessions()
            .list_for_client("bob", true)
            .expect("Failed to list sessions")
            .len()
    );
    println!();

    // =========================================================================
    // STEP 4: Read, delete, close
    // =========================================================================
    println!("4. Reading, deleting and closing...\n");

    db.messages().mark_read(first_id).expect("Failed to mark read");
    db.messages().delete(second_id).expect("Failed to delete");

    let unread = db
        .messages()
        .list(&MessageFilter::default().session(&session_id).unread_only())
        .expect("Failed to list messages");
    let everything = db
        .messages()
        .list(&MessageFilter::default().session(&session_id).with_deleted())
        .expect("Failed to list messages");
    println!("   Unread, not deleted: {}", unread.len());
    println!("   All, with deleted:   {}", everything.len());

    db.sessions().close(&session_id).expect("Failed to close session");
    println!(
        "   Open sessions with bob after close: {}",
        db.sessions()
            .list_for_client("bob", false)
            .expect("Failed to list sessions")
            .len()
    );

    println!("\n=================================================");
    println!("                 DEMO COMPLETE");
    println!("=================================================");
}
