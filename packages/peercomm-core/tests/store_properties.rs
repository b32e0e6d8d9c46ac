//! Cross-component behaviour of the store: self lookup, key rotation,
//! lazy session bootstrap, soft delete and caller-scoped transactions.

use std::time::Duration;

use peercomm_core::{
    Client, Database, DatabaseConfig, EphemeralKey, Error, KeyStatus, MessageFilter,
    MessageSession, NewMessage, PrivateKey, SessionPhase, SessionUpdate,
};

fn published(client: &str, id: &str) -> EphemeralKey {
    EphemeralKey::new(id, client, format!("{}-pub", id), KeyStatus::Published)
}

fn message(session: &MessageSession, sequence: i64) -> NewMessage {
    NewMessage {
        session: session.clone(),
        source_client_id: "me".into(),
        source_key_id: session.local_ephemeral_key_id.clone(),
        destination_client_id: session.remote_client_id.clone(),
        destination_key_id: session.remote_ephemeral_key_id.clone(),
        protocol_version: "1".into(),
        sequence,
        message_type: "text".into(),
        content: format!("opaque-{}", sequence),
    }
}

fn bob_session() -> MessageSession {
    let id = MessageSession::derive_id("my-k1", "bob-k1");
    MessageSession::new(id, "my-k1", "bob", "bob-identity", "bob-k1", "bob-k1-pub")
}

#[test]
fn test_self_lookup() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.clients().get_self().unwrap_err().is_not_found());

    db.clients()
        .create(&Client::new("bob", "Bob", "bob-pub"))
        .unwrap();
    assert!(db.clients().get_self().unwrap_err().is_not_found());

    db.clients()
        .create(&Client::new("me", "Me", "me-pub").as_self(PrivateKey::new("me-secret")))
        .unwrap();
    assert_eq!(db.clients().get_self().unwrap().id, "me");
}

#[test]
fn test_client_read_returns_published_subset() {
    let db = Database::open_in_memory().unwrap();
    let keys = vec![
        published("bob", "k1"),
        published("bob", "k2"),
        EphemeralKey::new("k3", "bob", "k3-pub", KeyStatus::Generated),
        EphemeralKey::new("k4", "bob", "k4-pub", KeyStatus::Revoked),
        published("bob", "k5"),
    ];
    db.clients()
        .create(&Client::new("bob", "Bob", "bob-pub").with_ephemeral_keys(keys))
        .unwrap();
    db.ephemeral_keys().delete("k5").unwrap();

    let bob = db.clients().get_by_id("bob").unwrap();
    let mut ids: Vec<&str> = bob.ephemeral_keys.iter().map(|k| k.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["k1", "k2"]);
    assert!(bob.ephemeral_keys.iter().all(|k| k.is_live()));
}

#[test]
fn test_key_rotation() {
    let db = Database::open_in_memory().unwrap();
    db.clients()
        .create(
            &Client::new("bob", "Bob", "bob-pub")
                .with_ephemeral_keys(vec![published("bob", "A"), published("bob", "B")]),
        )
        .unwrap();
    let b_before = db.ephemeral_keys().get("bob", "B", false).unwrap().unwrap();

    db.ephemeral_keys()
        .reconcile("bob", &[published("bob", "B"), published("bob", "C")], true)
        .unwrap();

    let a = db.ephemeral_keys().get("bob", "A", true).unwrap().unwrap();
    assert_eq!(a.status, KeyStatus::Revoked);
    assert!(a.deleted);

    let b_after = db.ephemeral_keys().get("bob", "B", false).unwrap().unwrap();
    assert_eq!(b_after.public_key, b_before.public_key);
    assert_eq!(b_after.status, KeyStatus::Published);

    let ids: Vec<String> = db
        .ephemeral_keys()
        .list_published("bob")
        .unwrap()
        .into_iter()
        .map(|k| k.id.clone())
        .collect();
    assert_eq!(ids, vec!["B", "C"]);
}

#[test]
fn test_lazy_bootstrap_creates_one_session() {
    let db = Database::open_in_memory().unwrap();
    let session = bob_session();

    let first = db.messages().create(&message(&session, 1)).unwrap();
    assert_eq!(db.sessions().list_for_client("bob", true).unwrap().len(), 1);
    assert_eq!(db.messages().list(&MessageFilter::default()).unwrap().len(), 1);

    let second = db.messages().create(&message(&session, 2)).unwrap();
    assert!(second > first);
    assert_eq!(db.sessions().list_for_client("bob", true).unwrap().len(), 1);
    assert_eq!(db.messages().list(&MessageFilter::default()).unwrap().len(), 2);
}

#[test]
fn test_session_snapshot_survives_key_revocation() {
    let db = Database::open_in_memory().unwrap();
    db.clients()
        .create(
            &Client::new("bob", "Bob", "bob-pub")
                .with_ephemeral_keys(vec![published("bob", "bob-k1")]),
        )
        .unwrap();
    let session = bob_session();
    db.messages().create(&message(&session, 1)).unwrap();

    db.ephemeral_keys().reconcile("bob", &[], true).unwrap();

    let stored = db.sessions().get(&session.id).unwrap().unwrap();
    assert_eq!(stored.remote_ephemeral_key, "bob-k1-pub");
}

#[test]
fn test_message_soft_delete() {
    let db = Database::open_in_memory().unwrap();
    let id = db.messages().create(&message(&bob_session(), 1)).unwrap();

    db.messages().delete(id).unwrap();

    assert!(db.messages().list(&MessageFilter::default()).unwrap().is_empty());
    assert_eq!(
        db.messages()
            .list(&MessageFilter::default().with_deleted())
            .unwrap()[0]
            .id,
        id
    );
    assert!(db.messages().get(id).unwrap_err().is_not_found());
    assert!(db.messages().get_including_deleted(id).unwrap().deleted);
}

#[test]
fn test_empty_session_update_is_harmless() {
    let db = Database::open_in_memory().unwrap();
    let session = bob_session().with_phase(SessionPhase::Active);
    db.sessions().create(&session).unwrap();

    assert!(!db.sessions().update(&session.id, SessionUpdate::default()).unwrap());
    assert_eq!(db.sessions().get(&session.id).unwrap().unwrap(), session);
}

#[test]
fn test_property_fallback() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(
        db.properties().get_or("missing-key", "fallback").unwrap(),
        "fallback"
    );
    assert!(db.properties().get("missing-key").unwrap_err().is_not_found());
}

#[test]
fn test_transaction_groups_repositories() {
    let db = Database::open_in_memory().unwrap();
    let session = bob_session();

    let id = db
        .transaction(|tx| {
            tx.clients().create(
                &Client::new("bob", "Bob", "bob-pub")
                    .with_ephemeral_keys(vec![published("bob", "bob-k1")]),
            )?;
            let id = tx.messages().create(&message(&session, 1))?;
            tx.sessions()
                .update(&session.id, SessionUpdate::default().local_sequence(1))?;
            Ok(id)
        })
        .unwrap();

    let stored = db.messages().get(id).unwrap();
    assert_eq!(stored.session.local_sequence, 1);
    assert_eq!(db.clients().get_by_id("bob").unwrap().ephemeral_keys.len(), 1);
}

#[test]
fn test_transaction_rolls_back_every_repository() {
    let db = Database::open_in_memory().unwrap();
    let session = bob_session();

    let result: peercomm_core::Result<()> = db.transaction(|tx| {
        tx.clients().create(&Client::new("bob", "Bob", "bob-pub"))?;
        tx.messages().create(&message(&session, 1))?;
        tx.properties().set("last-peer", "bob")?;
        // Fails: nothing by this id
        tx.clients().update(&Client::new("carol", "Carol", "carol-pub"))
    });

    assert!(result.unwrap_err().is_not_found());
    assert!(db.clients().list().unwrap().is_empty());
    assert!(db.sessions().get(&session.id).unwrap().is_none());
    assert!(!db.properties().has("last-peer").unwrap());
}

#[test]
fn test_clones_share_connection_across_threads() {
    let db = Database::open_in_memory().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let db = db.clone();
            std::thread::spawn(move || {
                for j in 0..10 {
                    db.properties()
                        .set(&format!("t{}-{}", i, j), "x")
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.properties().list().unwrap().len(), 40);
}

#[test]
fn test_file_database_reopens_with_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::at(dir.path().join("peercomm.db"));
    let session = bob_session();

    {
        let db = Database::open(config.clone()).unwrap();
        db.messages().create(&message(&session, 1)).unwrap();
        db.sessions().close(&session.id).unwrap();
    }

    let db = Database::open(config).unwrap();
    assert!(db.sessions().list_for_client("bob", false).unwrap().is_empty());
    let closed = db
        .messages()
        .list(&MessageFilter::default().phase(SessionPhase::Closed))
        .unwrap();
    assert_eq!(closed.len(), 1);
}

#[test]
fn test_lock_contention_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peercomm.db");
    let first = Database::open(DatabaseConfig::at(&path)).unwrap();
    let second = Database::open(
        DatabaseConfig::at(&path).with_statement_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    first
        .transaction(|tx| {
            tx.properties().set("x", "1")?;
            let err = second.properties().set("y", "2").unwrap_err();
            assert!(matches!(err, Error::Timeout(_)));
            assert!(err.is_storage_fault());
            assert!(err.is_recoverable());
            Ok(())
        })
        .unwrap();

    assert!(!second.properties().has("y").unwrap());
    assert_eq!(second.properties().get("x").unwrap(), "1");
}
