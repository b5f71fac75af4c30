//! Crash recovery tests for persistent storage.
//!
//! These tests verify that the storage layer correctly handles:
//! - Partial writes (simulated crash mid-append)
//! - WAL replay idempotency
//! - CRC corruption detection
//! - Compaction followed by further commits

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use idrecon::storage::{open_database, PersistentConfig};
use idrecon::{ContactId, ContactStore, IdentifyRequest, IdentityService};

const WAL_FILE: &str = "contacts.wal";

fn fast_config() -> Option<PersistentConfig> {
    Some(PersistentConfig {
        sync_on_write: false,
        ..PersistentConfig::default()
    })
}

fn identify(svc: &IdentityService, email: &str, phone: &str) -> ContactId {
    svc.identify(IdentifyRequest::new(Some(email), Some(phone)))
        .unwrap()
        .contact
        .primary_contact_id
}

#[test]
fn test_partial_wal_entry_recovery() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
        let svc = IdentityService::new(store);
        for i in 0..5 {
            identify(&svc, &format!("c{i}@hillvalley.edu"), &format!("{i}"));
        }
    }

    // Cut into the last record, as if the process died mid-append.
    {
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 7).unwrap();
    }

    let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
    assert_eq!(store.len().unwrap(), 4);

    // The torn tail is gone, so new commits land on a clean boundary.
    let svc = IdentityService::new(store);
    identify(&svc, "late@hillvalley.edu", "99");
    drop(svc);

    let store = open_database(dir.path(), fast_config()).unwrap();
    assert_eq!(store.len().unwrap(), 5);
}

#[test]
fn test_wal_replay_idempotency() {
    let dir = tempdir().unwrap();

    let first = {
        let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
        let svc = IdentityService::new(store.clone());
        identify(&svc, "george@hillvalley.edu", "919191");
        identify(&svc, "biffsucks@hillvalley.edu", "717171");
        identify(&svc, "george@hillvalley.edu", "717171");
        (1..=2)
            .map(|id| store.get(ContactId::new(id)).unwrap().unwrap())
            .collect::<Vec<_>>()
    };

    for _ in 0..2 {
        let store = open_database(dir.path(), fast_config()).unwrap();
        let replayed: Vec<_> = (1..=2)
            .map(|id| store.get(ContactId::new(id)).unwrap().unwrap())
            .collect();
        assert_eq!(replayed, first);
    }
}

#[test]
fn test_crc_corruption_detected() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
        let svc = IdentityService::new(store);
        identify(&svc, "doc@hillvalley.edu", "1955");
        identify(&svc, "marty@hillvalley.edu", "1985");
    }

    // Flip a byte inside the first record's payload.
    let mut bytes = fs::read(&wal_path).unwrap();
    let idx = 5 + 8 + 4;
    bytes[idx] ^= 0xFF;
    fs::write(&wal_path, bytes).unwrap();

    let result = open_database(dir.path(), fast_config());
    assert!(result.is_err(), "corrupted WAL must not open silently");
}

#[test]
fn test_compaction_then_more_commits() {
    let dir = tempdir().unwrap();

    {
        let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
        let svc = IdentityService::new(store.clone());
        identify(&svc, "lorraine@hillvalley.edu", "123456");
        identify(&svc, "mcfly@hillvalley.edu", "123456");

        let result = store.compact().unwrap();
        assert_eq!(result.rows, 2);

        identify(&svc, "mcfly@hillvalley.edu", "555");
    }

    let store = Arc::new(open_database(dir.path(), fast_config()).unwrap());
    assert_eq!(store.len().unwrap(), 3);

    let svc = IdentityService::new(store);
    let resp = svc
        .identify(IdentifyRequest::new(None::<&str>, Some("555")))
        .unwrap();
    assert_eq!(resp.contact.primary_contact_id, ContactId::new(1));
    assert_eq!(
        resp.contact.secondary_contact_ids,
        vec![ContactId::new(2), ContactId::new(3)]
    );
}

#[test]
fn test_lock_released_on_drop() {
    let dir = tempdir().unwrap();
    {
        let _store = open_database(dir.path(), fast_config()).unwrap();
        assert!(open_database(dir.path(), fast_config()).is_err());
    }
    assert!(open_database(dir.path(), fast_config()).is_ok());
}
