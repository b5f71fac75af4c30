//! Concurrent reconciliation against one shared store.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use idrecon::{ContactId, IdentifyRequest, IdentityService, InMemoryContactStore};

const THREADS: usize = 8;

#[test]
fn test_racing_first_sightings_produce_one_primary() {
    let store = Arc::new(InMemoryContactStore::new());
    let svc = IdentityService::new(store.clone());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let svc = svc.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                svc.identify(IdentifyRequest::new(
                    Some("marty@hillvalley.edu"),
                    Some("555-1985"),
                ))
                .unwrap()
            })
        })
        .collect();

    let primaries: HashSet<ContactId> = handles
        .into_iter()
        .map(|h| h.join().unwrap().contact.primary_contact_id)
        .collect();

    assert_eq!(primaries.len(), 1);
    assert_eq!(store.snapshot().unwrap().len(), 1);
}

#[test]
fn test_interleaved_bridges_leave_a_single_consistent_cluster() {
    let store = Arc::new(InMemoryContactStore::new());
    let svc = IdentityService::new(store.clone());

    // Seed independent clusters.
    for i in 0..THREADS {
        svc.identify(IdentifyRequest::new(
            Some(format!("user{i}@hillvalley.edu").as_str()),
            Some(format!("{i}00").as_str()),
        ))
        .unwrap();
    }

    // Each thread bridges cluster i with cluster i + 1.
    let barrier = Arc::new(Barrier::new(THREADS - 1));
    let handles: Vec<_> = (0..THREADS - 1)
        .map(|i| {
            let svc = svc.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let email = format!("user{i}@hillvalley.edu");
                let phone = format!("{}00", i + 1);
                svc.identify(IdentifyRequest::new(Some(email.as_str()), Some(phone.as_str())))
                    .unwrap()
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let rows = store.snapshot().unwrap();
    let primaries: Vec<_> = rows.iter().filter(|c| c.is_primary()).collect();
    assert_eq!(primaries.len(), 1);
    let root = primaries[0].id;
    assert_eq!(root, ContactId::new(1));

    for row in rows.iter().filter(|c| !c.is_primary()) {
        assert_eq!(row.linked_id, Some(root), "contact {} is not linked to root", row.id);
    }
}
