//! Registry transactions from independent handles: the file lock must
//! linearize read-modify-write cycles, bound its wait, and survive
//! restarts of the owning process (modeled as fresh `Registry` values).

use slink::registry::{Outcome, Registry, ServiceRecord};
use slink::HostKey;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn state_survives_reopening() {
    let dir = TempDir::new().unwrap();
    let key = HostKey::managed("login01");

    {
        let registry = Registry::open(dir.path());
        registry
            .with_transaction(&key, |_| {
                let mut record = ServiceRecord::new(Some(9001), 21001);
                record.consumers.insert("job-a".to_string());
                Ok((Outcome::Keep(record), ()))
            })
            .unwrap();
    }

    // A different process later: fresh handle, same document.
    let registry = Registry::open(dir.path());
    registry
        .with_transaction(&key, |current| {
            let record = current.expect("record persisted across handles");
            assert_eq!(record.pid, Some(9001));
            assert_eq!(record.port, 21001);
            assert!(record.consumers.contains("job-a"));
            Ok((Outcome::Keep(record), ()))
        })
        .unwrap();
}

#[test]
fn independent_handles_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let key = HostKey::managed("login01");

    Registry::open(dir.path())
        .with_transaction(&key, |_| {
            Ok((Outcome::Keep(ServiceRecord::new(Some(1), 21002)), ()))
        })
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let path = dir.path().to_path_buf();
            let key = key.clone();
            std::thread::spawn(move || {
                // Every thread opens its own Registry, as a separate
                // process would.
                let registry =
                    Registry::open(&path).with_lock_timeout(Duration::from_secs(60));
                for i in 0..20 {
                    registry
                        .with_transaction(&key, |current| {
                            let mut record = current.expect("record exists");
                            record.consumers.insert(format!("job-{}-{}", t, i));
                            Ok((Outcome::Keep(record), ()))
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = Registry::open(dir.path()).snapshot().unwrap();
    assert_eq!(snapshot["login01"].consumers.len(), 6 * 20);
}

#[test]
fn lock_contention_times_out_instead_of_hanging() {
    let dir = TempDir::new().unwrap();
    let key = HostKey::managed("login01");

    let registry = Registry::open(dir.path()).with_lock_timeout(Duration::from_millis(300));
    let inner = Registry::open(dir.path()).with_lock_timeout(Duration::from_millis(300));

    // Re-entering the registry from inside a transaction is exactly the
    // "someone else holds the lock" situation, without needing a second
    // process.
    let result: slink::Result<()> = registry.with_transaction(&key, |_| {
        let nested: slink::Result<()> =
            inner.with_transaction(&key, |_| Ok((Outcome::Delete, ())));
        match nested {
            Err(slink::Error::LockTimeout { .. }) => {}
            other => panic!("expected LockTimeout, got {:?}", other.map(|_| ())),
        }
        Ok((Outcome::Delete, ()))
    });
    result.unwrap();
}
