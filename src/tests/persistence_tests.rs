use std::fs::OpenOptions;
use std::time::Duration;

use tempfile::TempDir;

use crate::core::key::ValueKey;
use crate::error::EmberError;
use crate::tests::util::{test_value_store, wait_for};
use crate::ValueStore;

fn payload(i: u64) -> Vec<u8> {
    format!("value-{i}-{}", "x".repeat((i % 97) as usize)).into_bytes()
}

#[test]
fn flush_restart_recovers_everything() {
    let dir = TempDir::new().unwrap();
    let count = 500u64;
    {
        let store = test_value_store(&dir, None);
        for i in 0..count {
            let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
            store.write(&key, 1000 + i as i64, &payload(i)).unwrap();
        }
        store.flush();
    }
    let store = test_value_store(&dir, None);
    assert_eq!(store.stats().from_disk_count, count);
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        let mut value = Vec::new();
        let timestamp = store.read(&key, &mut value).unwrap();
        assert_eq!(timestamp, 1000 + i as i64, "key {i}");
        assert_eq!(value, payload(i), "key {i}");
    }
}

#[test]
fn timestamps_never_regress_across_restarts() {
    let dir = TempDir::new().unwrap();
    let key = ValueKey::new(1, 2);
    {
        let store = test_value_store(&dir, None);
        store.write(&key, 1000, b"old").unwrap();
        store.write(&key, 2000, b"new").unwrap();
        store.flush();
    }
    {
        let store = test_value_store(&dir, None);
        let mut value = Vec::new();
        assert_eq!(store.read(&key, &mut value).unwrap(), 2000);
        assert_eq!(value, b"new");
        // A write from before the restart still loses.
        assert_eq!(store.write(&key, 1500, b"stale").unwrap(), 2000);
        store.flush();
    }
    let store = test_value_store(&dir, None);
    let mut value = Vec::new();
    assert_eq!(store.read(&key, &mut value).unwrap(), 2000);
    assert_eq!(value, b"new");
}

#[test]
fn tombstones_persist() {
    let dir = TempDir::new().unwrap();
    let key = ValueKey::new(1, 2);
    {
        let store = test_value_store(&dir, None);
        store.write(&key, 1000, b"doomed").unwrap();
        store.delete(&key, 2000).unwrap();
        store.flush();
    }
    let store = test_value_store(&dir, None);
    let mut value = Vec::new();
    match store.read(&key, &mut value) {
        Err(EmberError::NotFound { timestamp_micro }) => assert_eq!(timestamp_micro, 2000),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let count = 200u64;
    {
        let store = test_value_store(&dir, None);
        for i in 0..count {
            store
                .write(&ValueKey::new(i, i), 1000 + i as i64, &payload(i))
                .unwrap();
        }
        store.flush();
    }
    for _ in 0..2 {
        let store = test_value_store(&dir, None);
        assert_eq!(store.stats().from_disk_count, count);
        for i in 0..count {
            let mut value = Vec::new();
            assert_eq!(
                store.read(&ValueKey::new(i, i), &mut value).unwrap(),
                1000 + i as i64
            );
        }
    }
}

#[test]
fn truncated_toc_recovers_good_prefix() {
    let dir = TempDir::new().unwrap();
    let count = 100u64;
    {
        let store = test_value_store(&dir, None);
        for i in 0..count {
            store
                .write(&ValueKey::new(i, i), 1000 + i as i64, b"abcdef")
                .unwrap();
        }
        store.flush();
    }
    let toc_dir = dir.path().join("valuestoc");
    let toc_path = std::fs::read_dir(&toc_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "valuetoc"))
        .expect("a toc file");
    let len = std::fs::metadata(&toc_path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&toc_path)
        .unwrap()
        .set_len(len - 10)
        .unwrap();

    let store = test_value_store(&dir, None);
    let recovered = store.stats().from_disk_count;
    assert!(recovered > 0, "nothing recovered");
    assert!(recovered < count, "truncation had no effect");
    // What was recovered still reads back.
    let mut hits = 0;
    for i in 0..count {
        let mut value = Vec::new();
        if store.read(&ValueKey::new(i, i), &mut value).is_ok() {
            assert_eq!(value, b"abcdef");
            hits += 1;
        }
    }
    assert_eq!(hits, recovered);
}

#[test]
fn compaction_rewrites_and_unlinks_dead_files() {
    let dir = TempDir::new().unwrap();
    let store = ValueStore::builder(dir.path().join("values"), dir.path().join("valuestoc"))
        .workers(2)
        .page_size(4096)
        .checksum_interval(1024)
        .compaction_retirement_grace(Duration::ZERO)
        .build()
        .unwrap();
    store.enable_writes();
    let count = 50u64;
    for i in 0..count {
        store
            .write(&ValueKey::new(i, i), 1000 + i as i64, &payload(i))
            .unwrap();
    }
    store.flush();
    // Everything in the first file is superseded by the second.
    for i in 0..count {
        store
            .write(&ValueKey::new(i, i), 5000 + i as i64, &payload(i + 1))
            .unwrap();
    }
    store.flush();
    let file_count = || {
        std::fs::read_dir(dir.path().join("values"))
            .unwrap()
            .count()
    };
    assert_eq!(file_count(), 2);

    store.compaction_pass(); // retires the dead file
    store.compaction_pass(); // unlinks it after the (zero) grace period
    assert!(wait_for(|| file_count() == 1));
    assert!(store.stats().compactions >= 1);

    for i in 0..count {
        let mut value = Vec::new();
        assert_eq!(
            store.read(&ValueKey::new(i, i), &mut value).unwrap(),
            5000 + i as i64
        );
        assert_eq!(value, payload(i + 1));
    }
}

#[test]
fn tombstone_discard_expires_old_tombstones() {
    let dir = TempDir::new().unwrap();
    let store = ValueStore::builder(dir.path().join("values"), dir.path().join("valuestoc"))
        .workers(2)
        .page_size(4096)
        .tombstone_age(Duration::ZERO)
        .build()
        .unwrap();
    store.enable_writes();
    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"doomed").unwrap();
    store.delete(&key, 2000).unwrap();

    // Known-with-tombstone before the pass...
    let mut value = Vec::new();
    match store.read(&key, &mut value) {
        Err(EmberError::NotFound { timestamp_micro }) => assert_eq!(timestamp_micro, 2000),
        other => panic!("expected NotFound, got {other:?}"),
    }

    store.tombstone_discard_pass();
    assert!(wait_for(|| store.stats().expired_deletions >= 1));
    store.flush();
    // ...and gone entirely once the local-removal record lands.
    assert!(wait_for(|| matches!(
        store.read(&key, &mut Vec::new()),
        Err(EmberError::NotFound { timestamp_micro: 0 })
    )));
}
