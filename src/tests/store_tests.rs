use tempfile::TempDir;

use crate::constants::{TIMESTAMP_MICRO_MAX, TSB_DELETION};
use crate::core::key::{GroupKey, ValueKey};
use crate::error::EmberError;
use crate::tests::util::{test_group_store, test_value_store};

#[test]
fn write_lookup_read() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);
    // Raw timestamp bits 0x500 are the public microsecond timestamp 5.
    let prior = store.core.write_inner(&key, 0x500, bytes::Bytes::from_static(b"testing"), true).unwrap();
    assert_eq!(prior, 0);

    let (timestamp, length) = store.lookup(&key).unwrap();
    assert_eq!(timestamp, 5);
    assert_eq!(length, 7);

    let mut value = Vec::new();
    let timestamp = store.read(&key, &mut value).unwrap();
    assert_eq!(timestamp, 5);
    assert_eq!(value, b"testing");
}

#[test]
fn never_seen_vs_tombstone() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);

    let mut value = Vec::new();
    match store.read(&key, &mut value) {
        Err(EmberError::NotFound { timestamp_micro }) => assert_eq!(timestamp_micro, 0),
        other => panic!("expected NotFound, got {other:?}"),
    }

    store.core.write_inner(&key, 0x500, bytes::Bytes::from_static(b"testing"), true).unwrap();
    store
        .core
        .write_inner(&key, 0x500 | TSB_DELETION, bytes::Bytes::new(), true)
        .unwrap();
    match store.read(&key, &mut value) {
        Err(EmberError::NotFound { timestamp_micro }) => assert_eq!(timestamp_micro, 5),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn delete_wins_timestamp_tie_both_orders() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);

    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"value").unwrap();
    store.delete(&key, 1000).unwrap();
    let mut value = Vec::new();
    match store.read(&key, &mut value) {
        Err(EmberError::NotFound { timestamp_micro }) => assert_eq!(timestamp_micro, 1000),
        other => panic!("expected NotFound, got {other:?}"),
    }

    let key = ValueKey::new(3, 4);
    store.delete(&key, 1000).unwrap();
    let prior = store.write(&key, 1000, b"value").unwrap();
    assert_eq!(prior, 1000);
    assert!(store.read(&key, &mut value).is_err());
}

#[test]
fn older_write_is_overridden() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);
    store.write(&key, 600, b"newer").unwrap();
    let prior = store.write(&key, 500, b"old").unwrap();
    assert_eq!(prior, 600);
    assert_eq!(store.stats().writes_overridden, 1);

    let mut value = Vec::new();
    let timestamp = store.read(&key, &mut value).unwrap();
    assert_eq!(timestamp, 600);
    assert_eq!(value, b"newer");
}

#[test]
fn timestamp_bounds() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);

    assert!(matches!(
        store.write(&key, 0, b"x"),
        Err(EmberError::TimestampOutOfRange(0))
    ));
    assert!(store.write(&key, 255, b"x").is_err());
    assert!(store.delete(&key, 0).is_err());

    store.write(&key, 256, b"min").unwrap();
    assert_eq!(store.lookup(&key).unwrap().0, 256);

    let key = ValueKey::new(3, 4);
    store.write(&key, TIMESTAMP_MICRO_MAX, b"max").unwrap();
    assert_eq!(store.lookup(&key).unwrap().0, TIMESTAMP_MICRO_MAX);
}

#[test]
fn value_cap_is_enforced() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);
    let oversized = vec![0u8; store.value_cap() as usize + 1];
    assert!(matches!(
        store.write(&key, 1000, &oversized),
        Err(EmberError::ValueTooLarge { .. })
    ));
    let exact = vec![7u8; store.value_cap() as usize];
    store.write(&key, 1000, &exact).unwrap();
    let mut value = Vec::new();
    store.read(&key, &mut value).unwrap();
    assert_eq!(value, exact);
}

#[test]
fn roundtrip_assorted_sizes() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    for (i, size) in [0usize, 1, 7, 9, 100, 1000, 4000].into_iter().enumerate() {
        let key = ValueKey::new(i as u64 + 1, i as u64);
        let payload: Vec<u8> = (0..size).map(|b| (b * 13 % 251) as u8).collect();
        store.write(&key, 1000 + i as i64, &payload).unwrap();
        let mut value = Vec::new();
        let timestamp = store.read(&key, &mut value).unwrap();
        assert_eq!(timestamp, 1000 + i as i64);
        assert_eq!(value, payload, "size {size}");
    }
}

#[test]
fn disabled_rejects_user_writes_but_not_deletes() {
    let dir = TempDir::new().unwrap();
    let store = crate::ValueStore::builder(
        dir.path().join("values"),
        dir.path().join("valuestoc"),
    )
    .workers(2)
    .page_size(4096)
    .build()
    .unwrap();
    let key = ValueKey::new(1, 2);
    assert!(matches!(
        store.write(&key, 1000, b"x"),
        Err(EmberError::Disabled)
    ));
    // Deletes go through the internal path so a full disk can drain.
    store.delete(&key, 1000).unwrap();

    store.enable_writes();
    store.write(&key, 2000, b"x").unwrap();

    store.disable_writes();
    assert!(matches!(
        store.write(&key, 3000, b"y"),
        Err(EmberError::Disabled)
    ));
    store.enable_writes();
    store.write(&key, 3000, b"y").unwrap();
}

#[test]
fn read_appends_to_existing_buffer() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"world").unwrap();
    let mut value = b"hello ".to_vec();
    store.read(&key, &mut value).unwrap();
    assert_eq!(value, b"hello world");
}

#[test]
fn group_write_and_lookup_group() {
    let dir = TempDir::new().unwrap();
    let store = test_group_store(&dir, None);
    store
        .write(&GroupKey::new(1, 2, 3, 4), 1000, b"first")
        .unwrap();
    store
        .write(&GroupKey::new(1, 2, 5, 6), 1001, b"second")
        .unwrap();
    store
        .write(&GroupKey::new(7, 7, 1, 1), 1002, b"other parent")
        .unwrap();

    let mut items = store.lookup_group(1, 2);
    items.sort_by_key(|item| (item.name_key_a, item.name_key_b));
    assert_eq!(items.len(), 2);
    assert_eq!((items[0].name_key_a, items[0].name_key_b), (3, 4));
    assert_eq!(items[0].timestamp_micro, 1000);
    assert_eq!((items[1].name_key_a, items[1].name_key_b), (5, 6));
    assert_eq!(items[1].timestamp_micro, 1001);

    let mut read = store.read_group(1, 2);
    read.sort_by_key(|item| (item.name_key_a, item.name_key_b));
    assert_eq!(read[0].value, b"first");
    assert_eq!(read[1].value, b"second");

    // Deleting a child removes it from the enumeration.
    store.delete(&GroupKey::new(1, 2, 3, 4), 2000).unwrap();
    let items = store.lookup_group(1, 2);
    assert_eq!(items.len(), 1);
    assert_eq!((items[0].name_key_a, items[0].name_key_b), (5, 6));
}

#[test]
fn flush_signals_completion() {
    let dir = TempDir::new().unwrap();
    let store = test_value_store(&dir, None);
    store.write(&ValueKey::new(1, 2), 1000, b"testing").unwrap();
    store.flush();
    let stats = store.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.writes, 1);
    // Reads still hit after the block migrated to the value file.
    let mut value = Vec::new();
    assert_eq!(store.read(&ValueKey::new(1, 2), &mut value).unwrap(), 1000);
    assert_eq!(value, b"testing");
}
