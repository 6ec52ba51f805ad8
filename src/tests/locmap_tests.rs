use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::{TSB_DELETION, TSB_LOCAL_REMOVAL};
use crate::core::key::{GroupKey, ValueKey};
use crate::core::locmap::{LocMap, LocMapConfig};

fn tiny_config() -> LocMapConfig {
    LocMapConfig {
        cores: 2,
        page_size: 2048,
        split_multiplier: 1.0,
    }
}

#[test]
fn get_missing_returns_zeroes() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let loc = locmap.get(&ValueKey::new(1, 2));
    assert_eq!(loc.timestamp, 0);
    assert_eq!(loc.block_id, 0);
    assert_eq!(loc.offset, 0);
    assert_eq!(loc.length, 0);
}

#[test]
fn set_then_get() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let key = ValueKey::new(1, 2);
    let prior = locmap.set(&key, 0x500, 7, 1234, 56, false);
    assert_eq!(prior, 0);
    let loc = locmap.get(&key);
    assert_eq!(loc.timestamp, 0x500);
    assert_eq!(loc.block_id, 7);
    assert_eq!(loc.offset, 1234);
    assert_eq!(loc.length, 56);
}

#[test]
fn newer_timestamp_wins() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let key = ValueKey::new(1, 2);
    locmap.set(&key, 0x600, 1, 0, 1, false);
    let prior = locmap.set(&key, 0x500, 2, 0, 2, false);
    assert_eq!(prior, 0x600);
    let loc = locmap.get(&key);
    assert_eq!(loc.timestamp, 0x600);
    assert_eq!(loc.block_id, 1);
}

#[test]
fn same_timestamp_needs_flag() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let key = ValueKey::new(1, 2);
    locmap.set(&key, 0x500, 1, 10, 1, false);
    locmap.set(&key, 0x500, 2, 20, 2, false);
    assert_eq!(locmap.get(&key).block_id, 1);
    let prior = locmap.set(&key, 0x500, 2, 20, 2, true);
    assert_eq!(prior, 0x500);
    let loc = locmap.get(&key);
    assert_eq!(loc.block_id, 2);
    assert_eq!(loc.offset, 20);
}

#[test]
fn deletion_wins_timestamp_tie() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let key = ValueKey::new(1, 2);
    locmap.set(&key, 0x500, 1, 0, 7, false);
    // A deletion at the same microsecond carries higher bits.
    let prior = locmap.set(&key, 0x500 | TSB_DELETION, 2, 0, 0, false);
    assert_eq!(prior, 0x500);
    assert_eq!(locmap.get(&key).timestamp, 0x500 | TSB_DELETION);
    // And the reverse order leaves the deletion in place.
    let prior = locmap.set(&key, 0x500, 3, 0, 7, false);
    assert_eq!(prior, 0x500 | TSB_DELETION);
    assert_eq!(locmap.get(&key).timestamp, 0x500 | TSB_DELETION);
}

#[test]
fn block_id_zero_removes() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    let key = ValueKey::new(1, 2);
    locmap.set(&key, 0x500, 1, 0, 7, false);
    locmap.set(&key, 0x600, 0, 0, 0, false);
    let loc = locmap.get(&key);
    assert_eq!(loc.timestamp, 0);
    assert_eq!(loc.block_id, 0);
}

#[test]
fn survives_splits() {
    let locmap: Arc<LocMap<ValueKey>> = Arc::new(LocMap::new(tiny_config()));
    // Far more entries than one tiny leaf holds, spread across the key_a
    // space so several splits trigger.
    let count = 4000u64;
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        assert_eq!(locmap.set(&key, 0x100 + i, 1, i as u32, 8, false), 0);
    }
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        let loc = locmap.get(&key);
        assert_eq!(loc.timestamp, 0x100 + i, "key {i}");
        assert_eq!(loc.offset, i as u32);
    }
    // Let background splits finish, then make sure a scan still sees
    // every entry exactly once.
    thread::sleep(Duration::from_millis(200));
    let mut seen = 0u64;
    let (_, more) = locmap.scan_callback(0, u64::MAX, 0, 0, 0, 0, &mut |_key, _ts, _len| {
        seen += 1;
        true
    });
    assert!(!more);
    assert_eq!(seen, count);
}

#[test]
fn concurrent_writers_and_readers() {
    let locmap: Arc<LocMap<ValueKey>> = Arc::new(LocMap::new(tiny_config()));
    let threads = 4;
    let per_thread = 1500u64;
    let mut handles = Vec::new();
    for t in 0..threads {
        let locmap = Arc::clone(&locmap);
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                let n = t * per_thread + i;
                let key = ValueKey::new(n.wrapping_mul(0x9e3779b97f4a7c15), n);
                locmap.set(&key, 0x100 + n, 1, n as u32, 4, false);
            }
        }));
    }
    for _ in 0..2 {
        let locmap = Arc::clone(&locmap);
        handles.push(thread::spawn(move || {
            for n in 0..threads * per_thread {
                let key = ValueKey::new(n.wrapping_mul(0x9e3779b97f4a7c15), n);
                let loc = locmap.get(&key);
                // Either absent (not yet written) or exactly what the
                // writer stored; never data from another key.
                if loc.block_id != 0 {
                    assert_eq!(loc.timestamp, 0x100 + n);
                    assert_eq!(loc.offset, n as u32);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for n in 0..threads * per_thread {
        let key = ValueKey::new(n.wrapping_mul(0x9e3779b97f4a7c15), n);
        assert_eq!(locmap.get(&key).timestamp, 0x100 + n);
    }
}

#[test]
fn unsplit_after_removal_keeps_map_usable() {
    let locmap: Arc<LocMap<ValueKey>> = Arc::new(LocMap::new(tiny_config()));
    let count = 3000u64;
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        locmap.set(&key, 0x100 + i, 1, 0, 4, false);
    }
    thread::sleep(Duration::from_millis(100));
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        locmap.set(&key, 0x10000 + i, 0, 0, 0, false);
    }
    thread::sleep(Duration::from_millis(200));
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        assert_eq!(locmap.get(&key).block_id, 0);
    }
    // The map keeps working after the merge-backs.
    let key = ValueKey::new(42, 42);
    locmap.set(&key, 0x500, 1, 0, 4, false);
    assert_eq!(locmap.get(&key).timestamp, 0x500);
}

#[test]
fn scan_callback_filters_and_range() {
    let locmap: LocMap<ValueKey> = LocMap::new(LocMapConfig::default());
    locmap.set(&ValueKey::new(0x1000, 1), 0x300, 1, 0, 4, false);
    locmap.set(&ValueKey::new(0x2000, 2), 0x400 | TSB_DELETION, 1, 0, 0, false);
    locmap.set(&ValueKey::new(0x3000, 3), 0x500 | TSB_LOCAL_REMOVAL, 1, 0, 4, false);
    locmap.set(&ValueKey::new(0x4000, 4), 0x900, 1, 0, 4, false);

    // Reject local removals.
    let mut seen = Vec::new();
    locmap.scan_callback(0, u64::MAX, 0, TSB_LOCAL_REMOVAL, 0, 0, &mut |key, ts, _| {
        seen.push((key.key_a, ts));
        true
    });
    seen.sort_unstable();
    assert_eq!(
        seen,
        vec![
            (0x1000, 0x300),
            (0x2000, 0x400 | TSB_DELETION),
            (0x4000, 0x900)
        ]
    );

    // Require deletions only.
    let mut seen = Vec::new();
    locmap.scan_callback(0, u64::MAX, TSB_DELETION, 0, 0, 0, &mut |key, ts, _| {
        seen.push((key.key_a, ts));
        true
    });
    assert_eq!(seen, vec![(0x2000, 0x400 | TSB_DELETION)]);

    // Cutoff excludes newer entries.
    let mut seen = Vec::new();
    locmap.scan_callback(0, u64::MAX, 0, TSB_LOCAL_REMOVAL, 0x800, 0, &mut |key, _, _| {
        seen.push(key.key_a);
        true
    });
    seen.sort_unstable();
    assert_eq!(seen, vec![0x1000, 0x2000]);

    // Range bounds are inclusive.
    let mut seen = Vec::new();
    locmap.scan_callback(0x2000, 0x4000, 0, 0, 0, 0, &mut |key, _, _| {
        seen.push(key.key_a);
        true
    });
    seen.sort_unstable();
    assert_eq!(seen, vec![0x2000, 0x3000, 0x4000]);
}

#[test]
fn scan_callback_resumes_after_max() {
    let locmap: LocMap<ValueKey> = LocMap::new(tiny_config());
    let count = 5000u64;
    for i in 0..count {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        locmap.set(&key, 0x100 + i, 1, 0, 4, false);
    }
    thread::sleep(Duration::from_millis(200));
    let mut seen = 0u64;
    let mut start = 0u64;
    let mut rounds = 0;
    loop {
        let (resume, more) = locmap.scan_callback(start, u64::MAX, 0, 0, 0, 500, &mut |_, _, _| {
            seen += 1;
            true
        });
        rounds += 1;
        if !more {
            break;
        }
        assert!(resume > start || start == 0);
        start = resume;
        assert!(rounds < 10_000, "scan failed to make progress");
    }
    assert_eq!(seen, count);
}

#[test]
fn get_group_returns_children() {
    let locmap: LocMap<GroupKey> = LocMap::new(LocMapConfig::default());
    locmap.set(&GroupKey::new(1, 2, 3, 4), 0x500, 1, 0, 4, false);
    locmap.set(&GroupKey::new(1, 2, 5, 6), 0x600, 1, 4, 4, false);
    locmap.set(&GroupKey::new(9, 9, 7, 8), 0x700, 1, 8, 4, false);
    // A tombstoned child is inactive and must not be listed.
    locmap.set(&GroupKey::new(1, 2, 7, 8), 0x700 | TSB_DELETION, 1, 0, 0, false);

    let mut items = locmap.get_group(1, 2);
    items.sort_unstable();
    assert_eq!(items, vec![(3, 4, 0x500), (5, 6, 0x600)]);
    assert!(locmap.get_group(8, 8).is_empty());
}
