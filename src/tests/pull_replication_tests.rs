use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tempfile::TempDir;

use crate::constants::{BLOOM_FILTER_HEADER_SIZE, PULL_REPLICATION_MSG_HEADER_SIZE};
use crate::core::key::{StoreKey, ValueKey};
use crate::core::timestamp;
use crate::replication::bloom::KtBloomFilter;
use crate::tests::util::{test_value_store, wait_for, MsgRingPlaceholder, RingPlaceholder};

fn pull_msg_bytes(
    node_id: u64,
    partition: u32,
    cutoff: u64,
    range_start: u64,
    range_stop: u64,
    filter: &KtBloomFilter,
) -> Vec<u8> {
    let mut bytes =
        vec![0u8; PULL_REPLICATION_MSG_HEADER_SIZE + BLOOM_FILTER_HEADER_SIZE];
    BigEndian::write_u64(&mut bytes[0..8], node_id);
    BigEndian::write_u64(&mut bytes[8..16], 1); // ring version
    BigEndian::write_u32(&mut bytes[16..20], partition);
    BigEndian::write_u64(&mut bytes[20..28], cutoff);
    BigEndian::write_u64(&mut bytes[28..36], range_start);
    BigEndian::write_u64(&mut bytes[36..44], range_stop);
    filter.write_header(&mut bytes[PULL_REPLICATION_MSG_HEADER_SIZE..]);
    bytes.extend_from_slice(filter.bitfield());
    bytes
}

#[test]
fn out_pass_sends_summaries_covering_local_entries() {
    let dir = TempDir::new().unwrap();
    let ring: Arc<dyn crate::ring::Ring> = Arc::new(RingPlaceholder {
        version: 1,
        partition_bit_count: 2,
        replica_count: 2,
        local_node_id: 77,
        responsible_for_everything: true,
    });
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));

    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"testing").unwrap();

    store.pull_replication_pass();
    assert!(msg_ring.sent_count() > 0);
    let sent = msg_ring.take_sent();
    let mut covered = false;
    for msg in &sent {
        assert_eq!(msg.msg_type, ValueKey::PULL_REPLICATION_MSG_TYPE);
        assert!(msg.to_partition.is_some());
        let header = &msg.content[..PULL_REPLICATION_MSG_HEADER_SIZE];
        assert_eq!(BigEndian::read_u64(&header[0..8]), 77); // local node id
        assert_eq!(BigEndian::read_u64(&header[8..16]), 1); // ring version
        let range_start = BigEndian::read_u64(&header[28..36]);
        let range_stop = BigEndian::read_u64(&header[36..44]);
        assert!(range_start <= range_stop);
        if range_start <= key.key_a && key.key_a <= range_stop {
            assert_eq!(msg.to_partition, Some(0));
            let filter = KtBloomFilter::from_parts(
                &msg.content[PULL_REPLICATION_MSG_HEADER_SIZE..],
                &msg.content[PULL_REPLICATION_MSG_HEADER_SIZE + BLOOM_FILTER_HEADER_SIZE..],
            )
            .unwrap();
            assert!(filter.may_have(&key, 1000u64 << 8));
            covered = true;
        }
    }
    assert!(covered, "no summary covered the written key");
}

#[test]
fn incoming_summary_gets_missing_entries_in_response() {
    let dir = TempDir::new().unwrap();
    let ring = RingPlaceholder::new(1, true);
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));

    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"testing").unwrap();

    let filter = KtBloomFilter::new(128, 0.01, 3);
    let bytes = pull_msg_bytes(99, 0, timestamp::now_bits(), 0, u64::MAX, &filter);
    msg_ring
        .deliver(ValueKey::PULL_REPLICATION_MSG_TYPE, &bytes)
        .unwrap();

    assert!(wait_for(|| msg_ring.sent_count() > 0));
    let sent = msg_ring.take_sent();
    assert_eq!(sent[0].msg_type, ValueKey::BULK_SET_MSG_TYPE);
    assert_eq!(sent[0].to_node, Some(99));
    let content = &sent[0].content;
    // Responses ask for no acknowledgement.
    assert_eq!(BigEndian::read_u64(&content[0..8]), 0);
    assert_eq!(BigEndian::read_u64(&content[8..16]), 1); // key_a
    assert_eq!(BigEndian::read_u64(&content[16..24]), 2); // key_b
    assert_eq!(BigEndian::read_u64(&content[24..32]), 1000u64 << 8);
    assert_eq!(BigEndian::read_u32(&content[32..36]), 7);
    assert_eq!(&content[36..43], b"testing");
}

#[test]
fn incoming_summary_covering_everything_stays_quiet() {
    let dir = TempDir::new().unwrap();
    let ring = RingPlaceholder::new(1, true);
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));

    let key = ValueKey::new(1, 2);
    store.write(&key, 1000, b"testing").unwrap();

    let mut filter = KtBloomFilter::new(128, 0.01, 3);
    filter.add(&key, 1000u64 << 8);
    let bytes = pull_msg_bytes(99, 0, timestamp::now_bits(), 0, u64::MAX, &filter);
    msg_ring
        .deliver(ValueKey::PULL_REPLICATION_MSG_TYPE, &bytes)
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(150));
    assert_eq!(msg_ring.sent_count(), 0);
    assert_eq!(store.stats().in_pull_replications, 1);
}

#[test]
fn tombstones_replicate_in_responses() {
    let dir = TempDir::new().unwrap();
    let ring = RingPlaceholder::new(1, true);
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));

    // Tombstones older than tombstone_age are left out of responses, so
    // use current wall timestamps here.
    let key = ValueKey::new(1, 2);
    let deleted_at = timestamp::now_micro();
    store.write(&key, deleted_at - 100, b"doomed").unwrap();
    store.delete(&key, deleted_at).unwrap();

    let filter = KtBloomFilter::new(128, 0.01, 3);
    let bytes = pull_msg_bytes(99, 0, timestamp::now_bits(), 0, u64::MAX, &filter);
    msg_ring
        .deliver(ValueKey::PULL_REPLICATION_MSG_TYPE, &bytes)
        .unwrap();

    assert!(wait_for(|| msg_ring.sent_count() > 0));
    let sent = msg_ring.take_sent();
    let content = &sent[0].content;
    assert_eq!(BigEndian::read_u64(&content[8..16]), 1); // key_a
    let timestamp_bits = BigEndian::read_u64(&content[24..32]);
    assert_eq!(
        timestamp_bits,
        ((deleted_at as u64) << 8) | crate::constants::TSB_DELETION
    );
    assert_eq!(BigEndian::read_u32(&content[32..36]), 0); // no value bytes
}

#[test]
fn short_summary_is_discarded() {
    let dir = TempDir::new().unwrap();
    let msg_ring = MsgRingPlaceholder::new(Some(RingPlaceholder::new(1, true)));
    let store = test_value_store(&dir, Some(msg_ring.clone()));

    let bytes = vec![0u8; 10];
    let consumed = msg_ring
        .deliver(ValueKey::PULL_REPLICATION_MSG_TYPE, &bytes)
        .unwrap();
    assert_eq!(consumed, 10);
    assert!(wait_for(|| store.stats().in_pull_replication_invalids == 1));
}
