use byteorder::{BigEndian, ByteOrder};
use tempfile::TempDir;

use crate::core::key::{StoreKey, ValueKey};
use crate::error::EmberError;
use crate::ring::Msg;
use crate::tests::util::{test_value_store, wait_for, MsgRingPlaceholder, RingPlaceholder};

fn ack_bytes(entries: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for &(key_a, key_b, timestamp_bits) in entries {
        let start = bytes.len();
        bytes.resize(start + 24, 0);
        BigEndian::write_u64(&mut bytes[start..start + 8], key_a);
        BigEndian::write_u64(&mut bytes[start + 8..start + 16], key_b);
        BigEndian::write_u64(&mut bytes[start + 16..start + 24], timestamp_bits);
    }
    bytes
}

#[test]
fn out_msg_wire_layout() {
    let dir = TempDir::new().unwrap();
    let msg_ring = MsgRingPlaceholder::new(Some(RingPlaceholder::new(1, true)));
    let store = test_value_store(&dir, Some(msg_ring));
    let ack_state = store.bulk_set_ack.as_ref().unwrap();

    let empty = ack_state.new_out_msg().unwrap();
    assert_eq!(empty.msg_type(), ValueKey::BULK_SET_ACK_MSG_TYPE);
    assert_eq!(empty.msg_length(), 0);
    let mut content = Vec::new();
    empty.write_content(&mut content).unwrap();
    assert!(content.is_empty());
    Box::new(empty).done();

    let mut bsam = ack_state.new_out_msg().unwrap();
    assert!(bsam.add(&ValueKey::new(1, 2), 0x300));
    assert!(bsam.add(&ValueKey::new(4, 5), 0x600));
    assert_eq!(bsam.msg_length(), 48);
    let mut content = Vec::new();
    bsam.write_content(&mut content).unwrap();
    assert_eq!(
        content,
        vec![
            0, 0, 0, 0, 0, 0, 0, 1, // key_a
            0, 0, 0, 0, 0, 0, 0, 2, // key_b
            0, 0, 0, 0, 0, 0, 3, 0, // timestamp bits
            0, 0, 0, 0, 0, 0, 0, 4, // key_a
            0, 0, 0, 0, 0, 0, 0, 5, // key_b
            0, 0, 0, 0, 0, 0, 6, 0, // timestamp bits
        ]
    );
    Box::new(bsam).done();
}

#[test]
fn out_msg_hits_cap() {
    let dir = TempDir::new().unwrap();
    let msg_ring = MsgRingPlaceholder::new(Some(RingPlaceholder::new(1, true)));
    let store = crate::ValueStore::builder(
        dir.path().join("values"),
        dir.path().join("valuestoc"),
    )
    .workers(2)
    .page_size(4096)
    .bulk_set_ack_msg_cap(24 + 3)
    .msg_ring(msg_ring)
    .build()
    .unwrap();
    let mut bsam = store.bulk_set_ack.as_ref().unwrap().new_out_msg().unwrap();
    assert!(bsam.add(&ValueKey::new(1, 2), 0x300));
    assert!(!bsam.add(&ValueKey::new(4, 5), 0x600));
    Box::new(bsam).done();
}

#[test]
fn incoming_marks_unowned_keys_for_local_removal() {
    let dir = TempDir::new().unwrap();
    let ring = RingPlaceholder::new(1, false); // responsible for nothing
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));
    let key = ValueKey::new(1, 2);
    store.core.write_inner(&key, 0x300, bytes::Bytes::from_static(b"testing"), true).unwrap();

    msg_ring
        .deliver(ValueKey::BULK_SET_ACK_MSG_TYPE, &ack_bytes(&[(1, 2, 0x300)]))
        .unwrap();

    assert!(wait_for(|| matches!(
        store.read(&key, &mut Vec::new()),
        Err(EmberError::NotFound { .. })
    )));
    assert!(store.stats().in_bulk_set_ack_writes >= 1);
}

#[test]
fn incoming_keeps_owned_keys() {
    let dir = TempDir::new().unwrap();
    let ring = RingPlaceholder::new(1, true); // responsible for everything
    let msg_ring = MsgRingPlaceholder::new(Some(ring));
    let store = test_value_store(&dir, Some(msg_ring.clone()));
    let key = ValueKey::new(1, 2);
    store.core.write_inner(&key, 0x300, bytes::Bytes::from_static(b"testing"), true).unwrap();

    msg_ring
        .deliver(ValueKey::BULK_SET_ACK_MSG_TYPE, &ack_bytes(&[(1, 2, 0x300)]))
        .unwrap();
    assert!(wait_for(|| store.stats().in_bulk_set_acks == 1));
    std::thread::sleep(std::time::Duration::from_millis(100));

    let mut value = Vec::new();
    assert_eq!(store.read(&key, &mut value).unwrap(), 3);
    assert_eq!(value, b"testing");
}

#[test]
fn incoming_without_ring_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let msg_ring = MsgRingPlaceholder::new(None);
    let store = test_value_store(&dir, Some(msg_ring.clone()));
    let key = ValueKey::new(1, 2);
    store.core.write_inner(&key, 0x300, bytes::Bytes::from_static(b"testing"), true).unwrap();

    msg_ring
        .deliver(ValueKey::BULK_SET_ACK_MSG_TYPE, &ack_bytes(&[(1, 2, 0x300)]))
        .unwrap();
    assert!(wait_for(|| store.stats().in_bulk_set_acks == 1));
    std::thread::sleep(std::time::Duration::from_millis(100));

    let mut value = Vec::new();
    assert_eq!(store.read(&key, &mut value).unwrap(), 3);
    assert_eq!(value, b"testing");
}
