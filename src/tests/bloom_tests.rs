use crate::constants::BLOOM_FILTER_HEADER_SIZE;
use crate::core::key::ValueKey;
use crate::replication::bloom::KtBloomFilter;

#[test]
fn no_false_negatives() {
    let mut filter = KtBloomFilter::new(5000, 0.001, 7);
    for i in 0..5000u64 {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        filter.add(&key, 0x100 + i);
    }
    for i in 0..5000u64 {
        let key = ValueKey::new(i.wrapping_mul(0x9e3779b97f4a7c15), i);
        assert!(filter.may_have(&key, 0x100 + i), "false negative at {i}");
    }
}

#[test]
fn false_positive_rate_is_sane() {
    let mut filter = KtBloomFilter::new(2000, 0.001, 0);
    for i in 0..2000u64 {
        filter.add(&ValueKey::new(i, i), 0x500);
    }
    let mut false_positives = 0;
    for i in 0..10_000u64 {
        if filter.may_have(&ValueKey::new(1_000_000 + i, i), 0x500) {
            false_positives += 1;
        }
    }
    // p = 0.001 over 10k probes expects ~10; allow generous slack.
    assert!(false_positives < 200, "false positives: {false_positives}");
}

#[test]
fn timestamp_is_part_of_the_tuple() {
    let mut filter = KtBloomFilter::new(1000, 0.001, 0);
    let key = ValueKey::new(1, 2);
    filter.add(&key, 0x500);
    assert!(filter.may_have(&key, 0x500));
    assert!(!filter.may_have(&key, 0x600));
}

#[test]
fn salt_changes_decisions() {
    let mut a = KtBloomFilter::new(1000, 0.001, 1);
    let mut b = KtBloomFilter::new(1000, 0.001, 2);
    for i in 0..1000u64 {
        let key = ValueKey::new(i, i);
        a.add(&key, 0x500);
        b.add(&key, 0x500);
    }
    assert_ne!(a.bitfield(), b.bitfield());
}

#[test]
fn reset_clears_and_reseeds() {
    let mut filter = KtBloomFilter::new(1000, 0.001, 1);
    filter.add(&ValueKey::new(1, 2), 0x500);
    filter.reset(2);
    assert!(filter.bitfield().iter().all(|&b| b == 0));
}

#[test]
fn serialization_roundtrip() {
    let mut filter = KtBloomFilter::new(1000, 0.01, 42);
    for i in 0..1000u64 {
        filter.add(&ValueKey::new(i, i), 0x100 + i);
    }
    let mut header = vec![0u8; BLOOM_FILTER_HEADER_SIZE];
    filter.write_header(&mut header);
    let revived = KtBloomFilter::from_parts(&header, filter.bitfield()).unwrap();
    for i in 0..1000u64 {
        assert!(revived.may_have(&ValueKey::new(i, i), 0x100 + i));
    }
    assert!(KtBloomFilter::from_parts(&header, &filter.bitfield()[1..]).is_err());
    assert!(KtBloomFilter::from_parts(&header[..10], filter.bitfield()).is_err());
}
