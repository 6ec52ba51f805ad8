//! Store key arities.
//!
//! The engine is generic over its key: the value variant addresses entries by
//! a 128-bit (key_a, key_b) pair, the group variant by a 256-bit quadruple
//! whose second pair names a child under the (key_a, key_b) parent. All
//! on-disk and wire encodings are big-endian.

use std::fmt;
use std::hash::Hash;

use byteorder::{BigEndian, ByteOrder};

/// A pre-hashed, uniformly distributed store key.
pub trait StoreKey:
    fmt::Debug + Copy + Clone + PartialEq + Eq + Hash + Send + Sync + 'static
{
    /// Encoded key width in bytes.
    const ENCODED_LEN: usize;
    /// Fixed TOC record width: key + timestamp:8 + offset:4 + length:4.
    const TOC_ENTRY_SIZE: usize;
    /// 28-byte magic at the head of value files.
    const VALUE_FILE_MAGIC: &'static [u8; 28];
    /// 28-byte magic at the head of TOC files.
    const TOC_FILE_MAGIC: &'static [u8; 28];
    /// TOC file extension, e.g. `1234.valuetoc`.
    const TOC_EXT: &'static str;
    /// Wire message type ids, one per subsystem and variant.
    const PULL_REPLICATION_MSG_TYPE: u64;
    const BULK_SET_MSG_TYPE: u64;
    const BULK_SET_ACK_MSG_TYPE: u64;

    fn key_a(&self) -> u64;
    fn key_b(&self) -> u64;

    /// Encode into `buf[..ENCODED_LEN]`.
    fn write_to(&self, buf: &mut [u8]);
    /// Decode from `buf[..ENCODED_LEN]`.
    fn read_from(buf: &[u8]) -> Self;
}

/// 128-bit key of the value store variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ValueKey {
    pub key_a: u64,
    pub key_b: u64,
}

impl ValueKey {
    pub fn new(key_a: u64, key_b: u64) -> Self {
        Self { key_a, key_b }
    }
}

impl StoreKey for ValueKey {
    const ENCODED_LEN: usize = 16;
    const TOC_ENTRY_SIZE: usize = 32;
    const VALUE_FILE_MAGIC: &'static [u8; 28] = b"VALUESTORE v0               ";
    const TOC_FILE_MAGIC: &'static [u8; 28] = b"VALUESTORETOC v0            ";
    const TOC_EXT: &'static str = "valuetoc";
    const PULL_REPLICATION_MSG_TYPE: u64 = 0x579c_4bd2_61f1_8b92;
    const BULK_SET_MSG_TYPE: u64 = 0x44f5_8445_991a_4aa1;
    const BULK_SET_ACK_MSG_TYPE: u64 = 0x39c6_4d16_c99f_a149;

    #[inline]
    fn key_a(&self) -> u64 {
        self.key_a
    }

    #[inline]
    fn key_b(&self) -> u64 {
        self.key_b
    }

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.key_a);
        BigEndian::write_u64(&mut buf[8..16], self.key_b);
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        Self {
            key_a: BigEndian::read_u64(&buf[0..8]),
            key_b: BigEndian::read_u64(&buf[8..16]),
        }
    }
}

/// 256-bit key of the group store variant: a (key_a, key_b) parent plus a
/// (name_key_a, name_key_b) child name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub key_a: u64,
    pub key_b: u64,
    pub name_key_a: u64,
    pub name_key_b: u64,
}

impl GroupKey {
    pub fn new(key_a: u64, key_b: u64, name_key_a: u64, name_key_b: u64) -> Self {
        Self {
            key_a,
            key_b,
            name_key_a,
            name_key_b,
        }
    }
}

impl StoreKey for GroupKey {
    const ENCODED_LEN: usize = 32;
    const TOC_ENTRY_SIZE: usize = 48;
    const VALUE_FILE_MAGIC: &'static [u8; 28] = b"GROUPSTORE v0               ";
    const TOC_FILE_MAGIC: &'static [u8; 28] = b"GROUPSTORETOC v0            ";
    const TOC_EXT: &'static str = "grouptoc";
    const PULL_REPLICATION_MSG_TYPE: u64 = 0x34bf_8795_3e59_e8d1;
    const BULK_SET_MSG_TYPE: u64 = 0x5a02_9c81_39e7_3d27;
    const BULK_SET_ACK_MSG_TYPE: u64 = 0x7d4e_66a1_8cf2_b355;

    #[inline]
    fn key_a(&self) -> u64 {
        self.key_a
    }

    #[inline]
    fn key_b(&self) -> u64 {
        self.key_b
    }

    #[inline]
    fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.key_a);
        BigEndian::write_u64(&mut buf[8..16], self.key_b);
        BigEndian::write_u64(&mut buf[16..24], self.name_key_a);
        BigEndian::write_u64(&mut buf[24..32], self.name_key_b);
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        Self {
            key_a: BigEndian::read_u64(&buf[0..8]),
            key_b: BigEndian::read_u64(&buf[8..16]),
            name_key_a: BigEndian::read_u64(&buf[16..24]),
            name_key_b: BigEndian::read_u64(&buf[24..32]),
        }
    }
}

/// Keys that subdivide into a parent pair and a child name pair; implemented
/// only by the group variant and the gate for the group-enumeration API.
pub trait GroupedKey: StoreKey {
    fn from_parts(key_a: u64, key_b: u64, name_key_a: u64, name_key_b: u64) -> Self;
    fn parent(&self) -> (u64, u64);
    fn name(&self) -> (u64, u64);
}

impl GroupedKey for GroupKey {
    #[inline]
    fn from_parts(key_a: u64, key_b: u64, name_key_a: u64, name_key_b: u64) -> Self {
        Self::new(key_a, key_b, name_key_a, name_key_b)
    }

    #[inline]
    fn parent(&self) -> (u64, u64) {
        (self.key_a, self.key_b)
    }

    #[inline]
    fn name(&self) -> (u64, u64) {
        (self.name_key_a, self.name_key_b)
    }
}
