//! Key-plus-timestamp bloom filter summarizing a key range for one
//! replication pass. The 16-bit iteration salt seeds the hashes, so
//! consecutive passes make independent false-positive decisions and missed
//! items converge over a few passes.

use byteorder::{BigEndian, ByteOrder};

use crate::constants::BLOOM_FILTER_HEADER_SIZE;
use crate::core::key::StoreKey;
use crate::error::{EmberError, Result};
use crate::utils::hash::murmur3_x64_128;

pub(crate) struct KtBloomFilter {
    n: u64,
    p: f64,
    salt: u16,
    k: u8,
    m: u64,
    bits: Vec<u8>,
}

fn geometry(n: u64, p: f64) -> (u64, u8) {
    let n = n.max(1);
    let p = p.clamp(1e-10, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let m = ((-(n as f64) * p.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
    let k = ((m as f64 / n as f64) * ln2).round().clamp(1.0, 255.0) as u8;
    (m, k)
}

impl KtBloomFilter {
    pub fn new(n: u64, p: f64, salt: u16) -> Self {
        let (m, k) = geometry(n, p);
        Self {
            n: n.max(1),
            p: p.clamp(1e-10, 0.5),
            salt,
            k,
            m,
            bits: vec![0u8; m.div_ceil(8) as usize],
        }
    }

    /// Clear the bitfield and adopt the salt for the next pass.
    pub fn reset(&mut self, salt: u16) {
        self.salt = salt;
        self.bits.fill(0);
    }

    #[inline]
    fn lanes<K: StoreKey>(&self, key: &K, timestamp_bits: u64) -> (u64, u64) {
        let mut tuple = [0u8; 40];
        key.write_to(&mut tuple[..K::ENCODED_LEN]);
        BigEndian::write_u64(&mut tuple[K::ENCODED_LEN..K::ENCODED_LEN + 8], timestamp_bits);
        murmur3_x64_128(&tuple[..K::ENCODED_LEN + 8], self.salt as u32)
    }

    pub fn add<K: StoreKey>(&mut self, key: &K, timestamp_bits: u64) {
        let (h1, h2) = self.lanes(key, timestamp_bits);
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn may_have<K: StoreKey>(&self, key: &K, timestamp_bits: u64) -> bool {
        let (h1, h2) = self.lanes(key, timestamp_bits);
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serialization header: n:8, p:8 (f64 bits), salt:2, k:1.
    pub fn write_header(&self, out: &mut [u8]) {
        BigEndian::write_u64(&mut out[0..8], self.n);
        BigEndian::write_u64(&mut out[8..16], self.p.to_bits());
        BigEndian::write_u16(&mut out[16..18], self.salt);
        out[18] = self.k;
    }

    pub fn bitfield(&self) -> &[u8] {
        &self.bits
    }

    /// Rebuild a filter from a received header and bitfield. The geometry
    /// is recomputed from (n, p); a bitfield of any other size is corrupt.
    pub fn from_parts(header: &[u8], body: &[u8]) -> Result<Self> {
        if header.len() < BLOOM_FILTER_HEADER_SIZE {
            return Err(EmberError::Corrupt("short bloom filter header".to_string()));
        }
        let n = BigEndian::read_u64(&header[0..8]);
        let p = f64::from_bits(BigEndian::read_u64(&header[8..16]));
        if !p.is_finite() || p <= 0.0 || p >= 1.0 {
            return Err(EmberError::Corrupt(format!(
                "bloom filter false-positive rate {p} out of range"
            )));
        }
        let salt = BigEndian::read_u16(&header[16..18]);
        let k = header[18];
        let (m, _) = geometry(n, p);
        if body.len() as u64 != m.div_ceil(8) {
            return Err(EmberError::Corrupt(format!(
                "bloom filter bitfield of {} bytes does not fit n={n} p={p}",
                body.len()
            )));
        }
        Ok(Self {
            n: n.max(1),
            p,
            salt,
            k: k.max(1),
            m,
            bits: body.to_vec(),
        })
    }
}
