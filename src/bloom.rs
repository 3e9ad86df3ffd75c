//! Bloom filter carried by pull-replication requests.
//!
//! A filter can say with certainty that a key was **not** seen (no false
//! negatives) but may occasionally claim a key was seen when it wasn't. Pull
//! replication tolerates false positives: a missed key is picked up by a
//! later pass, since the filter is rebuilt from scratch every time.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::sum32;
use crate::error::{Error, Result};

/// Double-hashed bloom filter: bit `i` of a key is
/// `(h1 + i * h2) mod num_bits`, with `h1`/`h2` from murmur3-32 under two
/// seeds.
pub struct KeyFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

const SEED_LO: u32 = 0;
const SEED_HI: u32 = 0x9747_b28c;

// Serialized filters ride inside pull-replication messages; cap what a peer
// can make us allocate.
const MAX_FILTER_BYTES: usize = 128 * 1024 * 1024;

impl KeyFilter {
    /// Sizes the filter for `expected_keys` at the target false-positive
    /// rate: `m = -n ln(p) / ln(2)^2`, `k = (m / n) ln(2)`.
    pub fn new(expected_keys: u64, false_positive_rate: f64) -> Self {
        let n = (expected_keys.max(1)) as f64;
        let p = false_positive_rate.clamp(0.000001, 0.999999);
        let m = ((-n * p.ln()) / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k.max(1),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = bit_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means the key was definitely not added.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let idx = bit_index(h1, h2, i, self.num_bits);
            (self.bits[(idx / 8) as usize] >> (idx % 8)) & 1 == 1
        })
    }

    /// Wire size: `num_hashes(4) + num_bits(8) + bits`.
    pub fn encoded_len(&self) -> usize {
        12 + self.bits.len()
    }

    /// Appends the wire form (big-endian, like every frame in the system).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut head = [0u8; 12];
        BigEndian::write_u32(&mut head[0..4], self.num_hashes);
        BigEndian::write_u64(&mut head[4..12], self.num_bits);
        out.extend_from_slice(&head);
        out.extend_from_slice(&self.bits);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::InvalidData("key filter header truncated".to_string()));
        }
        let num_hashes = BigEndian::read_u32(&buf[0..4]);
        let num_bits = BigEndian::read_u64(&buf[4..12]);
        let byte_len = ((num_bits + 7) / 8) as usize;
        if num_hashes == 0 || num_bits == 0 || byte_len > MAX_FILTER_BYTES {
            return Err(Error::InvalidData(format!(
                "implausible key filter: {num_hashes} hashes over {num_bits} bits"
            )));
        }
        if buf.len() < 12 + byte_len {
            return Err(Error::InvalidData("key filter bits truncated".to_string()));
        }
        Ok(Self {
            bits: buf[12..12 + byte_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    // Two 32-bit murmur sums under distinct seeds, widened; plenty for
    // double hashing over a bit table.
    let h1 = murmur3::murmur3_32(&mut std::io::Cursor::new(key), SEED_LO)
        .expect("in-memory reads are infallible");
    let h2 = murmur3::murmur3_32(&mut std::io::Cursor::new(key), SEED_HI)
        .expect("in-memory reads are infallible");
    // Mix the widened halves so h1 != h2 even on 32-bit collisions.
    (
        (u64::from(h1) << 32) | u64::from(h2),
        (u64::from(h2) << 32) | u64::from(sum32(key)),
    )
}

fn bit_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add(u64::from(i).wrapping_mul(h2 | 1)) % num_bits
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> [u8; 16] {
        let mut buf = [0u8; 16];
        BigEndian::write_u64(&mut buf[0..8], n);
        BigEndian::write_u64(&mut buf[8..16], n ^ 0xdead_beef);
        buf
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = KeyFilter::new(1000, 0.001);
        for n in 0..1000 {
            filter.add(&key(n));
        }
        for n in 0..1000 {
            assert!(filter.may_contain(&key(n)), "lost key {n}");
        }
    }

    #[test]
    fn test_false_positive_rate_is_sane() {
        let mut filter = KeyFilter::new(1000, 0.001);
        for n in 0..1000 {
            filter.add(&key(n));
        }
        let false_positives = (1000..11000).filter(|&n| filter.may_contain(&key(n))).count();
        // 0.1% target over 10k probes; allow an order of magnitude of slack.
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn test_encode_round_trip() {
        let mut filter = KeyFilter::new(100, 0.01);
        for n in 0..100 {
            filter.add(&key(n));
        }
        let mut wire = Vec::new();
        filter.encode_into(&mut wire);
        assert_eq!(wire.len(), filter.encoded_len());
        let decoded = KeyFilter::decode(&wire).unwrap();
        for n in 0..100 {
            assert!(decoded.may_contain(&key(n)));
        }
        assert_eq!(decoded.num_bits, filter.num_bits);
        assert_eq!(decoded.num_hashes, filter.num_hashes);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(KeyFilter::decode(&[0u8; 4]).is_err());
        let mut wire = Vec::new();
        KeyFilter::new(10, 0.01).encode_into(&mut wire);
        wire.truncate(wire.len() - 1);
        assert!(KeyFilter::decode(&wire).is_err());
    }
}
