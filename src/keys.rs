//! Key families.
//!
//! The engine ships in two variants that share one design: a value store
//! keyed by a 128-bit `(key_a, key_b)` pair and a group store keyed by a
//! 256-bit `(key_a, key_b, name_key_a, name_key_b)` quadruple that maps a
//! group to many named members. `StoreKey` carries everything that differs
//! between the two: encoded widths, file magics, trailer layout, message type
//! ids, and the environment prefix for configuration.
//!
//! Keys are opaque to the engine. Partitioning uses the top bits of `key_a`.

use byteorder::{BigEndian, ByteOrder};

/// Upper bound on `StoreKey::ENCODED_LEN`, for stack scratch buffers.
pub const MAX_KEY_LEN: usize = 32;

pub trait StoreKey:
    Copy + Clone + Eq + Ord + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static
{
    /// Big-endian encoded width of the key itself.
    const ENCODED_LEN: usize;

    /// 28-byte magic opening a data file.
    const DATA_MAGIC: &'static [u8; 28];
    /// 28-byte magic opening a table-of-contents file.
    const TOC_MAGIC: &'static [u8; 28];
    /// Data file extension, e.g. `1234.value`.
    const DATA_EXT: &'static str;
    /// TOC file extension, e.g. `1234.valuetoc`.
    const TOC_EXT: &'static str;

    /// Prefix for configuration environment variables.
    const ENV_PREFIX: &'static str;

    const BULK_SET_MSG_TYPE: u64;
    const BULK_SET_ACK_MSG_TYPE: u64;
    const PULL_REPLICATION_MSG_TYPE: u64;

    /// TOC entry: key, timestamp bits (8), offset (4), length (4).
    const TOC_ENTRY_LEN: usize = Self::ENCODED_LEN + 16;
    /// Bulk-set entry header: key, timestamp bits (8), length (4).
    const BULK_SET_ENTRY_HEADER_LEN: usize = Self::ENCODED_LEN + 12;
    /// Bulk-set-ack entry: key, timestamp bits (8).
    const BULK_SET_ACK_ENTRY_LEN: usize = Self::ENCODED_LEN + 8;

    fn key_a(&self) -> u64;

    /// Writes the big-endian encoding into `buf[..ENCODED_LEN]`.
    fn write_to(&self, buf: &mut [u8]);

    /// Reads a key from `buf[..ENCODED_LEN]`.
    fn read_from(buf: &[u8]) -> Self;

    /// The bytes appended (right-aligned inside the closing padding page) when
    /// a file's writer shuts down. `last_offset` is the logical end of the
    /// data, before padding.
    fn trailer(last_offset: u32) -> Vec<u8>;
}

/// 128-bit key of the value variant.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ValueKey {
    pub a: u64,
    pub b: u64,
}

impl ValueKey {
    pub fn new(a: u64, b: u64) -> Self {
        Self { a, b }
    }
}

impl StoreKey for ValueKey {
    const ENCODED_LEN: usize = 16;
    const DATA_MAGIC: &'static [u8; 28] = b"VALUESTORE v0               ";
    const TOC_MAGIC: &'static [u8; 28] = b"VALUESTORETOC v0            ";
    const DATA_EXT: &'static str = "value";
    const TOC_EXT: &'static str = "valuetoc";
    const ENV_PREFIX: &'static str = "VALUESTORE";
    const BULK_SET_MSG_TYPE: u64 = 0x44f5_8ee1_b30d_6a0e;
    const BULK_SET_ACK_MSG_TYPE: u64 = 0x39d5_07f2_f69d_9617;
    const PULL_REPLICATION_MSG_TYPE: u64 = 0x5797_02e0_5f39_661c;

    fn key_a(&self) -> u64 {
        self.a
    }

    fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.a);
        BigEndian::write_u64(&mut buf[8..16], self.b);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            a: BigEndian::read_u64(&buf[0..8]),
            b: BigEndian::read_u64(&buf[8..16]),
        }
    }

    // 0:4, last logical offset:8, "TERM":4
    fn trailer(last_offset: u32) -> Vec<u8> {
        let mut term = vec![0u8; 16];
        BigEndian::write_u64(&mut term[4..12], u64::from(last_offset));
        term[12..].copy_from_slice(b"TERM");
        term
    }
}

/// 256-bit key of the group variant: a group key plus a member name key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct GroupKey {
    pub a: u64,
    pub b: u64,
    pub name_a: u64,
    pub name_b: u64,
}

impl GroupKey {
    pub fn new(a: u64, b: u64, name_a: u64, name_b: u64) -> Self {
        Self { a, b, name_a, name_b }
    }
}

impl StoreKey for GroupKey {
    const ENCODED_LEN: usize = 32;
    const DATA_MAGIC: &'static [u8; 28] = b"GROUPSTORE v0               ";
    const TOC_MAGIC: &'static [u8; 28] = b"GROUPSTORETOC v0            ";
    const DATA_EXT: &'static str = "group";
    const TOC_EXT: &'static str = "grouptoc";
    const ENV_PREFIX: &'static str = "GROUPSTORE";
    const BULK_SET_MSG_TYPE: u64 = 0xbe53_367e_1994_c262;
    const BULK_SET_ACK_MSG_TYPE: u64 = 0xec35_77cc_6dbb_75bb;
    const PULL_REPLICATION_MSG_TYPE: u64 = 0x34bf_8795_3dcc_5d96;

    fn key_a(&self) -> u64 {
        self.a
    }

    fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u64(&mut buf[0..8], self.a);
        BigEndian::write_u64(&mut buf[8..16], self.b);
        BigEndian::write_u64(&mut buf[16..24], self.name_a);
        BigEndian::write_u64(&mut buf[24..32], self.name_b);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            a: BigEndian::read_u64(&buf[0..8]),
            b: BigEndian::read_u64(&buf[8..16]),
            name_a: BigEndian::read_u64(&buf[16..24]),
            name_b: BigEndian::read_u64(&buf[24..32]),
        }
    }

    fn trailer(_last_offset: u32) -> Vec<u8> {
        b"TERM v0 ".to_vec()
    }
}
