//! Reusable in-memory write buffers.
//!
//! A `MemBlock` carries recently written values (packed raw, no per-entry
//! framing; only the location map knows the offsets) plus the parallel TOC
//! entries for those values. Blocks cycle: free pool -> active (filling) ->
//! enqueued to the active store file -> flushed -> cleared -> free pool.
//! Once a block has been enqueued no further appends occur; readers keep
//! serving it from memory until the clearer repoints the location map at the
//! on-disk copy.

use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::keys::StoreKey;

pub struct MemBlock {
    id: AtomicU32,
    /// Store-file id this block was flushed into; 0 while in memory.
    file_id: AtomicU32,
    /// Logical offset of this block's first byte inside that file.
    file_offset: AtomicU32,
    inner: RwLock<MemBlockData>,
}

pub struct MemBlockData {
    pub values: Vec<u8>,
    pub toc: Vec<u8>,
}

impl MemBlock {
    pub fn new(page_size: usize, toc_capacity: usize) -> Self {
        Self {
            id: AtomicU32::new(0),
            file_id: AtomicU32::new(0),
            file_offset: AtomicU32::new(0),
            inner: RwLock::new(MemBlockData {
                values: Vec::with_capacity(page_size),
                toc: Vec::with_capacity(toc_capacity),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn file_id(&self) -> u32 {
        self.file_id.load(Ordering::Acquire)
    }

    pub fn set_file_id(&self, id: u32) {
        self.file_id.store(id, Ordering::Release);
    }

    pub fn file_offset(&self) -> u32 {
        self.file_offset.load(Ordering::Acquire)
    }

    pub fn set_file_offset(&self, offset: u32) {
        self.file_offset.store(offset, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a value, returning its offset within the block. Only the
    /// foreground path appends, under the active-block lock.
    pub fn append(&self, value: &[u8]) -> u32 {
        let mut inner = self.inner.write();
        let offset = inner.values.len() as u32;
        inner.values.extend_from_slice(value);
        offset
    }

    /// Appends the TOC entry mirroring an append: key, timestamp bits,
    /// in-block offset, length.
    pub fn append_toc<K: StoreKey>(&self, key: &K, timestamp_bits: u64, offset: u32, length: u32) {
        let mut inner = self.inner.write();
        let at = inner.toc.len();
        inner.toc.resize(at + K::TOC_ENTRY_LEN, 0);
        let entry = &mut inner.toc[at..];
        key.write_to(entry);
        BigEndian::write_u64(&mut entry[K::ENCODED_LEN..], timestamp_bits);
        BigEndian::write_u32(&mut entry[K::ENCODED_LEN + 8..], offset);
        BigEndian::write_u32(&mut entry[K::ENCODED_LEN + 12..], length);
    }

    /// Copies `[offset, offset + length)` into `out`. Returns `false` when
    /// the range is gone because the block was cleared for reuse; the caller
    /// re-resolves through the location map.
    pub fn read(&self, offset: u32, length: u32, out: &mut Vec<u8>) -> bool {
        let inner = self.inner.read();
        let start = offset as usize;
        let end = start + length as usize;
        if end > inner.values.len() {
            return false;
        }
        out.extend_from_slice(&inner.values[start..end]);
        true
    }

    /// Runs `f` over the block's contents; used by the file writer while the
    /// block is sealed.
    pub fn with_data<R>(&self, f: impl FnOnce(&MemBlockData) -> R) -> R {
        f(&self.inner.read())
    }

    /// Empties the block for reuse. Called by the clearer after the bytes are
    /// durable and the location map has been repointed.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.values.clear();
        inner.toc.clear();
        drop(inner);
        self.file_id.store(0, Ordering::Release);
        self.file_offset.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueKey;

    #[test]
    fn test_append_and_read() {
        let block = MemBlock::new(128, 128);
        assert_eq!(block.append(b"hello"), 0);
        assert_eq!(block.append(b"world"), 5);
        let mut out = Vec::new();
        assert!(block.read(5, 5, &mut out));
        assert_eq!(out, b"world");
        // Appending to an existing buffer, not replacing it.
        assert!(block.read(0, 5, &mut out));
        assert_eq!(out, b"worldhello");
    }

    #[test]
    fn test_read_out_of_range_reports_stale() {
        let block = MemBlock::new(128, 128);
        block.append(b"abc");
        let mut out = Vec::new();
        assert!(!block.read(1, 10, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_toc_entry_layout() {
        let block = MemBlock::new(128, 128);
        block.append_toc(&ValueKey::new(1, 2), 0x500, 32, 7);
        block.with_data(|data| {
            assert_eq!(data.toc.len(), ValueKey::TOC_ENTRY_LEN);
            assert_eq!(&data.toc[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
            assert_eq!(&data.toc[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
            assert_eq!(&data.toc[16..24], &[0, 0, 0, 0, 0, 0, 5, 0]);
            assert_eq!(&data.toc[24..28], &[0, 0, 0, 32]);
            assert_eq!(&data.toc[28..32], &[0, 0, 0, 7]);
        });
    }

    #[test]
    fn test_reset_clears_everything() {
        let block = MemBlock::new(128, 128);
        block.append(b"data");
        block.set_file_id(9);
        block.set_file_offset(1000);
        block.reset();
        assert!(block.is_empty());
        assert_eq!(block.file_id(), 0);
        assert_eq!(block.file_offset(), 0);
        let mut out = Vec::new();
        assert!(!block.read(0, 4, &mut out));
    }
}
