//! Store files: one append-only data file plus its table-of-contents file.
//!
//! ## On-disk layout
//!
//! ```text
//! +------------------------------+
//! | magic (28)  | interval (u32) |   32-byte header
//! +------------------------------+
//! | body, a checksum every       |
//! | `checksum_interval` logical  |
//! | bytes (see src/checksum.rs)  |
//! +------------------------------+
//! | zero padding ending in the   |   one full interval of padding,
//! | variant trailer              |   trailer right-aligned
//! +------------------------------+
//! ```
//!
//! While a file is being written it runs a three-stage pipeline sharing a
//! pool of `workers` page buffers:
//!
//! 1. the filler copies bytes into the current buffer and seals it with a
//!    sequence number when it reaches the checksum interval;
//! 2. `workers` checksummers append a murmur3-32 over each sealed buffer;
//! 3. a single serializer writes buffers to disk strictly in sequence order,
//!    releasing any mem-blocks whose bytes a buffer carried.
//!
//! Readers use a fixed pool of descriptors, each behind a checksum-verifying
//! reader; reads keep working after the writer closes, until the file is
//! deleted by compaction or audit.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::checksum::{sum32, ChecksummedReader};
use crate::error::{Error, Result};
use crate::keys::StoreKey;
use crate::memblock::MemBlock;
use crate::tsb::TSB_DELETION;

pub const FILE_HEADER_SIZE: u32 = 32;

pub fn data_file_name<K: StoreKey>(dir: &Path, name_timestamp: i64) -> PathBuf {
    dir.join(format!("{:019}.{}", name_timestamp, K::DATA_EXT))
}

pub fn toc_file_name<K: StoreKey>(dir: &Path, name_timestamp: i64) -> PathBuf {
    dir.join(format!("{:019}.{}", name_timestamp, K::TOC_EXT))
}

/// Extracts the name timestamp from a TOC file name, rejecting anything that
/// is not `<digits>.<toc ext>`.
pub fn parse_toc_name<K: StoreKey>(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(&format!(".{}", K::TOC_EXT))?;
    match stem.parse::<i64>() {
        Ok(ts) if ts > 0 => Some(ts),
        _ => None,
    }
}

fn build_header(magic: &[u8; 28], interval: u32) -> [u8; 32] {
    let mut head = [0u8; 32];
    head[..28].copy_from_slice(magic);
    BigEndian::write_u32(&mut head[28..], interval);
    head
}

/// Reads and validates a 32-byte header, returning the checksum interval
/// recorded in it.
pub fn read_file_header(path: &Path, magic: &[u8; 28]) -> Result<u32> {
    use std::io::Read;
    let mut file = File::open(path)?;
    let mut head = [0u8; 32];
    file.read_exact(&mut head)?;
    if &head[..28] != magic {
        return Err(Error::InvalidData(format!(
            "unknown file type in header of {}",
            path.display()
        )));
    }
    let interval = BigEndian::read_u32(&head[28..]);
    if interval < FILE_HEADER_SIZE {
        return Err(Error::InvalidData(format!(
            "checksum interval {interval} is too small in {}",
            path.display()
        )));
    }
    Ok(interval)
}

/// Streams a TOC file's entries through `f` as
/// `(key, timestamp bits, offset, length)`, stopping at the first all-zero
/// entry (the closing padding), at end of file, or when `f` returns
/// `false`. Returns `false` if verification failed mid-file; entries before
/// the failure were still delivered.
pub(crate) fn stream_toc<K: StoreKey>(
    path: &Path,
    mut f: impl FnMut(K, u64, u32, u32) -> bool,
) -> Result<bool> {
    let interval = read_file_header(path, K::TOC_MAGIC)?;
    let file = File::open(path)?;
    let physical_len = file.metadata()?.len();
    let full_pages = physical_len / (u64::from(interval) + 4);
    let logical_len = physical_len - full_pages * 4;
    let mut reader = ChecksummedReader::new(file, interval);

    let entry_len = K::TOC_ENTRY_LEN;
    let mut batch = vec![0u8; entry_len * 4096];
    let mut offset = u64::from(FILE_HEADER_SIZE);
    while offset + entry_len as u64 <= logical_len {
        let entries = ((logical_len - offset) as usize / entry_len).min(4096);
        let take = entries * entry_len;
        if let Err(e) = reader.read_at(offset, &mut batch[..take]) {
            tracing::error!(file = %path.display(), error = %e, "toc stream failed mid-file");
            return Ok(false);
        }
        offset += take as u64;
        for entry in batch[..take].chunks_exact(entry_len) {
            if entry.iter().all(|&b| b == 0) {
                return Ok(true);
            }
            let key = K::read_from(entry);
            let timestamp_bits = BigEndian::read_u64(&entry[K::ENCODED_LEN..]);
            let entry_offset = BigEndian::read_u32(&entry[K::ENCODED_LEN + 8..]);
            let length = BigEndian::read_u32(&entry[K::ENCODED_LEN + 12..]);
            if !f(key, timestamp_bits, entry_offset, length) {
                return Ok(true);
            }
        }
    }
    Ok(true)
}

struct WriteBuf {
    seq: u64,
    buf: Vec<u8>,
    offset: u32,
    mem_blocks: Vec<Arc<MemBlock>>,
}

/// The filler/checksummer/serializer pipeline for one open file.
struct PagePipeline {
    interval: u32,
    current: Box<WriteBuf>,
    free_rx: Receiver<Box<WriteBuf>>,
    checksum_tx: Option<Sender<Box<WriteBuf>>>,
    to_disk_tx: Sender<Option<Box<WriteBuf>>>,
    checksummers: Vec<JoinHandle<()>>,
    serializer: Option<JoinHandle<File>>,
    offset: Arc<AtomicU32>,
    freeable: Option<Sender<Arc<MemBlock>>>,
    label: String,
}

impl PagePipeline {
    fn new(
        file: File,
        interval: u32,
        workers: usize,
        offset: Arc<AtomicU32>,
        freeable: Option<Sender<Arc<MemBlock>>>,
        label: String,
    ) -> Self {
        let workers = workers.max(1);
        let (free_tx, free_rx) = bounded(workers);
        for _ in 0..workers {
            free_tx
                .send(Box::new(WriteBuf {
                    seq: 0,
                    buf: vec![0u8; interval as usize + 4],
                    offset: 0,
                    mem_blocks: Vec::new(),
                }))
                .expect("sized for exactly this many buffers");
        }
        let (checksum_tx, checksum_rx) = bounded::<Box<WriteBuf>>(workers);
        let (to_disk_tx, to_disk_rx) = bounded::<Option<Box<WriteBuf>>>(workers + 1);
        let mut checksummers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = checksum_rx.clone();
            let tx = to_disk_tx.clone();
            checksummers.push(std::thread::spawn(move || {
                for mut buf in rx.iter() {
                    let sum = sum32(&buf.buf[..interval as usize]);
                    BigEndian::write_u32(&mut buf.buf[interval as usize..], sum);
                    if tx.send(Some(buf)).is_err() {
                        break;
                    }
                }
            }));
        }
        let serializer = {
            let rx = to_disk_rx;
            let requeue = to_disk_tx.clone();
            let free_tx = free_tx.clone();
            let freeable = freeable.clone();
            let label = label.clone();
            std::thread::spawn(move || serializer(file, rx, requeue, free_tx, freeable, label))
        };
        let current = free_rx.recv().expect("pool was just filled");
        Self {
            interval,
            current,
            free_rx,
            checksum_tx: Some(checksum_tx),
            to_disk_tx,
            checksummers,
            serializer: Some(serializer),
            offset,
            freeable,
            label,
        }
    }

    /// Copies `bytes` into page buffers, sealing full pages into the
    /// checksum stage. `retain`, if given, is the mem-block the bytes came
    /// from; it is released once the last page holding any of its bytes hits
    /// disk.
    fn push(&mut self, bytes: &[u8], retain: Option<Arc<MemBlock>>) {
        let interval = self.interval as usize;
        let mut left = bytes.len();
        while left > 0 {
            let at = self.current.offset as usize;
            let n = (interval - at).min(left);
            self.current.buf[at..at + n].copy_from_slice(&bytes[bytes.len() - left..][..n]);
            self.offset.fetch_add(n as u32, Ordering::Release);
            self.current.offset += n as u32;
            if self.current.offset >= self.interval {
                self.seal();
            }
            left -= n;
        }
        if let Some(block) = retain {
            if self.current.offset == 0 {
                self.release(block);
            } else {
                self.current.mem_blocks.push(block);
            }
        }
    }

    fn seal(&mut self) {
        let seq = self.current.seq;
        let sealed = std::mem::replace(
            &mut self.current,
            self.free_rx.recv().expect("serializer recycles buffers"),
        );
        self.current.seq = seq + 1;
        self.checksum_tx
            .as_ref()
            .expect("pipeline is open")
            .send(sealed)
            .expect("checksummers outlive the filler");
    }

    fn release(&self, block: Arc<MemBlock>) {
        if let Some(freeable) = &self.freeable {
            let _ = freeable.send(block);
        }
    }

    /// Drains the pipeline, then streams one interval of zero padding ending
    /// in `trailer` through the page machinery by hand: full pages get their
    /// checksum, a final partial page is written raw. Returns the synced
    /// file.
    fn close(mut self, trailer: &[u8]) -> Result<File> {
        // Closing the checksum channel stops the checksummers once they
        // drain; the serializer stops at the None marker, after every sealed
        // buffer has reached disk.
        drop(self.checksum_tx.take());
        for handle in self.checksummers.drain(..) {
            let _ = handle.join();
        }
        self.to_disk_tx
            .send(None)
            .expect("serializer is still draining");
        let mut file = match self.serializer.take().expect("pipeline is open").join() {
            Ok(file) => file,
            Err(_) => return Err(Error::Fatal(format!("{}: serializer panicked", self.label))),
        };
        let interval = self.interval as usize;
        let mut padding = vec![0u8; interval];
        padding[interval - trailer.len()..].copy_from_slice(trailer);
        let mut left = interval;
        while left > 0 {
            let at = self.current.offset as usize;
            let n = (interval - at).min(left);
            self.current.buf[at..at + n]
                .copy_from_slice(&padding[interval - left..interval - left + n]);
            self.current.offset += n as u32;
            left -= n;
            if self.current.offset as usize >= interval {
                let sum = sum32(&self.current.buf[..interval]);
                BigEndian::write_u32(&mut self.current.buf[interval..], sum);
                file.write_all(&self.current.buf[..interval + 4])?;
                self.current.offset = 0;
            }
        }
        if self.current.offset > 0 {
            file.write_all(&self.current.buf[..self.current.offset as usize])?;
        }
        file.sync_all()?;
        let blocks: Vec<_> = self.current.mem_blocks.drain(..).collect();
        for block in blocks {
            self.release(block);
        }
        Ok(file)
    }
}

/// Writes buffers in strict sequence order, requeueing any that arrive
/// early. Two consecutive `None`s mean the channel is drained.
fn serializer(
    mut file: File,
    rx: Receiver<Option<Box<WriteBuf>>>,
    requeue: Sender<Option<Box<WriteBuf>>>,
    free_tx: Sender<Box<WriteBuf>>,
    freeable: Option<Sender<Arc<MemBlock>>>,
    label: String,
) -> File {
    let mut seq = 0u64;
    let mut last_was_marker = false;
    let mut failed = false;
    for msg in rx.iter() {
        let mut buf = match msg {
            None => {
                if last_was_marker {
                    break;
                }
                last_was_marker = true;
                if requeue.send(None).is_err() {
                    break;
                }
                continue;
            }
            Some(buf) => buf,
        };
        last_was_marker = false;
        if buf.seq != seq {
            if requeue.send(Some(buf)).is_err() {
                break;
            }
            continue;
        }
        if !failed {
            if let Err(e) = file.write_all(&buf.buf) {
                // Keep draining so close() can finish; the store is restarted
                // on the audit/restart path for anything this loses.
                tracing::error!(file = %label, error = %e, "store file write failed");
                failed = true;
            }
        }
        for block in buf.mem_blocks.drain(..) {
            if let Some(freeable) = &freeable {
                let _ = freeable.send(block);
            }
        }
        buf.offset = 0;
        let _ = free_tx.send(buf);
        seq += 1;
    }
    file
}

/// One data file: a fixed pool of verifying readers and, while open for
/// writing, the page pipeline.
pub struct StoreFile<K: StoreKey> {
    id: AtomicU32,
    name_timestamp: i64,
    path: PathBuf,
    writer_offset: Arc<AtomicU32>,
    pipeline: Mutex<Option<PagePipeline>>,
    readers: Vec<Mutex<Option<ChecksummedReader<File>>>>,
    _key: std::marker::PhantomData<K>,
}

impl<K: StoreKey> StoreFile<K> {
    /// Creates a fresh read-write file named for the current wall clock and
    /// starts its writer pipeline.
    pub fn create(
        dir: &Path,
        interval: u32,
        workers: usize,
        file_readers: usize,
        freeable: Sender<Arc<MemBlock>>,
    ) -> Result<Self> {
        let name_timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let path = data_file_name::<K>(dir, name_timestamp);
        let file = File::create(&path)?;
        let writer_offset = Arc::new(AtomicU32::new(0));
        let mut pipeline = PagePipeline::new(
            file,
            interval,
            workers,
            writer_offset.clone(),
            Some(freeable),
            path.display().to_string(),
        );
        pipeline.push(&build_header(K::DATA_MAGIC, interval), None);
        let readers = open_readers(&path, interval, file_readers)?;
        Ok(Self {
            id: AtomicU32::new(0),
            name_timestamp,
            path,
            writer_offset,
            pipeline: Mutex::new(Some(pipeline)),
            readers,
            _key: std::marker::PhantomData,
        })
    }

    /// Opens an existing file read-only, validating its header. Used by
    /// recovery.
    pub fn open(dir: &Path, name_timestamp: i64, file_readers: usize) -> Result<Self> {
        let path = data_file_name::<K>(dir, name_timestamp);
        let interval = read_file_header(&path, K::DATA_MAGIC)?;
        let readers = open_readers(&path, interval, file_readers)?;
        Ok(Self {
            id: AtomicU32::new(0),
            name_timestamp,
            path,
            writer_offset: Arc::new(AtomicU32::new(0)),
            pipeline: Mutex::new(None),
            readers,
            _key: std::marker::PhantomData,
        })
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn name_timestamp(&self) -> i64 {
        self.name_timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The logical tail of the file: bytes at offsets below this have been
    /// handed to the pipeline.
    pub fn writer_offset(&self) -> u32 {
        self.writer_offset.load(Ordering::Acquire)
    }

    /// Appends a sealed mem-block's bytes. Records the block's new home
    /// (file id and logical offset) before any byte moves, so the clearer
    /// can repoint the location map once the bytes are durable.
    pub fn write_block(&self, block: Arc<MemBlock>) {
        let mut guard = self.pipeline.lock();
        let pipeline = match guard.as_mut() {
            Some(p) => p,
            None => return,
        };
        block.set_file_id(self.id());
        block.set_file_offset(self.writer_offset.load(Ordering::Acquire));
        if block.is_empty() {
            pipeline.release(block);
            return;
        }
        block.clone().with_data(|data| {
            pipeline.push(&data.values, Some(block));
        });
    }

    /// Shuts the writer pipeline down and writes the trailer. Readers stay
    /// usable.
    pub fn close_writing(&self) -> Result<()> {
        let pipeline = self.pipeline.lock().take();
        match pipeline {
            Some(pipeline) => {
                let trailer = K::trailer(self.writer_offset.load(Ordering::Acquire));
                pipeline.close(&trailer).map(|_file| ())
            }
            None => Ok(()),
        }
    }

    /// Full close: stops writing and releases every reader descriptor.
    /// Taking each reader lock first lets in-flight reads finish; reads
    /// arriving later fail fast and re-resolve through the location map.
    pub fn close(&self) -> Result<()> {
        let result = self.close_writing();
        for slot in &self.readers {
            slot.lock().take();
        }
        result
    }

    /// Reads `length` bytes at logical `offset`, appending them to `value`.
    /// Tombstones short-circuit to `NotFound` without touching the disk.
    pub fn read(
        &self,
        key_a: u64,
        timestamp_bits: u64,
        offset: u32,
        length: u32,
        value: &mut Vec<u8>,
    ) -> Result<()> {
        if timestamp_bits & TSB_DELETION != 0 {
            return Err(Error::NotFound(timestamp_bits));
        }
        let slot = ((key_a >> 1) as usize) % self.readers.len();
        let mut guard = self.readers[slot].lock();
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::IO(format!("{} is closed", self.path.display())))?;
        let start = value.len();
        value.resize(start + length as usize, 0);
        if let Err(e) = reader.read_at(u64::from(offset), &mut value[start..]) {
            value.truncate(start);
            return Err(e);
        }
        Ok(())
    }
}

fn open_readers(
    path: &Path,
    interval: u32,
    file_readers: usize,
) -> Result<Vec<Mutex<Option<ChecksummedReader<File>>>>> {
    let mut readers = Vec::with_capacity(file_readers.max(1));
    for _ in 0..file_readers.max(1) {
        let file = File::open(path)?;
        readers.push(Mutex::new(Some(ChecksummedReader::new(file, interval))));
    }
    Ok(readers)
}

/// The writer side of a table-of-contents file. TOC files are written
/// through the same page pipeline as data files and read back only by
/// recovery, compaction, and audit.
pub struct TocWriter<K: StoreKey> {
    path: PathBuf,
    writer_offset: Arc<AtomicU32>,
    pipeline: Option<PagePipeline>,
    _key: std::marker::PhantomData<K>,
}

impl<K: StoreKey> TocWriter<K> {
    pub fn create(dir: &Path, name_timestamp: i64, interval: u32, workers: usize) -> Result<Self> {
        let path = toc_file_name::<K>(dir, name_timestamp);
        let file = File::create(&path)?;
        let writer_offset = Arc::new(AtomicU32::new(0));
        let mut pipeline = PagePipeline::new(
            file,
            interval,
            workers,
            writer_offset.clone(),
            None,
            path.display().to_string(),
        );
        pipeline.push(&build_header(K::TOC_MAGIC, interval), None);
        Ok(Self {
            path,
            writer_offset,
            pipeline: Some(pipeline),
            _key: std::marker::PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn push_entries(&mut self, bytes: &[u8]) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.push(bytes, None);
        }
    }

    pub fn close(mut self) -> Result<()> {
        match self.pipeline.take() {
            Some(pipeline) => {
                let trailer = K::trailer(self.writer_offset.load(Ordering::Acquire));
                pipeline.close(&trailer).map(|_file| ())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{GroupKey, ValueKey};
    use crossbeam_channel::unbounded;
    use std::io::Read;

    const INTERVAL: u32 = 1021;

    fn read_all(path: &Path) -> Vec<u8> {
        let mut bytes = Vec::new();
        File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_empty_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<ValueKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        assert_eq!(file.writer_offset(), 32);
        file.close().unwrap();
        let bytes = read_all(file.path());
        assert_eq!(bytes.len(), 32 + INTERVAL as usize + 4);
        assert_eq!(&bytes[..28], ValueKey::DATA_MAGIC);
        assert_eq!(BigEndian::read_u32(&bytes[28..32]), INTERVAL);
        // Value trailer: 0:4, last logical offset:8, "TERM":4.
        let tail = &bytes[bytes.len() - 16..];
        assert_eq!(&tail[0..4], &[0, 0, 0, 0]);
        assert_eq!(BigEndian::read_u64(&tail[4..12]), 32);
        assert_eq!(&tail[12..], b"TERM");
    }

    #[test]
    fn test_empty_group_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<GroupKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        file.close().unwrap();
        let bytes = read_all(file.path());
        assert_eq!(bytes.len(), 32 + INTERVAL as usize + 4);
        assert_eq!(&bytes[..28], GroupKey::DATA_MAGIC);
        assert_eq!(BigEndian::read_u32(&bytes[28..32]), INTERVAL);
        assert_eq!(&bytes[bytes.len() - 8..], b"TERM v0 ");
    }

    #[test]
    fn test_write_blocks_and_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let file = StoreFile::<GroupKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        file.set_id(7);
        let block = Arc::new(MemBlock::new(4096, 128));
        block.append(&vec![0xabu8; 3000]);
        file.write_block(block.clone());
        assert_eq!(block.file_id(), 7);
        assert_eq!(block.file_offset(), 32);
        assert_eq!(file.writer_offset(), 3032);
        file.close().unwrap();
        // Block released once its bytes were serialized.
        let released = rx.try_recv().unwrap();
        assert_eq!(released.file_id(), 7);
        let bytes = read_all(file.path());
        let logical = 32 + 3000 + INTERVAL as usize;
        let expected = logical + logical / INTERVAL as usize * 4;
        assert_eq!(bytes.len(), expected);
        assert_eq!(&bytes[bytes.len() - 8..], b"TERM v0 ");
    }

    #[test]
    fn test_read_back_verified() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<ValueKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        let block = Arc::new(MemBlock::new(4096, 128));
        let offset = 32 + block.append(b"testing");
        file.write_block(block);
        file.close_writing().unwrap();
        let mut out = Vec::new();
        file.read(1, 0x500, offset, 7, &mut out).unwrap();
        assert_eq!(out, b"testing");
        // Appends rather than replaces.
        file.read(1, 0x500, offset, 7, &mut out).unwrap();
        assert_eq!(out, b"testingtesting");
    }

    #[test]
    fn test_deletion_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<ValueKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        file.close_writing().unwrap();
        let mut out = Vec::new();
        match file.read(1, 0x500 | TSB_DELETION, 32, 7, &mut out) {
            Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x500 | TSB_DELETION),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn test_multi_page_write_survives_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<ValueKey>::create(dir.path(), INTERVAL, 4, 2, tx).unwrap();
        let mut expected = Vec::new();
        let mut offsets = Vec::new();
        for i in 0..40u32 {
            let block = Arc::new(MemBlock::new(4096, 128));
            let value = vec![(i % 251) as u8; 997];
            let offset = file.writer_offset() + block.append(&value);
            offsets.push((offset, value.clone()));
            expected.extend_from_slice(&value);
            file.write_block(block);
        }
        file.close_writing().unwrap();
        for (offset, value) in offsets {
            let mut out = Vec::new();
            file.read(1, 0x500, offset, value.len() as u32, &mut out).unwrap();
            assert_eq!(out, value);
        }
    }

    #[test]
    fn test_reopen_validates_header() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let file = StoreFile::<ValueKey>::create(dir.path(), INTERVAL, 2, 2, tx).unwrap();
        let ts = file.name_timestamp();
        file.close().unwrap();
        let reopened = StoreFile::<ValueKey>::open(dir.path(), ts, 2).unwrap();
        assert_eq!(reopened.name_timestamp(), ts);
        // A group store refuses a value file.
        assert!(StoreFile::<GroupKey>::open(dir.path(), ts, 2).is_err());
    }

    #[test]
    fn test_toc_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut toc = TocWriter::<ValueKey>::create(dir.path(), 12345, INTERVAL, 2).unwrap();
        let entries = vec![0x55u8; 3 * ValueKey::TOC_ENTRY_LEN];
        toc.push_entries(&entries);
        let path = toc.path().to_path_buf();
        toc.close().unwrap();
        let bytes = read_all(&path);
        assert_eq!(&bytes[..28], ValueKey::TOC_MAGIC);
        assert_eq!(bytes.len(), 32 + 96 + INTERVAL as usize + 4);
        assert_eq!(parse_toc_name::<ValueKey>("0000000000000012345.valuetoc"), Some(12345));
        assert_eq!(parse_toc_name::<ValueKey>("junk.valuetoc"), None);
        assert_eq!(parse_toc_name::<ValueKey>("0000000000000012345.value"), None);
    }
}
