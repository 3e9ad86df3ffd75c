//! The storage engine.
//!
//! Foreground flow for a write: check the location map, copy the payload
//! into the active mem-block, mirror a TOC entry, then compare-and-set the
//! map. Sealed mem-blocks travel to the file-writer actor, which appends
//! them to the active data file and their (offset-adjusted) TOC entries to
//! the sibling TOC file. Once the serializer has put a block's bytes on
//! disk, a clearer repoints the map at the file and recycles the block.
//!
//! Everything else — recovery, compaction, audit, replication, the flusher
//! and the disk watcher — lives in the submodules and coordinates with this
//! file through the location map, the block slab, and the background
//! mailboxes.

pub(crate) mod audit;
pub(crate) mod bulkset;
pub(crate) mod bulksetack;
pub(crate) mod compaction;
pub(crate) mod diskwatcher;
pub(crate) mod flusher;
pub(crate) mod pullreplication;
pub(crate) mod pushreplication;
pub(crate) mod recovery;
pub(crate) mod stats;
pub(crate) mod tombstone;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::background::BgState;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::keys::StoreKey;
use crate::locmap::LocMap;
use crate::memblock::MemBlock;
use crate::ring::MsgRing;
use crate::storefile::{StoreFile, TocWriter, FILE_HEADER_SIZE};
use crate::tsb::{TSB_COMPACTION_REWRITE, TSB_DELETION, TSB_LOCAL_REMOVAL};

pub use stats::Stats;

/// A location-map block: either an in-memory mem-block or an on-disk store
/// file. Both serve reads for the byte ranges the map points into them.
#[derive(Clone)]
pub(crate) enum Block<K: StoreKey> {
    Mem(Arc<MemBlock>),
    File(Arc<StoreFile<K>>),
}

impl<K: StoreKey> Block<K> {
    pub(crate) fn name_timestamp(&self) -> i64 {
        match self {
            Block::Mem(_) => 0,
            Block::File(f) => f.name_timestamp(),
        }
    }
}

enum FileWriterMsg {
    Block(Arc<MemBlock>),
    Flush(Sender<()>),
}

#[derive(Default)]
pub(crate) struct Counters {
    pub lookups: AtomicU64,
    pub lookup_errors: AtomicU64,
    pub reads: AtomicU64,
    pub read_errors: AtomicU64,
    pub writes: AtomicU64,
    pub write_errors: AtomicU64,
    pub writes_overridden: AtomicU64,
    pub deletes: AtomicU64,
    pub delete_errors: AtomicU64,
    pub deletes_overridden: AtomicU64,
    pub in_bulk_sets: AtomicU64,
    pub in_bulk_set_drops: AtomicU64,
    pub in_bulk_set_invalids: AtomicU64,
    pub in_bulk_set_writes: AtomicU64,
    pub in_bulk_set_write_errors: AtomicU64,
    pub in_bulk_set_writes_overridden: AtomicU64,
    pub out_bulk_sets: AtomicU64,
    pub out_bulk_set_values: AtomicU64,
    pub out_bulk_set_pushes: AtomicU64,
    pub out_bulk_set_push_values: AtomicU64,
    pub in_bulk_set_acks: AtomicU64,
    pub in_bulk_set_ack_drops: AtomicU64,
    pub in_bulk_set_ack_invalids: AtomicU64,
    pub in_bulk_set_ack_writes: AtomicU64,
    pub in_bulk_set_ack_write_errors: AtomicU64,
    pub in_bulk_set_ack_writes_overridden: AtomicU64,
    pub out_bulk_set_acks: AtomicU64,
    pub in_pull_replications: AtomicU64,
    pub in_pull_replication_drops: AtomicU64,
    pub in_pull_replication_invalids: AtomicU64,
    pub out_pull_replications: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_rewrites: AtomicU64,
    pub compaction_stale: AtomicU64,
    pub expired_tombstones: AtomicU64,
}

pub struct Store<K: StoreKey> {
    pub(crate) cfg: StoreConfig,
    pub(crate) locmap: LocMap<K>,
    blocks: RwLock<Vec<Option<Block<K>>>>,
    active_mem: Mutex<Option<Arc<MemBlock>>>,
    free_mem_rx: Receiver<Arc<MemBlock>>,
    free_mem_tx: Sender<Arc<MemBlock>>,
    pub(crate) freeable_tx: Sender<Arc<MemBlock>>,
    file_writer_tx: Sender<FileWriterMsg>,
    file_writer_rx: Mutex<Option<Receiver<FileWriterMsg>>>,

    pub(crate) msg_ring: Option<Arc<dyn MsgRing>>,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) restart_tx: Sender<Error>,

    writes_enabled: AtomicBool,
    user_disabled: Mutex<bool>,
    pub(crate) modifications: AtomicI32,
    pub(crate) active_toc_a: AtomicI64,
    pub(crate) active_toc_b: AtomicI64,

    pub(crate) counters: Counters,

    pub(crate) tombstone_discard_bg: BgState,
    pub(crate) compaction_bg: BgState,
    pub(crate) audit_bg: BgState,
    pub(crate) out_pull_replication_bg: BgState,
    pub(crate) out_push_replication_bg: BgState,
    pub(crate) flusher_bg: BgState,

    /// Files flagged for compaction regardless of their stale fraction
    /// (truncated TOC tails found during recovery).
    pub(crate) compaction_forced: Mutex<std::collections::HashSet<i64>>,

    pub(crate) bulk_set: Option<bulkset::BulkSetState>,
    pub(crate) bulk_set_ack: Option<bulksetack::BulkSetAckState>,
    pub(crate) pull_replication: Option<pullreplication::PullReplicationState>,
}

impl<K: StoreKey> Store<K> {
    /// Opens (or creates) a store rooted at the configured paths, replays
    /// the TOC files into the location map, and starts the foreground
    /// machinery. Background passes stay off until [`Store::enable_all`] (or
    /// the individual enables) is called.
    ///
    /// The second return is the restart channel: a fatal audit failure sends
    /// the error here and the embedding process is expected to exit non-zero.
    pub fn open(
        config: &StoreConfig,
        msg_ring: Option<Arc<dyn MsgRing>>,
    ) -> Result<(Arc<Self>, Receiver<Error>)> {
        let cfg = config.resolve::<K>();
        std::fs::create_dir_all(&cfg.path)?;
        std::fs::create_dir_all(&cfg.path_toc)?;

        let total_blocks = cfg.workers * cfg.write_pages_per_worker;
        let (free_mem_tx, free_mem_rx) = bounded(total_blocks);
        let (freeable_tx, freeable_rx) = bounded(total_blocks);
        let (file_writer_tx, file_writer_rx) = bounded(cfg.workers);
        let (restart_tx, restart_rx) = bounded(2);
        let rng = match cfg.rand_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let max_entries_per_block = (cfg.page_size / cfg.min_value_alloc) as usize + 1;
        let toc_capacity = max_entries_per_block * K::TOC_ENTRY_LEN;

        let store = Self {
            bulk_set: bulkset::BulkSetState::new(&cfg, msg_ring.as_deref()),
            bulk_set_ack: bulksetack::BulkSetAckState::new(&cfg, msg_ring.as_deref()),
            pull_replication: pullreplication::PullReplicationState::new(&cfg, msg_ring.as_deref()),
            cfg,
            locmap: LocMap::new(),
            blocks: RwLock::new(vec![None]),
            active_mem: Mutex::new(None),
            free_mem_rx,
            free_mem_tx,
            freeable_tx,
            file_writer_tx,
            file_writer_rx: Mutex::new(Some(file_writer_rx)),
            msg_ring,
            rng: Mutex::new(rng),
            restart_tx,
            writes_enabled: AtomicBool::new(false),
            user_disabled: Mutex::new(false),
            modifications: AtomicI32::new(0),
            active_toc_a: AtomicI64::new(0),
            active_toc_b: AtomicI64::new(0),
            counters: Counters::default(),
            compaction_forced: Mutex::new(std::collections::HashSet::new()),
            tombstone_discard_bg: BgState::new(),
            compaction_bg: BgState::new(),
            audit_bg: BgState::new(),
            out_pull_replication_bg: BgState::new(),
            out_push_replication_bg: BgState::new(),
            flusher_bg: BgState::new(),
        };

        for _ in 0..total_blocks {
            let block = Arc::new(MemBlock::new(
                store.cfg.page_size as usize,
                toc_capacity,
            ));
            let id = store.add_block(Block::Mem(block.clone()));
            block.set_id(id);
            store
                .free_mem_tx
                .send(block)
                .expect("free pool sized for exactly this many blocks");
        }

        let store = Arc::new(store);
        recovery::recover(&store)?;

        let rx = store
            .file_writer_rx
            .lock()
            .take()
            .expect("file writer starts once");
        {
            let store = store.clone();
            std::thread::spawn(move || file_writer(store, rx));
        }
        for _ in 0..store.cfg.workers {
            let store = store.clone();
            let rx = freeable_rx.clone();
            std::thread::spawn(move || mem_clearer(store, rx));
        }

        bulkset::launch(&store);
        bulksetack::launch(&store);
        pullreplication::launch(&store);
        diskwatcher::launch(&store);

        store.writes_enabled.store(true, Ordering::Release);
        Ok((store, restart_rx))
    }

    // --- block slab ---

    pub(crate) fn add_block(&self, block: Block<K>) -> u32 {
        let mut blocks = self.blocks.write();
        blocks.push(Some(block));
        (blocks.len() - 1) as u32
    }

    pub(crate) fn block(&self, id: u32) -> Option<Block<K>> {
        self.blocks.read().get(id as usize).and_then(|b| b.clone())
    }

    /// Drops a block from the slab, closing its file descriptors. Used after
    /// compaction or audit has rewritten everything live in it.
    pub(crate) fn close_block(&self, id: u32) -> Result<()> {
        let block = self.blocks.write().get_mut(id as usize).and_then(Option::take);
        match block {
            Some(Block::File(file)) => file.close(),
            Some(Block::Mem(_)) => Err(Error::InvalidData(format!(
                "block {id} is an in-memory block"
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn block_id_from_name_timestamp(&self, name_timestamp: i64) -> u32 {
        let blocks = self.blocks.read();
        for (id, block) in blocks.iter().enumerate() {
            if let Some(b) = block {
                if b.name_timestamp() == name_timestamp {
                    return id as u32;
                }
            }
        }
        0
    }

    // --- foreground API ---

    /// Timestamp bits and value length for a key. `NotFound` carries the
    /// tombstone's timestamp bits when the key was deleted rather than never
    /// written.
    pub fn lookup(&self, key: K) -> Result<(u64, u32)> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        match self.locmap.get(&key) {
            None => {
                self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
                Err(Error::NotFound(0))
            }
            Some(loc) => {
                let tsb = loc.timestamp_bits;
                if tsb & (TSB_DELETION | TSB_LOCAL_REMOVAL) != 0 {
                    self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::NotFound(tsb));
                }
                Ok((tsb, loc.length))
            }
        }
    }

    /// Appends the key's value bytes to `value` and returns the record's
    /// timestamp bits.
    pub fn read(&self, key: K, value: &mut Vec<u8>) -> Result<u64> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let result = self.read_inner(key, value);
        if result.is_err() {
            self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub(crate) fn read_inner(&self, key: K, value: &mut Vec<u8>) -> Result<u64> {
        let mut last_err = None;
        for attempt in 0..4 {
            if attempt == 1 {
                // Re-resolving races the serializer and the clearers; give
                // them a beat.
                std::thread::yield_now();
            } else if attempt > 1 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            let loc = match self.locmap.get(&key) {
                None => return Err(Error::NotFound(0)),
                Some(loc) => loc,
            };
            let tsb = loc.timestamp_bits;
            if tsb & (TSB_DELETION | TSB_LOCAL_REMOVAL) != 0 {
                return Err(Error::NotFound(tsb));
            }
            let start = value.len();
            match self.block(loc.block_id) {
                None => {
                    // The block went away between the lookup and here;
                    // compaction moved the entry. Re-resolve.
                    last_err = Some(Error::IO(format!("block {} is closed", loc.block_id)));
                }
                Some(Block::Mem(mem)) => {
                    if mem.read(loc.offset, loc.length, value) {
                        // The pool recycles blocks; only a location that
                        // still matches proves the copied bytes were this
                        // key's.
                        if self.locmap.get(&key) == Some(loc) {
                            return Ok(tsb);
                        }
                        value.truncate(start);
                        last_err = Some(Error::IO("mem block moved mid-read".to_string()));
                    } else {
                        last_err = Some(Error::IO("mem block recycled".to_string()));
                    }
                }
                Some(Block::File(file)) => {
                    match file.read(key.key_a(), tsb, loc.offset, loc.length, value) {
                        Ok(()) => return Ok(tsb),
                        Err(e @ Error::NotFound(_)) => return Err(e),
                        Err(e @ Error::Corrupt(_)) => return Err(e),
                        Err(e) => last_err = Some(e),
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NotFound(0)))
    }

    /// Stores `value` under `key` at `timestamp_bits`, returning the
    /// previously stored timestamp bits (0 if none). A record with equal or
    /// newer timestamp bits makes this a no-op that reports the winner.
    pub fn write(&self, key: K, timestamp_bits: u64, value: &[u8]) -> Result<u64> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        match self.write_internal(key, timestamp_bits, value, false) {
            Ok(old) => {
                if old >= timestamp_bits {
                    self.counters.writes_overridden.fetch_add(1, Ordering::Relaxed);
                }
                Ok(old)
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Records a tombstone at `timestamp_bits`.
    pub fn delete(&self, key: K, timestamp_bits: u64) -> Result<u64> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        match self.write_internal(key, timestamp_bits | TSB_DELETION, &[], false) {
            Ok(old) => {
                if old >= timestamp_bits | TSB_DELETION {
                    self.counters.deletes_overridden.fetch_add(1, Ordering::Relaxed);
                }
                Ok(old)
            }
            Err(e) => {
                self.counters.delete_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// The write path shared by the public API, replication and compaction.
    /// `internal` writes bypass the disabled check and the modification
    /// counter. `TSB_COMPACTION_REWRITE` in `timestamp_bits` widens the CAS
    /// to accept an equal timestamp, and is stripped before storage.
    pub(crate) fn write_internal(
        &self,
        key: K,
        timestamp_bits: u64,
        value: &[u8],
        internal: bool,
    ) -> Result<u64> {
        if value.len() > self.cfg.value_cap as usize {
            return Err(Error::TooLarge);
        }
        if !internal && !self.writes_enabled.load(Ordering::Acquire) {
            return Err(Error::Disabled);
        }
        let rewrite = timestamp_bits & TSB_COMPACTION_REWRITE != 0;
        let timestamp_bits = timestamp_bits & !TSB_COMPACTION_REWRITE;
        if let Some(existing) = self.locmap.get(&key) {
            if existing.timestamp_bits > timestamp_bits
                || (existing.timestamp_bits == timestamp_bits && !rewrite)
            {
                return Ok(existing.timestamp_bits);
            }
        }
        let (block_id, offset) = {
            let mut guard = self.active_mem.lock();
            let mut block = match guard.take() {
                Some(block) => block,
                None => self
                    .free_mem_rx
                    .recv()
                    .map_err(|_| Error::Fatal("mem block pool is gone".to_string()))?,
            };
            if block.len() + value.len() > self.cfg.page_size as usize {
                let _ = self.file_writer_tx.send(FileWriterMsg::Block(block));
                block = self
                    .free_mem_rx
                    .recv()
                    .map_err(|_| Error::Fatal("mem block pool is gone".to_string()))?;
            }
            let offset = block.append(value);
            block.append_toc(&key, timestamp_bits, offset, value.len() as u32);
            let id = block.id();
            *guard = Some(block);
            (id, offset)
        };
        let old = self
            .locmap
            .set(key, timestamp_bits, block_id, offset, value.len() as u32, rewrite);
        // A losing CAS leaves the copied bytes unindexed; they age out as
        // stale space when the block's file is compacted.
        if !internal {
            self.modifications.fetch_add(1, Ordering::Relaxed);
        }
        Ok(old)
    }

    /// Blocks until every write accepted so far is durable. The active
    /// mem-block is sealed and the active file pair, if it holds any data,
    /// is closed with its trailers; the next write starts a new pair.
    pub fn flush(&self) {
        {
            let mut guard = self.active_mem.lock();
            if let Some(block) = guard.take() {
                if block.is_empty() {
                    *guard = Some(block);
                } else {
                    let _ = self.file_writer_tx.send(FileWriterMsg::Block(block));
                }
            }
        }
        let (done_tx, done_rx) = bounded(1);
        if self.file_writer_tx.send(FileWriterMsg::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    // --- write gating ---

    pub(crate) fn writes_currently_enabled(&self) -> bool {
        self.writes_enabled.load(Ordering::Acquire)
    }

    /// Re-enables writes. `user` calls clear a sticky user disable;
    /// automatic calls (the disk watcher) never override one.
    pub(crate) fn set_writes_enabled(&self, user: bool) {
        let mut user_disabled = self.user_disabled.lock();
        if user {
            *user_disabled = false;
        }
        if !*user_disabled {
            self.writes_enabled.store(true, Ordering::Release);
        }
    }

    pub(crate) fn set_writes_disabled(&self, user: bool) {
        let mut user_disabled = self.user_disabled.lock();
        if user {
            *user_disabled = true;
        }
        self.writes_enabled.store(false, Ordering::Release);
    }

    pub fn enable_writes(&self) {
        self.set_writes_enabled(true);
    }

    pub fn disable_writes(&self) {
        self.set_writes_disabled(true);
    }

    // --- background toggles ---

    pub fn enable_all(self: &Arc<Self>) {
        self.enable_writes();
        self.enable_tombstone_discard();
        self.enable_compaction();
        self.enable_audit();
        self.enable_out_pull_replication();
        self.enable_out_push_replication();
        self.enable_flusher();
    }

    pub fn disable_all(&self) {
        self.disable_tombstone_discard();
        self.disable_compaction();
        self.disable_audit();
        self.disable_out_pull_replication();
        self.disable_out_push_replication();
        self.disable_flusher();
        self.disable_writes();
    }

    /// Counter snapshot plus location-map totals.
    pub fn stats(&self) -> Stats {
        stats::gather(self)
    }
}

/// The file-writer actor: owns the active data+TOC pair, rotating it when
/// the data file would exceed the cap and on flush.
fn file_writer<K: StoreKey>(store: Arc<Store<K>>, rx: Receiver<FileWriterMsg>) {
    struct ActivePair<K: StoreKey> {
        data: Arc<StoreFile<K>>,
        toc: TocWriter<K>,
    }

    let mut active: Option<ActivePair<K>> = None;
    let mut toc_scratch: Vec<u8> = Vec::new();

    let create_pair = |store: &Arc<Store<K>>| -> Result<ActivePair<K>> {
        let data = Arc::new(StoreFile::<K>::create(
            &store.cfg.path,
            store.cfg.checksum_interval,
            store.cfg.workers,
            store.cfg.file_readers,
            store.freeable_tx.clone(),
        )?);
        let id = store.add_block(Block::File(data.clone()));
        data.set_id(id);
        let toc = TocWriter::<K>::create(
            &store.cfg.path_toc,
            data.name_timestamp(),
            store.cfg.checksum_interval,
            store.cfg.workers,
        )?;
        Ok(ActivePair { data, toc })
    };

    let close_pair = |pair: ActivePair<K>| {
        if let Err(e) = pair.data.close_writing() {
            tracing::error!(file = %pair.data.path().display(), error = %e, "closing data file");
        }
        let toc_path = pair.toc.path().to_path_buf();
        if let Err(e) = pair.toc.close() {
            tracing::error!(file = %toc_path.display(), error = %e, "closing toc file");
        }
    };

    for msg in rx.iter() {
        match msg {
            FileWriterMsg::Block(block) => {
                if active.is_none() {
                    match create_pair(&store) {
                        Ok(pair) => {
                            store
                                .active_toc_a
                                .store(pair.data.name_timestamp(), Ordering::Release);
                            active = Some(pair);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "creating store file pair");
                            let _ = store.freeable_tx.send(block);
                            continue;
                        }
                    }
                }
                let needs_rotation = {
                    let pair = active.as_ref().expect("just ensured");
                    u64::from(pair.data.writer_offset()) + block.len() as u64
                        > u64::from(store.cfg.file_cap)
                };
                if needs_rotation {
                    match create_pair(&store) {
                        Ok(new_pair) => {
                            // The new pair becomes active before the old one
                            // closes so writes never see a gap.
                            let old = active.replace(new_pair);
                            let pair = active.as_ref().expect("just replaced");
                            store
                                .active_toc_a
                                .store(pair.data.name_timestamp(), Ordering::Release);
                            if let Some(old) = old {
                                store
                                    .active_toc_b
                                    .store(old.data.name_timestamp(), Ordering::Release);
                                close_pair(old);
                                store.active_toc_b.store(0, Ordering::Release);
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "rotating store file pair");
                        }
                    }
                }
                let pair = active.as_ref().expect("just ensured");
                // Snapshot the TOC bytes before the data append: the block
                // can be released (and recycled) as soon as its bytes are
                // through the pipeline.
                let file_offset = pair.data.writer_offset();
                toc_scratch.clear();
                block.with_data(|data| toc_scratch.extend_from_slice(&data.toc));
                let offset_at = K::ENCODED_LEN + 8;
                for entry in toc_scratch.chunks_mut(K::TOC_ENTRY_LEN) {
                    let within = BigEndian::read_u32(&entry[offset_at..]);
                    BigEndian::write_u32(&mut entry[offset_at..], within + file_offset);
                }
                pair.data.write_block(block);
                let pair = active.as_mut().expect("still active");
                pair.toc.push_entries(&toc_scratch);
            }
            FileWriterMsg::Flush(done) => {
                let has_data = active
                    .as_ref()
                    .map(|pair| pair.data.writer_offset() > FILE_HEADER_SIZE)
                    .unwrap_or(false);
                if has_data {
                    if let Some(old) = active.take() {
                        store
                            .active_toc_b
                            .store(old.data.name_timestamp(), Ordering::Release);
                        store.active_toc_a.store(0, Ordering::Release);
                        close_pair(old);
                        store.active_toc_b.store(0, Ordering::Release);
                    }
                }
                let _ = done.send(());
            }
        }
    }
    if let Some(pair) = active.take() {
        close_pair(pair);
    }
}

/// Clearers recycle flushed mem-blocks: repoint every TOC entry at the
/// block's on-disk home, then reset the block into the free pool.
fn mem_clearer<K: StoreKey>(store: Arc<Store<K>>, rx: Receiver<Arc<MemBlock>>) {
    for block in rx.iter() {
        let file_id = block.file_id();
        let file_offset = block.file_offset();
        if file_id != 0 {
            block.with_data(|data| {
                for entry in data.toc.chunks_exact(K::TOC_ENTRY_LEN) {
                    let key = K::read_from(entry);
                    let timestamp_bits = BigEndian::read_u64(&entry[K::ENCODED_LEN..]);
                    let offset = BigEndian::read_u32(&entry[K::ENCODED_LEN + 8..]);
                    let length = BigEndian::read_u32(&entry[K::ENCODED_LEN + 12..]);
                    store.locmap.set(
                        key,
                        timestamp_bits,
                        file_id,
                        file_offset + offset,
                        length,
                        true,
                    );
                }
            });
        }
        block.reset();
        if store.free_mem_tx.send(block).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
