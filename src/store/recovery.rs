//! Startup recovery: rebuild the location map from the TOC files.
//!
//! TOC files are replayed in a shuffled order so that replicas restarted
//! together do not hammer their disks in the same sequence. Each file's
//! entries are read in batches behind a checksum-verifying reader and
//! applied by a pool of workers under the timestamp-wins rule, which makes
//! replay idempotent and order-insensitive. A TOC whose sibling data file is
//! missing is abandoned; a TOC that fails verification mid-file keeps the
//! entries read so far, ignores the truncated tail, and flags the file for
//! compaction.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::bounded;
use rand::seq::SliceRandom;

use crate::checksum::ChecksummedReader;
use crate::error::Result;
use crate::keys::StoreKey;
use crate::storefile::{
    data_file_name, parse_toc_name, read_file_header, toc_file_name, StoreFile, FILE_HEADER_SIZE,
};

use super::{Block, Store};

pub(crate) fn recover<K: StoreKey>(store: &Arc<Store<K>>) -> Result<()> {
    let begin = Instant::now();
    let mut names: Vec<i64> = Vec::new();
    for entry in std::fs::read_dir(&store.cfg.path_toc)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            match parse_toc_name::<K>(name) {
                Some(name_timestamp) => names.push(name_timestamp),
                None => {
                    if name.ends_with(K::TOC_EXT) {
                        tracing::error!(file = name, "bad timestamp in name");
                    }
                }
            }
        }
    }
    names.shuffle(&mut *store.rng.lock());

    let mut file_count = 0u64;
    let mut applied = 0u64;
    for name_timestamp in names {
        let data_path = data_file_name::<K>(&store.cfg.path, name_timestamp);
        if !data_path.exists() {
            tracing::error!(
                file = %toc_file_name::<K>(&store.cfg.path_toc, name_timestamp).display(),
                "toc file has no sibling data file; ignoring"
            );
            continue;
        }
        let data_file = match StoreFile::<K>::open(
            &store.cfg.path,
            name_timestamp,
            store.cfg.file_readers,
        ) {
            Ok(file) => Arc::new(file),
            Err(e) => {
                tracing::error!(file = %data_path.display(), error = %e, "opening data file");
                continue;
            }
        };
        let block_id = store.add_block(Block::File(data_file.clone()));
        data_file.set_id(block_id);
        match replay_toc(store, block_id, name_timestamp) {
            Ok((count, clean)) => {
                applied += count;
                file_count += 1;
                if !clean {
                    store.compaction_forced.lock().insert(name_timestamp);
                }
            }
            Err(e) => {
                tracing::error!(
                    file = %toc_file_name::<K>(&store.cfg.path_toc, name_timestamp).display(),
                    error = %e,
                    "replaying toc file"
                );
            }
        }
    }
    tracing::info!(
        files = file_count,
        entries = applied,
        live = store.locmap.len(),
        elapsed = ?begin.elapsed(),
        "recovery complete"
    );
    Ok(())
}

/// Streams one TOC file into the location map. Returns the number of
/// entries applied and whether the whole file verified cleanly.
fn replay_toc<K: StoreKey>(
    store: &Arc<Store<K>>,
    block_id: u32,
    name_timestamp: i64,
) -> Result<(u64, bool)> {
    let path = toc_file_name::<K>(&store.cfg.path_toc, name_timestamp);
    let interval = read_file_header(&path, K::TOC_MAGIC)?;
    let file = File::open(&path)?;
    let physical_len = file.metadata()?.len();
    // Strip the embedded checksums to get the logical stream length.
    let full_pages = physical_len / (u64::from(interval) + 4);
    let logical_len = physical_len - full_pages * 4;
    let mut reader = ChecksummedReader::new(file, interval);

    let entry_len = K::TOC_ENTRY_LEN;
    let batch_entries = store.cfg.recovery_batch_size.max(1);
    let workers = store.cfg.workers.max(1);
    let applied = AtomicU64::new(0);

    let (batch_tx, batch_rx) = bounded::<Vec<u8>>(workers * 3);
    let (free_tx, free_rx) = bounded::<Vec<u8>>(workers * 3);
    for _ in 0..workers * 3 {
        free_tx
            .send(Vec::with_capacity(batch_entries * entry_len))
            .expect("sized for exactly this many batches");
    }

    let mut clean = true;
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let batch_rx = batch_rx.clone();
            let free_tx = free_tx.clone();
            let applied = &applied;
            scope.spawn(move || {
                for batch in batch_rx.iter() {
                    for entry in batch.chunks_exact(entry_len) {
                        let key = K::read_from(entry);
                        let timestamp_bits = BigEndian::read_u64(&entry[K::ENCODED_LEN..]);
                        let offset = BigEndian::read_u32(&entry[K::ENCODED_LEN + 8..]);
                        let length = BigEndian::read_u32(&entry[K::ENCODED_LEN + 12..]);
                        store
                            .locmap
                            .set(key, timestamp_bits, block_id, offset, length, false);
                        applied.fetch_add(1, Ordering::Relaxed);
                    }
                    let _ = free_tx.send(batch);
                }
            });
        }

        let mut offset = u64::from(FILE_HEADER_SIZE);
        'read: while offset + entry_len as u64 <= logical_len {
            let remaining = ((logical_len - offset) as usize / entry_len).min(batch_entries);
            let mut batch = free_rx.recv().expect("batch pool cycles");
            batch.clear();
            batch.resize(remaining * entry_len, 0);
            if let Err(e) = reader.read_at(offset, &mut batch) {
                // Keep what has been applied; the tail is unusable.
                tracing::error!(file = %path.display(), error = %e, "toc read failed mid-file");
                clean = false;
                let _ = free_tx.send(batch);
                break 'read;
            }
            offset += batch.len() as u64;
            // The closing padding page is all zeros up to the trailer; the
            // first all-zero entry marks the end of real entries.
            if let Some(end) = batch
                .chunks_exact(entry_len)
                .position(|entry| entry.iter().all(|&b| b == 0))
            {
                batch.truncate(end * entry_len);
                if !batch.is_empty() {
                    batch_tx.send(batch).expect("workers outlive the reader");
                } else {
                    let _ = free_tx.send(batch);
                }
                break 'read;
            }
            batch_tx.send(batch).expect("workers outlive the reader");
        }
        drop(batch_tx);
    });
    Ok((applied.load(Ordering::Relaxed), clean))
}
