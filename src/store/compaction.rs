//! Compaction: file-level garbage collection.
//!
//! A pass looks for files whose stale fraction crosses the configured
//! threshold (or that recovery flagged after a truncated TOC), rewrites
//! whatever the location map still points at into the active file with the
//! equal-timestamp rewrite bit, and unlinks the pair. The active pair and
//! files younger than the age threshold are never touched. Multiple workers
//! each own a distinct file; rewrites are idempotent under the rewrite rule,
//! so externally nothing observable changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rand::seq::SliceRandom;

use crate::background::{launcher_loop, run_preemptible, BgNotification};
use crate::error::Result;
use crate::keys::StoreKey;
use crate::storefile::{data_file_name, parse_toc_name, stream_toc, toc_file_name};
use crate::tsb::TSB_COMPACTION_REWRITE;

use super::{Block, Store};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CompactionResult {
    pub count: u64,
    pub rewrote: u64,
    pub stale: u64,
}

impl<K: StoreKey> Store<K> {
    /// Resumes scheduled compaction passes.
    pub fn enable_compaction(self: &Arc<Self>) {
        let store = self.clone();
        self.compaction_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(u64::from(store.cfg.compaction_interval));
                launcher_loop("compaction", interval, &store.rng, rx, |notify_rx| {
                    run_compaction_pass(&store, notify_rx)
                });
            });
        });
    }

    /// Stops compaction passes until re-enabled.
    pub fn disable_compaction(&self) {
        self.compaction_bg.disable();
    }

    /// Runs one complete compaction pass now, restarting any pass in
    /// flight.
    pub fn compaction_pass(self: &Arc<Self>) {
        let store = self.clone();
        self.compaction_bg.trigger(move |rx| {
            run_compaction_pass(&store, &rx);
        });
    }
}

fn run_compaction_pass<K: StoreKey>(
    store: &Arc<Store<K>>,
    notify_rx: &Receiver<BgNotification>,
) -> Option<BgNotification> {
    let begin = Instant::now();
    let mut names: Vec<i64> = match std::fs::read_dir(&store.cfg.path_toc) {
        Ok(dir) => dir
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(parse_toc_name::<K>))
            .collect(),
        Err(e) => {
            tracing::error!(error = %e, "compaction: listing toc directory");
            return None;
        }
    };
    names.shuffle(&mut *store.rng.lock());

    let age_cutoff = now_nanos() - i64::from(store.cfg.compaction_age_threshold) * 1_000_000_000;
    let workers = store.cfg.compaction_workers.max(1);
    let result = run_preemptible(notify_rx, workers, |worker, abort: &AtomicBool| {
        for (index, &name_timestamp) in names.iter().enumerate() {
            if index % workers != worker {
                continue;
            }
            if abort.load(Ordering::Acquire) {
                return;
            }
            if name_timestamp == store.active_toc_a.load(Ordering::Acquire)
                || name_timestamp == store.active_toc_b.load(Ordering::Acquire)
            {
                continue;
            }
            if name_timestamp >= age_cutoff {
                continue;
            }
            let block_id = store.block_id_from_name_timestamp(name_timestamp);
            if block_id == 0 {
                continue;
            }
            let forced = store.compaction_forced.lock().contains(&name_timestamp);
            if !forced {
                match estimate_stale_fraction(store, name_timestamp, block_id) {
                    Ok(fraction) if fraction < store.cfg.compaction_threshold => continue,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "compaction: estimating staleness");
                        continue;
                    }
                }
            }
            match compact_file(store, name_timestamp, block_id, abort) {
                Ok(None) => return, // aborted mid-file; leave it intact
                Ok(Some(result)) => {
                    remove_file_pair(store, name_timestamp, block_id);
                    store.compaction_forced.lock().remove(&name_timestamp);
                    store.counters.compactions.fetch_add(1, Ordering::Relaxed);
                    store
                        .counters
                        .compaction_rewrites
                        .fetch_add(result.rewrote, Ordering::Relaxed);
                    store
                        .counters
                        .compaction_stale
                        .fetch_add(result.stale, Ordering::Relaxed);
                    tracing::info!(
                        file = name_timestamp,
                        total = result.count,
                        rewrote = result.rewrote,
                        stale = result.stale,
                        "compacted"
                    );
                }
                Err(e) => {
                    tracing::error!(file = name_timestamp, error = %e, "compaction failed");
                }
            }
        }
    });
    tracing::debug!(elapsed = ?begin.elapsed(), "compaction pass");
    result
}

/// One cheap sequential sweep of the TOC, counting how many entries the
/// location map no longer points at.
fn estimate_stale_fraction<K: StoreKey>(
    store: &Store<K>,
    name_timestamp: i64,
    block_id: u32,
) -> Result<f64> {
    let path = toc_file_name::<K>(&store.cfg.path_toc, name_timestamp);
    let mut total = 0u64;
    let mut live = 0u64;
    stream_toc::<K>(&path, |key, timestamp_bits, _offset, _length| {
        total += 1;
        if let Some(loc) = store.locmap.get(&key) {
            if loc.block_id == block_id && loc.timestamp_bits == timestamp_bits {
                live += 1;
            }
        }
        true
    })?;
    if total == 0 {
        // Nothing but padding; the file is pure overhead.
        return Ok(1.0);
    }
    Ok(1.0 - live as f64 / total as f64)
}

/// Rewrites every entry the location map still attributes to `block_id`
/// into the active file, preserving timestamps via the rewrite bit. Returns
/// `None` when aborted partway (the file must be kept).
pub(crate) fn compact_file<K: StoreKey>(
    store: &Store<K>,
    name_timestamp: i64,
    block_id: u32,
    abort: &AtomicBool,
) -> Result<Option<CompactionResult>> {
    let path = toc_file_name::<K>(&store.cfg.path_toc, name_timestamp);
    let block = store.block(block_id);
    let mut result = CompactionResult::default();
    let mut value = Vec::new();
    let mut canceled = false;
    stream_toc::<K>(&path, |key, timestamp_bits, offset, length| {
        if abort.load(Ordering::Acquire) {
            canceled = true;
            return false;
        }
        result.count += 1;
        let live = match store.locmap.get(&key) {
            Some(loc) => loc.block_id == block_id && loc.timestamp_bits == timestamp_bits,
            None => false,
        };
        if !live {
            result.stale += 1;
            return true;
        }
        value.clear();
        if length > 0 {
            let read = match &block {
                Some(Block::File(file)) => {
                    file.read(key.key_a(), timestamp_bits, offset, length, &mut value)
                }
                _ => Err(crate::error::Error::IO(format!(
                    "block {block_id} is not a readable file"
                ))),
            };
            if let Err(e) = read {
                // The entry's bytes are unreadable; leave it to replication
                // to restore from a peer.
                tracing::error!(file = name_timestamp, error = %e, "compaction read failed");
                result.stale += 1;
                return true;
            }
        }
        match store.write_internal(key, timestamp_bits | TSB_COMPACTION_REWRITE, &value, true) {
            Ok(_) => result.rewrote += 1,
            Err(e) => {
                tracing::error!(file = name_timestamp, error = %e, "compaction rewrite failed");
                result.stale += 1;
            }
        }
        true
    })?;
    if canceled {
        return Ok(None);
    }
    Ok(Some(result))
}

pub(crate) fn remove_file_pair<K: StoreKey>(
    store: &Store<K>,
    name_timestamp: i64,
    block_id: u32,
) {
    if let Err(e) = std::fs::remove_file(data_file_name::<K>(&store.cfg.path, name_timestamp)) {
        tracing::error!(file = name_timestamp, error = %e, "unable to remove data file");
    }
    if let Err(e) = std::fs::remove_file(toc_file_name::<K>(&store.cfg.path_toc, name_timestamp)) {
        tracing::error!(file = name_timestamp, error = %e, "unable to remove toc file");
    }
    if let Err(e) = store.close_block(block_id) {
        tracing::error!(block = block_id, error = %e, "error closing in-memory block");
    }
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
