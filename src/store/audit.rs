//! Audit: scheduled verification of on-disk checksums.
//!
//! A pass walks the TOC directory in shuffled order, skipping the active
//! pair and anything younger than the age threshold. Each candidate's data
//! file is swept for corrupt checksum intervals; if any live TOC entry's
//! byte range intersects a corrupt interval the file has failed. A failed
//! file is salvaged as far as possible (compaction rewrites the entries the
//! map still trusts), unlinked, and the store requests a restart through the
//! restart channel so replication can repair the remainder from peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;

use crate::background::{launcher_loop, BgAction, BgNotification};
use crate::checksum::{checksum_verify, in_corrupt_range};
use crate::error::Error;
use crate::keys::StoreKey;
use crate::storefile::{
    data_file_name, parse_toc_name, read_file_header, stream_toc, toc_file_name,
};
use crate::tsb::TSB_DELETION;

use super::compaction::{compact_file, remove_file_pair};
use super::Store;

impl<K: StoreKey> Store<K> {
    /// Resumes scheduled audit passes.
    pub fn enable_audit(self: &Arc<Self>) {
        let store = self.clone();
        self.audit_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(u64::from(store.cfg.audit_interval));
                launcher_loop("audit", interval, &store.rng, rx, |notify_rx| {
                    run_audit_pass(&store, notify_rx)
                });
            });
        });
    }

    /// Stops audit passes until re-enabled.
    pub fn disable_audit(&self) {
        self.audit_bg.disable();
    }

    /// Runs one complete audit pass now at full speed, restarting any pass
    /// in flight.
    pub fn audit_pass(self: &Arc<Self>) {
        let store = self.clone();
        self.audit_bg.trigger(move |rx| {
            run_audit_pass(&store, &rx);
        });
    }
}

fn run_audit_pass<K: StoreKey>(
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
            tracing::error!(error = %e, "audit: listing toc directory");
            return None;
        }
    };
    names.shuffle(&mut *store.rng.lock());
    let age_cutoff = now_nanos() - i64::from(store.cfg.audit_age_threshold) * 1_000_000_000;

    for name_timestamp in names {
        if let Ok(notification) = notify_rx.try_recv() {
            return Some(notification);
        }
        if name_timestamp == store.active_toc_a.load(Ordering::Acquire)
            || name_timestamp == store.active_toc_b.load(Ordering::Acquire)
        {
            tracing::debug!(file = name_timestamp, "audit: skipping current");
            continue;
        }
        if name_timestamp >= age_cutoff {
            tracing::debug!(file = name_timestamp, "audit: skipping young");
            continue;
        }
        tracing::debug!(file = name_timestamp, "audit: checking");
        let mut preempted = None;
        let failed = audit_file(store, name_timestamp, notify_rx, &mut preempted);
        if preempted.is_some() {
            tracing::debug!(file = name_timestamp, "audit: canceled");
            return preempted;
        }
        if !failed {
            tracing::debug!(file = name_timestamp, "audit: passed");
            continue;
        }
        tracing::error!(file = name_timestamp, "audit: failed");
        // Salvage what the map still trusts, then quarantine the pair.
        let block_id = store.block_id_from_name_timestamp(name_timestamp);
        if block_id != 0 {
            match compact_file(store, name_timestamp, block_id, &AtomicBool::new(false)) {
                Ok(Some(result)) => tracing::debug!(
                    file = name_timestamp,
                    total = result.count,
                    rewrote = result.rewrote,
                    stale = result.stale,
                    "audit: compacted"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(file = name_timestamp, error = %e, "audit"),
            }
            remove_file_pair(store, name_timestamp, block_id);
        }
        {
            let store = store.clone();
            std::thread::spawn(move || {
                tracing::error!("audit: all audit actions require store restarts at this time");
                store.disable_all();
                store.flush();
                let _ = store
                    .restart_tx
                    .send(Error::Fatal("audit failure occurred requiring a restart".to_string()));
            });
        }
        let (done_tx, _done_rx) = bounded(1);
        tracing::debug!(elapsed = ?begin.elapsed(), "audit pass (failed)");
        return Some(BgNotification {
            action: BgAction::Disable,
            done: done_tx,
        });
    }
    tracing::debug!(elapsed = ?begin.elapsed(), "audit pass");
    None
}

/// Verifies one file pair. Returns whether the file failed; a preemption
/// notification, if one arrived mid-scan, is handed back through
/// `preempted` and leaves the verdict unset.
fn audit_file<K: StoreKey>(
    store: &Store<K>,
    name_timestamp: i64,
    notify_rx: &Receiver<BgNotification>,
    preempted: &mut Option<BgNotification>,
) -> bool {
    let data_path = data_file_name::<K>(&store.cfg.path, name_timestamp);
    let interval = match read_file_header(&data_path, K::DATA_MAGIC) {
        Ok(interval) => interval,
        Err(e) => {
            tracing::error!(file = %data_path.display(), error = %e, "audit: error opening");
            return true;
        }
    };
    let corruptions = match std::fs::File::open(&data_path)
        .map_err(Error::from)
        .and_then(|mut f| checksum_verify(&mut f, interval))
    {
        Ok(corruptions) => corruptions,
        Err(e) => {
            tracing::error!(file = %data_path.display(), error = %e, "audit: error verifying");
            return true;
        }
    };
    let toc_path = toc_file_name::<K>(&store.cfg.path_toc, name_timestamp);
    let mut failed = false;
    let mut scanned = 0u64;
    let stream = stream_toc::<K>(&toc_path, |_key, timestamp_bits, offset, length| {
        scanned += 1;
        if scanned % 1024 == 0 {
            if let Ok(notification) = notify_rx.try_recv() {
                *preempted = Some(notification);
                return false;
            }
        }
        if timestamp_bits & TSB_DELETION != 0 || length == 0 {
            return true;
        }
        if in_corrupt_range(offset, length, &corruptions) {
            failed = true;
            return false;
        }
        true
    });
    match stream {
        Ok(clean) => {
            if !clean {
                failed = true;
            }
        }
        Err(e) => {
            tracing::error!(file = %toc_path.display(), error = %e, "audit: error reading toc");
            failed = true;
        }
    }
    failed
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
