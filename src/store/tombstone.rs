//! Tombstone discard.
//!
//! Deletion markers are kept for `tombstone_age` seconds so replication can
//! propagate the delete; after that they are dead weight in the location
//! map. A pass removes expired tombstones (and expired local-removal
//! markers) in batches, pausing between batches to stay preemptible.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::background::{launcher_loop, BgNotification};
use crate::keys::StoreKey;
use crate::tsb::{seconds_to_bits, timestamp_bits_now, TSB_DELETION, TSB_LOCAL_REMOVAL};

use super::Store;

impl<K: StoreKey> Store<K> {
    /// Resumes scheduled tombstone discard passes.
    pub fn enable_tombstone_discard(self: &Arc<Self>) {
        let store = self.clone();
        self.tombstone_discard_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(u64::from(store.cfg.tombstone_discard_interval));
                launcher_loop("tombstone discard", interval, &store.rng, rx, |notify_rx| {
                    run_tombstone_discard_pass(&store, notify_rx)
                });
            });
        });
    }

    /// Stops tombstone discard passes until re-enabled.
    pub fn disable_tombstone_discard(&self) {
        self.tombstone_discard_bg.disable();
    }

    /// Runs one complete tombstone discard pass now.
    pub fn tombstone_discard_pass(self: &Arc<Self>) {
        let store = self.clone();
        self.tombstone_discard_bg.trigger(move |rx| {
            run_tombstone_discard_pass(&store, &rx);
        });
    }
}

fn run_tombstone_discard_pass<K: StoreKey>(
    store: &Arc<Store<K>>,
    notify_rx: &Receiver<BgNotification>,
) -> Option<BgNotification> {
    let cutoff =
        timestamp_bits_now().saturating_sub(seconds_to_bits(u64::from(store.cfg.tombstone_age)));
    for mask in [TSB_DELETION, TSB_LOCAL_REMOVAL] {
        loop {
            if let Ok(notification) = notify_rx.try_recv() {
                return Some(notification);
            }
            let batch_size = store.cfg.tombstone_discard_batch_size as u64;
            let mut batch: Vec<(K, u64)> = Vec::new();
            let complete = store.locmap.scan_callback(
                0,
                u64::MAX,
                mask,
                0,
                cutoff,
                batch_size,
                |key, loc| {
                    batch.push((*key, loc.timestamp_bits));
                    true
                },
            );
            for (key, timestamp_bits) in &batch {
                // Removal only lands if the entry is unchanged; a newer
                // write since the scan wins as usual.
                store.locmap.set(*key, *timestamp_bits, 0, 0, 0, true);
            }
            store
                .counters
                .expired_tombstones
                .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
            if complete {
                break;
            }
        }
    }
    None
}
