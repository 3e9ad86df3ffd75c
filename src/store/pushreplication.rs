//! Push replication.
//!
//! The inverse of pull: a pass walks the partitions this node holds data
//! for but is no longer responsible for (ring reassignment) and pushes that
//! data to the partitions' current replicas as bulk-set messages. Receivers
//! acknowledge; the bulk-set-ack path then converts our copies into
//! local-removal tombstones, relinquishing ownership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::background::{launcher_loop, run_preemptible, BgNotification};
use crate::keys::StoreKey;
use crate::tsb::{seconds_to_bits, timestamp_bits_now, TSB_DELETION, TSB_LOCAL_REMOVAL};

use super::Store;

impl<K: StoreKey> Store<K> {
    /// Resumes scheduled outgoing push replication passes.
    pub fn enable_out_push_replication(self: &Arc<Self>) {
        let store = self.clone();
        self.out_push_replication_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(u64::from(store.cfg.out_push_replication_interval));
                launcher_loop("out push replication", interval, &store.rng, rx, |notify_rx| {
                    run_out_push_pass(&store, notify_rx)
                });
            });
        });
    }

    /// Stops outgoing push replication passes until re-enabled.
    pub fn disable_out_push_replication(&self) {
        self.out_push_replication_bg.disable();
    }

    /// Runs one complete outgoing push replication pass now, restarting any
    /// pass in flight. The requests are stateless; the acknowledgements
    /// arrive long after this returns.
    pub fn out_push_replication_pass(self: &Arc<Self>) {
        let store = self.clone();
        self.out_push_replication_bg.trigger(move |rx| {
            run_out_push_pass(&store, &rx);
        });
    }
}

fn run_out_push_pass<K: StoreKey>(
    store: &Arc<Store<K>>,
    notify_rx: &Receiver<BgNotification>,
) -> Option<BgNotification> {
    let msg_ring = store.msg_ring.as_ref()?;
    let ring = msg_ring.ring()?;
    let begin = Instant::now();
    let ring_version = ring.version();
    let partition_shift = 64 - u32::from(ring.partition_bit_count());
    let partition_max = (1u64 << ring.partition_bit_count()) - 1;
    let workers = store.cfg.out_push_replication_workers.max(1);
    let now = timestamp_bits_now();
    let cutoff = now.saturating_sub(seconds_to_bits(u64::from(store.cfg.replication_ignore_recent)));
    let tombstone_cutoff =
        now.saturating_sub(seconds_to_bits(u64::from(store.cfg.tombstone_age)));
    let timeout = Duration::from_millis(store.cfg.out_push_replication_msg_timeout);
    let node_id = ring.local_node_id();
    let msg_cap = store.bulk_set.as_ref().map_or(i64::MAX, |s| s.msg_cap as i64);
    let header_len = K::BULK_SET_ENTRY_HEADER_LEN as i64;

    let result = run_preemptible(notify_rx, workers, |worker, abort: &AtomicBool| {
        let mut value = Vec::new();
        let mut list: Vec<K> = Vec::new();
        let mut partition = worker as u64;
        while partition <= partition_max {
            if abort.load(Ordering::Acquire) {
                return;
            }
            match msg_ring.ring() {
                Some(r) if r.version() == ring_version => {}
                _ => return,
            }
            if ring.responsible(partition as u32) {
                partition += workers as u64;
                continue;
            }
            let range_begin = partition << partition_shift;
            let range_end = if partition == partition_max {
                u64::MAX
            } else {
                ((partition + 1) << partition_shift) - 1
            };
            // Gather the first batch of matching keys; once a remote end
            // acks them they become local removals and the next pass sees
            // whatever remains.
            list.clear();
            let mut available = msg_cap;
            store.locmap.scan_callback(
                range_begin,
                range_end,
                0,
                TSB_LOCAL_REMOVAL,
                cutoff,
                u64::MAX,
                |key, loc| {
                    let tsb = loc.timestamp_bits;
                    if tsb & TSB_DELETION != 0 && tsb < tombstone_cutoff {
                        return true;
                    }
                    list.push(*key);
                    available -= header_len + i64::from(loc.length);
                    available > header_len
                },
            );
            if list.is_empty() || abort.load(Ordering::Acquire) {
                partition += workers as u64;
                continue;
            }
            let mut bsm = match store.new_out_bulk_set_msg(node_id) {
                Some(bsm) => bsm,
                None => return,
            };
            for key in &list {
                value.clear();
                let timestamp_bits = match store.read_inner(*key, &mut value) {
                    Ok(tsb) => tsb,
                    // A deletion might still need to travel; a key with no
                    // record at all does not.
                    Err(e) => {
                        let tsb = e.timestamp_bits();
                        if tsb == 0 {
                            continue;
                        }
                        tsb
                    }
                };
                if timestamp_bits & TSB_LOCAL_REMOVAL != 0 || timestamp_bits >= cutoff {
                    continue;
                }
                if timestamp_bits & TSB_DELETION != 0 && timestamp_bits < tombstone_cutoff {
                    continue;
                }
                if !bsm.add(key, timestamp_bits, &value) {
                    break;
                }
                store
                    .counters
                    .out_bulk_set_push_values
                    .fetch_add(1, Ordering::Relaxed);
            }
            store
                .counters
                .out_bulk_set_pushes
                .fetch_add(1, Ordering::Relaxed);
            msg_ring.msg_to_other_replicas(bsm.into_msg(), partition as u32, timeout);
            partition += workers as u64;
        }
    });
    tracing::debug!(elapsed = ?begin.elapsed(), "out push replication pass");
    result
}
