//! Pull replication.
//!
//! For every partition this node holds, a pass builds a bloom filter over
//! the keys it already has (outside the recent-write window) and sends it to
//! the partition's other replicas. A replica receiving the request scans its
//! own live entries in the advertised range and responds with bulk-set
//! messages carrying whatever the filter did not contain.
//!
//! Request body layout, all big-endian:
//!
//! ```text
//! node id:8  ring version:8  partition:4  cutoff:8
//! range begin:8  range end:8  key filter (see src/bloom.rs)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Receiver;

use crate::background::{launcher_loop, run_preemptible, BgNotification};
use crate::bloom::KeyFilter;
use crate::config::StoreConfig;
use crate::keys::{StoreKey, MAX_KEY_LEN};
use crate::msgs::{InMsgPool, Intake, OutMsgPool};
use crate::ring::MsgRing;
use crate::tsb::{seconds_to_bits, timestamp_bits_now, TSB_DELETION, TSB_LOCAL_REMOVAL};

use super::Store;

const PULL_HEADER_LEN: usize = 44;

pub(crate) struct PullReplicationState {
    pub in_pool: Arc<InMsgPool>,
    pub out_pool: OutMsgPool,
}

impl PullReplicationState {
    pub fn new(cfg: &StoreConfig, msg_ring: Option<&dyn MsgRing>) -> Option<Self> {
        msg_ring?;
        // Bodies grow to the filter size on first use and stay pooled.
        Some(Self {
            in_pool: Arc::new(InMsgPool::new(cfg.in_pull_replication_msgs, PULL_HEADER_LEN)),
            out_pool: OutMsgPool::new(cfg.out_pull_replication_msgs, 0),
        })
    }
}

impl<K: StoreKey> Store<K> {
    /// Resumes scheduled outgoing pull replication passes.
    pub fn enable_out_pull_replication(self: &Arc<Self>) {
        let store = self.clone();
        self.out_pull_replication_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(u64::from(store.cfg.out_pull_replication_interval));
                launcher_loop("out pull replication", interval, &store.rng, rx, |notify_rx| {
                    run_out_pull_pass(&store, notify_rx)
                });
            });
        });
    }

    /// Stops outgoing pull replication passes until re-enabled.
    pub fn disable_out_pull_replication(&self) {
        self.out_pull_replication_bg.disable();
    }

    /// Runs one complete outgoing pull replication pass now, restarting any
    /// pass in flight. The requests are stateless; responses arrive long
    /// after this returns.
    pub fn out_pull_replication_pass(self: &Arc<Self>) {
        let store = self.clone();
        self.out_pull_replication_bg.trigger(move |rx| {
            run_out_pull_pass(&store, &rx);
        });
    }
}

fn run_out_pull_pass<K: StoreKey>(
    store: &Arc<Store<K>>,
    notify_rx: &Receiver<BgNotification>,
) -> Option<BgNotification> {
    let msg_ring = store.msg_ring.as_ref()?;
    let ring = msg_ring.ring()?;
    let state = store.pull_replication.as_ref()?;
    let begin = Instant::now();
    let ring_version = ring.version();
    let partition_shift = 64 - u32::from(ring.partition_bit_count());
    let partition_max = (1u64 << ring.partition_bit_count()) - 1;
    let workers = store.cfg.out_pull_replication_workers.max(1);
    let now = timestamp_bits_now();
    let cutoff = now.saturating_sub(seconds_to_bits(u64::from(store.cfg.replication_ignore_recent)));
    let timeout = Duration::from_millis(store.cfg.out_pull_replication_msg_timeout);
    let node_id = ring.local_node_id();

    let result = run_preemptible(notify_rx, workers, |worker, abort: &AtomicBool| {
        let mut partition = worker as u64;
        while partition <= partition_max {
            if abort.load(Ordering::Acquire) {
                return;
            }
            match msg_ring.ring() {
                Some(r) if r.version() == ring_version => {}
                _ => return,
            }
            if !ring.responsible(partition as u32) {
                partition += workers as u64;
                continue;
            }
            let range_begin = partition << partition_shift;
            let range_end = if partition == partition_max {
                u64::MAX
            } else {
                ((partition + 1) << partition_shift) - 1
            };
            let mut filter = KeyFilter::new(
                store.cfg.out_pull_replication_bloom_n,
                store.cfg.out_pull_replication_bloom_p,
            );
            let mut key_buf = [0u8; MAX_KEY_LEN];
            store.locmap.scan_callback(
                range_begin,
                range_end,
                0,
                TSB_LOCAL_REMOVAL,
                cutoff,
                u64::MAX,
                |key, _loc| {
                    key.write_to(&mut key_buf[..K::ENCODED_LEN]);
                    filter.add(&key_buf[..K::ENCODED_LEN]);
                    true
                },
            );
            let mut msg = state.out_pool.acquire(K::PULL_REPLICATION_MSG_TYPE);
            msg.body.reserve(PULL_HEADER_LEN + filter.encoded_len());
            msg.body.resize(PULL_HEADER_LEN, 0);
            BigEndian::write_u64(&mut msg.body[0..8], node_id);
            BigEndian::write_i64(&mut msg.body[8..16], ring_version);
            BigEndian::write_u32(&mut msg.body[16..20], partition as u32);
            BigEndian::write_u64(&mut msg.body[20..28], cutoff);
            BigEndian::write_u64(&mut msg.body[28..36], range_begin);
            BigEndian::write_u64(&mut msg.body[36..44], range_end);
            filter.encode_into(&mut msg.body);
            store
                .counters
                .out_pull_replications
                .fetch_add(1, Ordering::Relaxed);
            msg_ring.msg_to_other_replicas(Box::new(msg), partition as u32, timeout);
            partition += workers as u64;
        }
    });
    tracing::debug!(elapsed = ?begin.elapsed(), "out pull replication pass");
    result
}

pub(crate) fn launch<K: StoreKey>(store: &Arc<Store<K>>) {
    let state = match &store.pull_replication {
        Some(state) => state,
        None => return,
    };
    for _ in 0..store.cfg.in_pull_replication_workers {
        let store = store.clone();
        let rx = state.in_pool.msg_rx.clone();
        std::thread::spawn(move || in_pull_replication_worker(store, rx));
    }
    let msg_ring = store.msg_ring.clone().expect("state exists only with a ring");
    let handler_store = store.clone();
    msg_ring.set_msg_handler(
        K::PULL_REPLICATION_MSG_TYPE,
        Box::new(move |r: &mut dyn std::io::Read, len: u64| {
            let state = handler_store
                .pull_replication
                .as_ref()
                .expect("registered with state");
            match state.in_pool.intake(r, len) {
                Ok(Intake::Queued) => {
                    handler_store
                        .counters
                        .in_pull_replications
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Ok(Intake::Dropped) => {
                    handler_store
                        .counters
                        .in_pull_replication_drops
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Err(e) => {
                    handler_store
                        .counters
                        .in_pull_replication_invalids
                        .fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        }),
    );
}

fn in_pull_replication_worker<K: StoreKey>(store: Arc<Store<K>>, rx: Receiver<Vec<u8>>) {
    for body in rx.iter() {
        process_in_pull_replication(&store, &body);
        if let Some(state) = &store.pull_replication {
            state.in_pool.release(body);
        }
    }
}

/// Answers one pull request: everything live in the advertised range that
/// the requester's filter does not contain goes back as bulk-set entries.
pub(crate) fn process_in_pull_replication<K: StoreKey>(store: &Store<K>, body: &[u8]) {
    let msg_ring = match &store.msg_ring {
        Some(msg_ring) => msg_ring,
        None => return,
    };
    let ring = match msg_ring.ring() {
        Some(ring) => ring,
        None => return,
    };
    if body.len() < PULL_HEADER_LEN {
        store
            .counters
            .in_pull_replication_invalids
            .fetch_add(1, Ordering::Relaxed);
        return;
    }
    let node_id = BigEndian::read_u64(&body[0..8]);
    let ring_version = BigEndian::read_i64(&body[8..16]);
    let cutoff = BigEndian::read_u64(&body[20..28]);
    let range_begin = BigEndian::read_u64(&body[28..36]);
    let range_end = BigEndian::read_u64(&body[36..44]);
    let filter = match KeyFilter::decode(&body[PULL_HEADER_LEN..]) {
        Ok(filter) => filter,
        Err(_) => {
            store
                .counters
                .in_pull_replication_invalids
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    if ring.version() != ring_version || node_id == 0 {
        return;
    }
    let tombstone_cutoff = timestamp_bits_now()
        .saturating_sub(seconds_to_bits(u64::from(store.cfg.tombstone_age)));

    // Gather the missing keys first; shard locks are held only while
    // scanning, not while reading values.
    let header_len = K::BULK_SET_ENTRY_HEADER_LEN as i64;
    let mut available = store
        .bulk_set
        .as_ref()
        .map_or(i64::MAX, |s| s.msg_cap as i64);
    let mut missing: Vec<K> = Vec::new();
    let mut key_buf = [0u8; MAX_KEY_LEN];
    store.locmap.scan_callback(
        range_begin,
        range_end,
        0,
        TSB_LOCAL_REMOVAL,
        cutoff,
        u64::MAX,
        |key, loc| {
            key.write_to(&mut key_buf[..K::ENCODED_LEN]);
            if filter.may_contain(&key_buf[..K::ENCODED_LEN]) {
                return true;
            }
            missing.push(*key);
            available -= header_len + i64::from(loc.length);
            available > header_len
        },
    );
    if missing.is_empty() {
        return;
    }
    let mut bsm = match store.new_out_bulk_set_msg(ring.local_node_id()) {
        Some(bsm) => bsm,
        None => return,
    };
    let mut value = Vec::new();
    for key in missing {
        value.clear();
        let timestamp_bits = match store.read_inner(key, &mut value) {
            Ok(tsb) => tsb,
            // A tombstone is still worth replicating while inside the
            // tombstone window; a fully absent key is not.
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
        if !bsm.add(&key, timestamp_bits, &value) {
            break;
        }
        store
            .counters
            .out_bulk_set_values
            .fetch_add(1, Ordering::Relaxed);
    }
    if !bsm.is_empty() {
        store.counters.out_bulk_sets.fetch_add(1, Ordering::Relaxed);
        msg_ring.msg_to_node(
            node_id,
            bsm.into_msg(),
            Duration::from_millis(store.cfg.in_pull_replication_response_msg_timeout),
        );
    }
}
