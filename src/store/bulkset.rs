//! Bulk-set messages: batches of `(key, timestamp bits, value)` pushed
//! between replicas.
//!
//! Body layout: `ack node id (8, 0 = no ack wanted)` then packed entries of
//! `key || timestamp bits (8) || length (4) || value`. Trailing bytes that do
//! not form a whole entry are dropped. Receivers apply every entry with an
//! internal write; a receiver that is not responsible for a key's partition
//! records a local-removal tombstone at the carried timestamp instead of the
//! value, so a later responsible replica can still resurrect it. Applied
//! entries are acknowledged back to the sending node.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Receiver;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::keys::StoreKey;
use crate::msgs::{InMsgPool, Intake, OutMsgPool, PooledMsg};
use crate::ring::MsgRing;
use crate::tsb::TSB_LOCAL_REMOVAL;

use super::Store;

pub(crate) struct BulkSetState {
    pub in_pool: Arc<InMsgPool>,
    pub out_pool: OutMsgPool,
    pub msg_cap: usize,
}

impl BulkSetState {
    pub fn new(cfg: &StoreConfig, msg_ring: Option<&dyn MsgRing>) -> Option<Self> {
        msg_ring?;
        Some(Self {
            in_pool: Arc::new(InMsgPool::new(cfg.in_bulk_set_msgs, cfg.bulk_set_msg_cap)),
            out_pool: OutMsgPool::new(cfg.out_bulk_set_msgs, cfg.bulk_set_msg_cap),
            msg_cap: cfg.bulk_set_msg_cap,
        })
    }
}

/// An outgoing bulk-set message under construction.
pub(crate) struct BulkSetMsg<K: StoreKey> {
    msg: PooledMsg,
    cap: usize,
    _key: std::marker::PhantomData<K>,
}

impl<K: StoreKey> BulkSetMsg<K> {
    fn new(mut msg: PooledMsg, cap: usize, ack_node_id: u64) -> Self {
        let mut head = [0u8; 8];
        BigEndian::write_u64(&mut head, ack_node_id);
        msg.body.extend_from_slice(&head);
        Self {
            msg,
            cap,
            _key: std::marker::PhantomData,
        }
    }

    /// Appends an entry; `false` means the message is at capacity and must
    /// be sent as-is.
    pub fn add(&mut self, key: &K, timestamp_bits: u64, value: &[u8]) -> bool {
        let entry_len = K::BULK_SET_ENTRY_HEADER_LEN + value.len();
        let at = self.msg.body.len();
        if at + entry_len >= self.cap {
            return false;
        }
        self.msg.body.resize(at + K::BULK_SET_ENTRY_HEADER_LEN, 0);
        let entry = &mut self.msg.body[at..];
        key.write_to(entry);
        BigEndian::write_u64(&mut entry[K::ENCODED_LEN..], timestamp_bits);
        BigEndian::write_u32(&mut entry[K::ENCODED_LEN + 8..], value.len() as u32);
        self.msg.body.extend_from_slice(value);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.msg.body.len() <= 8
    }

    pub fn into_msg(self) -> Box<PooledMsg> {
        Box::new(self.msg)
    }
}

impl<K: StoreKey> Store<K> {
    /// An initialized outgoing bulk-set message. Blocks while the fixed pool
    /// of outgoing bodies is exhausted. `ack_node_id` 0 asks receivers not
    /// to acknowledge.
    pub(crate) fn new_out_bulk_set_msg(&self, ack_node_id: u64) -> Option<BulkSetMsg<K>> {
        let state = self.bulk_set.as_ref()?;
        Some(BulkSetMsg::new(
            state.out_pool.acquire(K::BULK_SET_MSG_TYPE),
            state.msg_cap,
            ack_node_id,
        ))
    }
}

pub(crate) fn launch<K: StoreKey>(store: &Arc<Store<K>>) {
    let state = match &store.bulk_set {
        Some(state) => state,
        None => return,
    };
    for _ in 0..store.cfg.in_bulk_set_workers {
        let store = store.clone();
        let rx = state.in_pool.msg_rx.clone();
        std::thread::spawn(move || in_bulk_set_worker(store, rx));
    }
    let msg_ring = store.msg_ring.clone().expect("state exists only with a ring");
    let handler_store = store.clone();
    msg_ring.set_msg_handler(
        K::BULK_SET_MSG_TYPE,
        Box::new(move |r: &mut dyn std::io::Read, len: u64| {
            let state = handler_store.bulk_set.as_ref().expect("registered with state");
            match state.in_pool.intake(r, len) {
                Ok(Intake::Queued) => {
                    handler_store
                        .counters
                        .in_bulk_sets
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Ok(Intake::Dropped) => {
                    handler_store
                        .counters
                        .in_bulk_set_drops
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Err(e) => {
                    handler_store
                        .counters
                        .in_bulk_set_invalids
                        .fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        }),
    );
}

fn in_bulk_set_worker<K: StoreKey>(store: Arc<Store<K>>, rx: Receiver<Vec<u8>>) {
    for body in rx.iter() {
        process_in_bulk_set(&store, &body);
        if let Some(state) = &store.bulk_set {
            state.in_pool.release(body);
        }
    }
}

/// Applies one incoming bulk-set body and acknowledges what was applied.
pub(crate) fn process_in_bulk_set<K: StoreKey>(store: &Store<K>, body: &[u8]) {
    let msg_ring = match &store.msg_ring {
        Some(msg_ring) => msg_ring,
        None => return,
    };
    if body.len() < 8 {
        return;
    }
    let ring = msg_ring.ring();
    let partition_shift = ring
        .as_ref()
        .map(|r| 64 - u32::from(r.partition_bit_count()));
    let ack_node_id = BigEndian::read_u64(&body[..8]);
    let mut ack = if ack_node_id != 0 {
        store.new_out_bulk_set_ack_msg()
    } else {
        None
    };
    let timeout = Duration::from_millis(store.cfg.in_bulk_set_response_msg_timeout);
    let header = K::BULK_SET_ENTRY_HEADER_LEN;
    let mut at = 8;
    while at + header <= body.len() {
        let key = K::read_from(&body[at..]);
        let timestamp_bits = BigEndian::read_u64(&body[at + K::ENCODED_LEN..]);
        let length = BigEndian::read_u32(&body[at + K::ENCODED_LEN + 8..]) as usize;
        if at + header + length > body.len() {
            break;
        }
        let value = &body[at + header..at + header + length];
        at += header + length;
        let responsible = match (&ring, partition_shift) {
            (Some(ring), Some(shift)) => ring.responsible((key.key_a() >> shift) as u32),
            _ => true,
        };
        store.counters.in_bulk_set_writes.fetch_add(1, Ordering::Relaxed);
        let (stored_bits, result) = if responsible {
            (timestamp_bits, store.write_internal(key, timestamp_bits, value, true))
        } else {
            // Not ours: keep only the timestamp, as a local-only tombstone.
            let bits = timestamp_bits | TSB_LOCAL_REMOVAL;
            (bits, store.write_internal(key, bits, &[], true))
        };
        match result {
            Err(_) => {
                store
                    .counters
                    .in_bulk_set_write_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(old) => {
                if old >= stored_bits {
                    store
                        .counters
                        .in_bulk_set_writes_overridden
                        .fetch_add(1, Ordering::Relaxed);
                }
                if let Some(ack_msg) = ack.as_mut() {
                    if !ack_msg.add(&key, timestamp_bits) {
                        let full = std::mem::replace(
                            ack_msg,
                            store
                                .new_out_bulk_set_ack_msg()
                                .expect("pool exists alongside the ring"),
                        );
                        store
                            .counters
                            .out_bulk_set_acks
                            .fetch_add(1, Ordering::Relaxed);
                        msg_ring.msg_to_node(ack_node_id, full.into_msg(), timeout);
                        ack_msg.add(&key, timestamp_bits);
                    }
                }
            }
        }
    }
    if let Some(ack_msg) = ack {
        if !ack_msg.is_empty() {
            store
                .counters
                .out_bulk_set_acks
                .fetch_add(1, Ordering::Relaxed);
            msg_ring.msg_to_node(ack_node_id, ack_msg.into_msg(), timeout);
        }
    }
}
