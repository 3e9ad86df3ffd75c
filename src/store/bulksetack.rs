//! Bulk-set-ack messages: batches of `(key, timestamp bits)` telling a
//! sender "I have this".
//!
//! Body layout: packed entries of `key || timestamp bits (8)`; trailing
//! bytes that do not form a whole entry are dropped. A receiver that is no
//! longer responsible for a key's partition converts the ack into a
//! local-removal tombstone, relinquishing its copy; a responsible receiver
//! (or one with no ring to consult) ignores the ack and keeps its copy.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Receiver;

use crate::config::StoreConfig;
use crate::keys::StoreKey;
use crate::msgs::{InMsgPool, Intake, OutMsgPool, PooledMsg};
use crate::ring::MsgRing;
use crate::tsb::TSB_LOCAL_REMOVAL;

use super::Store;

pub(crate) struct BulkSetAckState {
    pub in_pool: Arc<InMsgPool>,
    pub out_pool: OutMsgPool,
    pub msg_cap: usize,
}

impl BulkSetAckState {
    pub fn new(cfg: &StoreConfig, msg_ring: Option<&dyn MsgRing>) -> Option<Self> {
        msg_ring?;
        Some(Self {
            in_pool: Arc::new(InMsgPool::new(
                cfg.in_bulk_set_ack_msgs,
                cfg.bulk_set_ack_msg_cap,
            )),
            out_pool: OutMsgPool::new(cfg.out_bulk_set_ack_msgs, cfg.bulk_set_ack_msg_cap),
            msg_cap: cfg.bulk_set_ack_msg_cap,
        })
    }
}

/// An outgoing bulk-set-ack message under construction.
pub(crate) struct BulkSetAckMsg<K: StoreKey> {
    msg: PooledMsg,
    cap: usize,
    _key: std::marker::PhantomData<K>,
}

impl<K: StoreKey> BulkSetAckMsg<K> {
    /// Appends an entry; `false` means the message is at capacity.
    pub fn add(&mut self, key: &K, timestamp_bits: u64) -> bool {
        let at = self.msg.body.len();
        if at + K::BULK_SET_ACK_ENTRY_LEN >= self.cap {
            return false;
        }
        self.msg.body.resize(at + K::BULK_SET_ACK_ENTRY_LEN, 0);
        let entry = &mut self.msg.body[at..];
        key.write_to(entry);
        BigEndian::write_u64(&mut entry[K::ENCODED_LEN..], timestamp_bits);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.msg.body.is_empty()
    }

    pub fn into_msg(self) -> Box<PooledMsg> {
        Box::new(self.msg)
    }
}

impl<K: StoreKey> Store<K> {
    /// An initialized outgoing bulk-set-ack message; blocks while the fixed
    /// pool of outgoing bodies is exhausted.
    pub(crate) fn new_out_bulk_set_ack_msg(&self) -> Option<BulkSetAckMsg<K>> {
        let state = self.bulk_set_ack.as_ref()?;
        Some(BulkSetAckMsg {
            msg: state.out_pool.acquire(K::BULK_SET_ACK_MSG_TYPE),
            cap: state.msg_cap,
            _key: std::marker::PhantomData,
        })
    }
}

pub(crate) fn launch<K: StoreKey>(store: &Arc<Store<K>>) {
    let state = match &store.bulk_set_ack {
        Some(state) => state,
        None => return,
    };
    for _ in 0..store.cfg.in_bulk_set_ack_workers {
        let store = store.clone();
        let rx = state.in_pool.msg_rx.clone();
        std::thread::spawn(move || in_bulk_set_ack_worker(store, rx));
    }
    let msg_ring = store.msg_ring.clone().expect("state exists only with a ring");
    let handler_store = store.clone();
    msg_ring.set_msg_handler(
        K::BULK_SET_ACK_MSG_TYPE,
        Box::new(move |r: &mut dyn std::io::Read, len: u64| {
            let state = handler_store
                .bulk_set_ack
                .as_ref()
                .expect("registered with state");
            match state.in_pool.intake(r, len) {
                Ok(Intake::Queued) => {
                    handler_store
                        .counters
                        .in_bulk_set_acks
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Ok(Intake::Dropped) => {
                    handler_store
                        .counters
                        .in_bulk_set_ack_drops
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(len)
                }
                Err(e) => {
                    handler_store
                        .counters
                        .in_bulk_set_ack_invalids
                        .fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            }
        }),
    );
}

fn in_bulk_set_ack_worker<K: StoreKey>(store: Arc<Store<K>>, rx: Receiver<Vec<u8>>) {
    for body in rx.iter() {
        process_in_bulk_set_ack(&store, &body);
        if let Some(state) = &store.bulk_set_ack {
            state.in_pool.release(body);
        }
    }
}

/// Applies one incoming bulk-set-ack body.
pub(crate) fn process_in_bulk_set_ack<K: StoreKey>(store: &Store<K>, body: &[u8]) {
    let ring = match store.msg_ring.as_ref().and_then(|m| m.ring()) {
        Some(ring) => ring,
        // Without a ring we cannot tell whether we are still responsible,
        // so every copy is kept.
        None => return,
    };
    let partition_shift = 64 - u32::from(ring.partition_bit_count());
    let entry_len = K::BULK_SET_ACK_ENTRY_LEN;
    // Whole entries only; any trailing fragment is dropped.
    let usable = body.len() / entry_len * entry_len;
    let mut at = 0;
    while at < usable {
        let key = K::read_from(&body[at..]);
        let timestamp_bits = BigEndian::read_u64(&body[at + K::ENCODED_LEN..]);
        at += entry_len;
        if ring.responsible((key.key_a() >> partition_shift) as u32) {
            continue;
        }
        // The replica that acked now owns this record; keep only a
        // local-only tombstone at its timestamp.
        store
            .counters
            .in_bulk_set_ack_writes
            .fetch_add(1, Ordering::Relaxed);
        let bits = timestamp_bits | TSB_LOCAL_REMOVAL;
        match store.write_internal(key, bits, &[], true) {
            Err(_) => {
                store
                    .counters
                    .in_bulk_set_ack_write_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(old) => {
                if old >= bits {
                    store
                        .counters
                        .in_bulk_set_ack_writes_overridden
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
