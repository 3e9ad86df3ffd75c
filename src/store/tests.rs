use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::config::StoreConfig;
use crate::error::Error;
use crate::keys::{StoreKey, ValueKey};
use crate::ring::testing::{MsgRingPlaceholder, StaticRing};
use crate::ring::{MsgRing, Ring};
use crate::tsb::{seconds_to_bits, timestamp_bits_now, TSB_DELETION, TSB_LOCAL_REMOVAL};

use super::{bulkset, bulksetack, pullreplication, Store};

fn low_mem_config(dir: &Path) -> StoreConfig {
    let mut cfg = StoreConfig::new(dir)
        .workers(2)
        .checksum_interval(1021)
        .page_size(2048)
        .value_cap(128);
    cfg.write_pages_per_worker = 2;
    cfg.rand_seed = Some(42);
    cfg.out_pull_replication_bloom_n = 100;
    cfg.out_pull_replication_workers = 2;
    cfg.out_push_replication_workers = 2;
    cfg.compaction_age_threshold = 1;
    cfg.audit_age_threshold = 1;
    cfg
}

fn open_value_store(dir: &Path) -> Arc<Store<ValueKey>> {
    let (store, _restart) = Store::<ValueKey>::open(&low_mem_config(dir), None).unwrap();
    store
}

fn static_ring(responsible: bool) -> Arc<dyn Ring> {
    Arc::new(StaticRing {
        version: 1,
        partition_bits: 8,
        responsible,
        node_id: 1,
    })
}

#[test]
fn test_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    let old = store.write(ValueKey::new(1, 2), 0x500, b"testing").unwrap();
    assert_eq!(old, 0);
    let mut value = Vec::new();
    let tsb = store.read(ValueKey::new(1, 2), &mut value).unwrap();
    assert_eq!(tsb, 0x500);
    assert_eq!(value, b"testing");
    let (tsb, length) = store.lookup(ValueKey::new(1, 2)).unwrap();
    assert_eq!(tsb, 0x500);
    assert_eq!(length, 7);
}

#[test]
fn test_older_write_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    let key = ValueKey::new(1, 2);
    store.write(key, 0x600, b"newer").unwrap();
    let old = store.write(key, 0x500, b"older").unwrap();
    assert_eq!(old, 0x600);
    let mut value = Vec::new();
    assert_eq!(store.read(key, &mut value).unwrap(), 0x600);
    assert_eq!(value, b"newer");
    // Equal timestamps are idempotent, not an overwrite.
    let old = store.write(key, 0x600, b"equal").unwrap();
    assert_eq!(old, 0x600);
    value.clear();
    store.read(key, &mut value).unwrap();
    assert_eq!(value, b"newer");
}

#[test]
fn test_delete_leaves_a_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    let key = ValueKey::new(1, 2);
    store.write(key, 0x500, b"testing").unwrap();
    let old = store.delete(key, 0x600).unwrap();
    assert_eq!(old, 0x500);
    let mut value = Vec::new();
    match store.read(key, &mut value) {
        Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x600 | TSB_DELETION),
        other => panic!("expected not found, got {other:?}"),
    }
    match store.lookup(key) {
        Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x600 | TSB_DELETION),
        other => panic!("expected not found, got {other:?}"),
    }
    // An even older write cannot resurrect the key.
    assert_eq!(store.write(key, 0x580, b"zombie").unwrap(), 0x600 | TSB_DELETION);
    assert!(store.read(key, &mut Vec::new()).is_err());
}

#[test]
fn test_value_cap_and_disabled_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    let huge = vec![0u8; 129];
    assert_eq!(
        store.write(ValueKey::new(1, 1), 0x500, &huge),
        Err(Error::TooLarge)
    );
    store.disable_writes();
    assert_eq!(
        store.write(ValueKey::new(1, 1), 0x500, b"x"),
        Err(Error::Disabled)
    );
    // An automatic re-enable must not override the user's disable.
    store.set_writes_enabled(false);
    assert_eq!(
        store.write(ValueKey::new(1, 1), 0x500, b"x"),
        Err(Error::Disabled)
    );
    store.enable_writes();
    assert!(store.write(ValueKey::new(1, 1), 0x500, b"x").is_ok());
}

#[test]
fn test_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let store = store.clone();
            scope.spawn(move || {
                for i in 0..200u64 {
                    let key = ValueKey::new(t << 32 | i, i);
                    let value = format!("value-{t}-{i}");
                    store.write(key, (1000 + i) << 8, value.as_bytes()).unwrap();
                }
            });
        }
    });
    for t in 0..4u64 {
        for i in 0..200u64 {
            let mut value = Vec::new();
            let tsb = store.read(ValueKey::new(t << 32 | i, i), &mut value).unwrap();
            assert_eq!(tsb, (1000 + i) << 8);
            assert_eq!(value, format!("value-{t}-{i}").as_bytes());
        }
    }
}

#[test]
fn test_flush_then_recover() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_value_store(dir.path());
        for i in 0..50u64 {
            let value = format!("payload-{i}");
            store
                .write(ValueKey::new(i, i * 7), (5000 + i) << 8, value.as_bytes())
                .unwrap();
        }
        store.delete(ValueKey::new(3, 21), (9000u64) << 8).unwrap();
        store.flush();
    }
    // A second store over the same directory replays the TOC files.
    let store = open_value_store(dir.path());
    for i in 0..50u64 {
        let key = ValueKey::new(i, i * 7);
        let mut value = Vec::new();
        if i == 3 {
            match store.read(key, &mut value) {
                Err(Error::NotFound(tsb)) => assert_eq!(tsb, (9000u64 << 8) | TSB_DELETION),
                other => panic!("expected tombstone, got {other:?}"),
            }
        } else {
            assert_eq!(store.read(key, &mut value).unwrap(), (5000 + i) << 8);
            assert_eq!(value, format!("payload-{i}").as_bytes());
        }
    }
    // Replaying the same corpus again yields the same map.
    let again = open_value_store(dir.path());
    assert_eq!(again.locmap.len(), store.locmap.len());
    assert_eq!(again.locmap.counts(), store.locmap.counts());
}

fn data_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| n.ends_with(".value"))
        .collect()
}

#[test]
fn test_compaction_reclaims_stale_files_without_observable_change() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    for i in 0..20u64 {
        let value = format!("first-{i}");
        store
            .write(ValueKey::new(i, i), (1000 + i) << 8, value.as_bytes())
            .unwrap();
    }
    store.flush();
    for i in 0..10u64 {
        let value = format!("second-{i}");
        store
            .write(ValueKey::new(i, i), (2000 + i) << 8, value.as_bytes())
            .unwrap();
    }
    store.flush();
    assert_eq!(data_files(dir.path()).len(), 2);
    // Let the files age past the threshold and the clearers settle.
    std::thread::sleep(Duration::from_millis(1300));
    store.compaction_pass();
    // The first file was half stale and is gone; the second was fully live.
    assert_eq!(data_files(dir.path()).len(), 1);
    for i in 0..20u64 {
        let mut value = Vec::new();
        let tsb = store.read(ValueKey::new(i, i), &mut value).unwrap();
        if i < 10 {
            assert_eq!(tsb, (2000 + i) << 8);
            assert_eq!(value, format!("second-{i}").as_bytes());
        } else {
            assert_eq!(tsb, (1000 + i) << 8);
            assert_eq!(value, format!("first-{i}").as_bytes());
        }
    }
    let stats = store.stats();
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.compaction_rewrites, 10);
    assert_eq!(stats.compaction_stale, 10);
}

#[test]
fn test_audit_failure_quarantines_and_requests_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = low_mem_config(dir.path());
    let (store, restart_rx) = Store::<ValueKey>::open(&cfg, None).unwrap();
    store.write(ValueKey::new(1, 2), 0x500, b"testing").unwrap();
    store.flush();
    std::thread::sleep(Duration::from_millis(1300));
    // Corrupt a byte inside the live range; the value starts at logical
    // offset 32, inside the first checksummed interval.
    let files = data_files(dir.path());
    assert_eq!(files.len(), 1);
    let data_path = dir.path().join(&files[0]);
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&data_path).unwrap();
        file.seek(SeekFrom::Start(34)).unwrap();
        file.write_all(b"X").unwrap();
    }
    store.audit_pass();
    // The pair is gone and a restart was requested.
    assert!(data_files(dir.path()).is_empty());
    match restart_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Error::Fatal(_)) => {}
        other => panic!("expected fatal restart request, got {other:?}"),
    }
}

#[test]
fn test_tombstone_discard_drops_expired_markers() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = low_mem_config(dir.path());
    cfg.tombstone_age = 1;
    let (store, _restart) = Store::<ValueKey>::open(&cfg, None).unwrap();
    let expired = timestamp_bits_now() - seconds_to_bits(10);
    store.delete(ValueKey::new(1, 1), expired).unwrap();
    store.delete(ValueKey::new(2, 2), timestamp_bits_now()).unwrap();
    assert_eq!(store.locmap.len(), 2);
    store.tombstone_discard_pass();
    // Only the expired marker went away.
    assert_eq!(store.locmap.len(), 1);
    match store.lookup(ValueKey::new(1, 1)) {
        Err(Error::NotFound(0)) => {}
        other => panic!("expected full absence, got {other:?}"),
    }
}

#[test]
fn test_bulk_set_ack_converts_when_not_responsible() {
    let dir = tempfile::tempdir().unwrap();
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(false)));
    let (store, _restart) =
        Store::<ValueKey>::open(&low_mem_config(dir.path()), Some(msg_ring as Arc<dyn MsgRing>))
            .unwrap();
    store.write_internal(ValueKey::new(1, 2), 0x500, b"testing", true).unwrap();
    let mut value = Vec::new();
    assert_eq!(store.read(ValueKey::new(1, 2), &mut value).unwrap(), 0x500);
    assert_eq!(value, b"testing");

    let mut ack = store.new_out_bulk_set_ack_msg().unwrap();
    assert!(ack.add(&ValueKey::new(1, 2), 0x500));
    let body = ack.into_msg().body.clone();
    bulksetack::process_in_bulk_set_ack(&store, &body);

    value.clear();
    match store.read(ValueKey::new(1, 2), &mut value) {
        Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x500 | TSB_LOCAL_REMOVAL),
        other => panic!("expected local removal, got {other:?}"),
    }
    assert!(value.is_empty());
}

#[test]
fn test_bulk_set_ack_keeps_copy_when_responsible_or_ringless() {
    for ring in [Some(static_ring(true)), None] {
        let dir = tempfile::tempdir().unwrap();
        let msg_ring = Arc::new(MsgRingPlaceholder {
            ring,
            ..Default::default()
        });
        let (store, _restart) = Store::<ValueKey>::open(
            &low_mem_config(dir.path()),
            Some(msg_ring as Arc<dyn MsgRing>),
        )
        .unwrap();
        store.write_internal(ValueKey::new(1, 2), 0x500, b"testing", true).unwrap();
        let mut ack = store.new_out_bulk_set_ack_msg().unwrap();
        ack.add(&ValueKey::new(1, 2), 0x500);
        let body = ack.into_msg().body.clone();
        bulksetack::process_in_bulk_set_ack(&store, &body);
        let mut value = Vec::new();
        assert_eq!(store.read(ValueKey::new(1, 2), &mut value).unwrap(), 0x500);
        assert_eq!(value, b"testing");
    }
}

#[test]
fn test_bulk_set_ack_msg_hits_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = low_mem_config(dir.path());
    cfg.bulk_set_ack_msg_cap = ValueKey::BULK_SET_ACK_ENTRY_LEN + 3;
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(true)));
    let (store, _restart) =
        Store::<ValueKey>::open(&cfg, Some(msg_ring as Arc<dyn MsgRing>)).unwrap();
    let mut ack = store.new_out_bulk_set_ack_msg().unwrap();
    assert!(ack.add(&ValueKey::new(1, 2), 0x500));
    assert!(!ack.add(&ValueKey::new(6, 7), 0xa00));
}

#[test]
fn test_bulk_set_ack_wire_layout() {
    let dir = tempfile::tempdir().unwrap();
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(true)));
    let (store, _restart) =
        Store::<ValueKey>::open(&low_mem_config(dir.path()), Some(msg_ring as Arc<dyn MsgRing>))
            .unwrap();
    let mut ack = store.new_out_bulk_set_ack_msg().unwrap();
    ack.add(&ValueKey::new(1, 2), 0x500);
    ack.add(&ValueKey::new(6, 7), 0xa00);
    let msg = ack.into_msg();
    use crate::ring::Msg as _;
    assert_eq!(msg.msg_type(), ValueKey::BULK_SET_ACK_MSG_TYPE);
    assert_eq!(msg.msg_length(), 48);
    assert_eq!(
        msg.body,
        vec![
            0, 0, 0, 0, 0, 0, 0, 1, // key a
            0, 0, 0, 0, 0, 0, 0, 2, // key b
            0, 0, 0, 0, 0, 0, 5, 0, // timestamp bits
            0, 0, 0, 0, 0, 0, 0, 6, // key a
            0, 0, 0, 0, 0, 0, 0, 7, // key b
            0, 0, 0, 0, 0, 0, 10, 0, // timestamp bits
        ]
    );
}

#[test]
fn test_in_bulk_set_applies_and_acks() {
    let dir = tempfile::tempdir().unwrap();
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(true)));
    let (store, _restart) = Store::<ValueKey>::open(
        &low_mem_config(dir.path()),
        Some(msg_ring.clone() as Arc<dyn MsgRing>),
    )
    .unwrap();
    let mut bsm = store.new_out_bulk_set_msg(77).unwrap();
    assert!(bsm.add(&ValueKey::new(1, 2), 0x500, b"testing"));
    let body = bsm.into_msg().body.clone();
    bulkset::process_in_bulk_set(&store, &body);
    let mut value = Vec::new();
    assert_eq!(store.read(ValueKey::new(1, 2), &mut value).unwrap(), 0x500);
    assert_eq!(value, b"testing");
    let sent = msg_ring.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ValueKey::BULK_SET_ACK_MSG_TYPE);
    assert_eq!(sent[0].1.len(), ValueKey::BULK_SET_ACK_ENTRY_LEN);
}

#[test]
fn test_in_bulk_set_stores_local_removal_when_not_responsible() {
    let dir = tempfile::tempdir().unwrap();
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(false)));
    let (store, _restart) = Store::<ValueKey>::open(
        &low_mem_config(dir.path()),
        Some(msg_ring.clone() as Arc<dyn MsgRing>),
    )
    .unwrap();
    let mut bsm = store.new_out_bulk_set_msg(0).unwrap();
    bsm.add(&ValueKey::new(1, 2), 0x500, b"testing");
    let body = bsm.into_msg().body.clone();
    bulkset::process_in_bulk_set(&store, &body);
    match store.lookup(ValueKey::new(1, 2)) {
        Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x500 | TSB_LOCAL_REMOVAL),
        other => panic!("expected local removal, got {other:?}"),
    }
    // Ack node id 0 means nobody wanted an acknowledgement.
    assert!(msg_ring.sent.lock().is_empty());
}

#[test]
fn test_pull_replication_round_trip() {
    // Store A holds the partition but is missing the value; store B has it.
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let ring_a = Arc::new(MsgRingPlaceholder::with_ring(static_ring(true)));
    let ring_b = Arc::new(MsgRingPlaceholder::with_ring(Arc::new(StaticRing {
        version: 1,
        partition_bits: 8,
        responsible: true,
        node_id: 2,
    })));
    let (store_a, _ra) = Store::<ValueKey>::open(
        &low_mem_config(dir_a.path()),
        Some(ring_a.clone() as Arc<dyn MsgRing>),
    )
    .unwrap();
    let (store_b, _rb) = Store::<ValueKey>::open(
        &low_mem_config(dir_b.path()),
        Some(ring_b.clone() as Arc<dyn MsgRing>),
    )
    .unwrap();
    let key = ValueKey::new(1, 2);
    let old_bits = timestamp_bits_now() - seconds_to_bits(120);
    store_b.write(key, old_bits, b"replicate me").unwrap();

    store_a.out_pull_replication_pass();
    let pull_body = {
        let sent = ring_a.sent.lock();
        assert!(!sent.is_empty());
        // Key a = 1 lives in partition 0; take that partition's request.
        sent.iter()
            .find(|(t, b)| {
                *t == ValueKey::PULL_REPLICATION_MSG_TYPE
                    && BigEndian::read_u32(&b[16..20]) == 0
            })
            .expect("pull request for partition 0")
            .1
            .clone()
    };
    pullreplication::process_in_pull_replication(&store_b, &pull_body);
    let bulk_body = {
        let sent = ring_b.sent.lock();
        let (msg_type, body) = sent.last().expect("bulk set response");
        assert_eq!(*msg_type, ValueKey::BULK_SET_MSG_TYPE);
        body.clone()
    };
    bulkset::process_in_bulk_set(&store_a, &bulk_body);
    let mut value = Vec::new();
    assert_eq!(store_a.read(key, &mut value).unwrap(), old_bits);
    assert_eq!(value, b"replicate me");
}

#[test]
fn test_push_replication_ships_unowned_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let msg_ring = Arc::new(MsgRingPlaceholder::with_ring(static_ring(false)));
    let (store, _restart) = Store::<ValueKey>::open(
        &low_mem_config(dir.path()),
        Some(msg_ring.clone() as Arc<dyn MsgRing>),
    )
    .unwrap();
    let key = ValueKey::new(1, 2);
    let old_bits = timestamp_bits_now() - seconds_to_bits(120);
    store.write(key, old_bits, b"handoff").unwrap();
    store.out_push_replication_pass();
    let sent = msg_ring.sent.lock();
    let (msg_type, body) = sent
        .iter()
        .find(|(t, _)| *t == ValueKey::BULK_SET_MSG_TYPE)
        .expect("push bulk set");
    assert_eq!(*msg_type, ValueKey::BULK_SET_MSG_TYPE);
    // Ack node id, then the single entry carrying the value.
    assert_eq!(
        body.len(),
        8 + ValueKey::BULK_SET_ENTRY_HEADER_LEN + b"handoff".len()
    );
}

#[test]
fn test_enable_disable_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    store.enable_all();
    assert!(store.compaction_bg.is_enabled());
    assert!(store.audit_bg.is_enabled());
    assert!(store.flusher_bg.is_enabled());
    store.disable_all();
    assert!(!store.compaction_bg.is_enabled());
    assert!(!store.audit_bg.is_enabled());
    assert!(!store.flusher_bg.is_enabled());
    assert_eq!(store.write(ValueKey::new(1, 1), 0x500, b"x"), Err(Error::Disabled));
}

#[test]
fn test_group_store_keeps_members_separate() {
    use crate::keys::GroupKey;
    let dir = tempfile::tempdir().unwrap();
    let (store, _restart) = Store::<GroupKey>::open(&low_mem_config(dir.path()), None).unwrap();
    let member_a = GroupKey::new(1, 2, 3, 4);
    let member_b = GroupKey::new(1, 2, 5, 6);
    store.write(member_a, 0x500, b"alpha").unwrap();
    store.write(member_b, 0x500, b"beta").unwrap();
    let mut value = Vec::new();
    assert_eq!(store.read(member_a, &mut value).unwrap(), 0x500);
    assert_eq!(value, b"alpha");
    value.clear();
    assert_eq!(store.read(member_b, &mut value).unwrap(), 0x500);
    assert_eq!(value, b"beta");
    // Deleting one member leaves its sibling alone.
    store.delete(member_a, 0x600).unwrap();
    assert!(store.lookup(member_a).is_err());
    assert_eq!(store.lookup(member_b).unwrap(), (0x500, 4));
    // And the pair survives a flush and replay.
    store.flush();
    let (again, _restart) = Store::<GroupKey>::open(&low_mem_config(dir.path()), None).unwrap();
    value.clear();
    assert_eq!(again.read(member_b, &mut value).unwrap(), 0x500);
    assert_eq!(value, b"beta");
    match again.lookup(member_a) {
        Err(Error::NotFound(tsb)) => assert_eq!(tsb, 0x600 | TSB_DELETION),
        other => panic!("expected tombstone, got {other:?}"),
    }
}

#[test]
fn test_stats_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_value_store(dir.path());
    store.write(ValueKey::new(1, 1), 0x500, b"abc").unwrap();
    store.write(ValueKey::new(2, 2), 0x500, b"defg").unwrap();
    store.delete(ValueKey::new(2, 2), 0x600).unwrap();
    let mut value = Vec::new();
    let _ = store.read(ValueKey::new(1, 1), &mut value);
    let stats = store.stats();
    assert_eq!(stats.values, 1);
    assert_eq!(stats.value_bytes, 3);
    assert_eq!(stats.writes, 2);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.reads, 1);
    assert!(stats.writes_enabled);
    let rendered = stats.to_string();
    assert!(rendered.contains("values: 1"));
    assert!(rendered.contains("writes_enabled: true"));
}
