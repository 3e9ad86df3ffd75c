//! Operational counters.

use std::fmt::Display;
use std::sync::atomic::Ordering;

use crate::keys::StoreKey;

use super::Store;

/// A point-in-time snapshot of the store's counters plus location-map
/// totals. Counter reads are individually atomic; the snapshot as a whole is
/// not a transaction.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Live (non-tombstone) keys in the location map.
    pub values: u64,
    /// Bytes those keys reference.
    pub value_bytes: u64,
    pub lookups: u64,
    pub lookup_errors: u64,
    pub reads: u64,
    pub read_errors: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub writes_overridden: u64,
    pub deletes: u64,
    pub delete_errors: u64,
    pub deletes_overridden: u64,
    pub in_bulk_sets: u64,
    pub in_bulk_set_drops: u64,
    pub in_bulk_set_invalids: u64,
    pub in_bulk_set_writes: u64,
    pub in_bulk_set_write_errors: u64,
    pub in_bulk_set_writes_overridden: u64,
    pub out_bulk_sets: u64,
    pub out_bulk_set_values: u64,
    pub out_bulk_set_pushes: u64,
    pub out_bulk_set_push_values: u64,
    pub in_bulk_set_acks: u64,
    pub in_bulk_set_ack_drops: u64,
    pub in_bulk_set_ack_invalids: u64,
    pub in_bulk_set_ack_writes: u64,
    pub in_bulk_set_ack_write_errors: u64,
    pub in_bulk_set_ack_writes_overridden: u64,
    pub out_bulk_set_acks: u64,
    pub in_pull_replications: u64,
    pub in_pull_replication_drops: u64,
    pub in_pull_replication_invalids: u64,
    pub out_pull_replications: u64,
    pub compactions: u64,
    pub compaction_rewrites: u64,
    pub compaction_stale: u64,
    pub expired_tombstones: u64,
    pub writes_enabled: bool,
}

pub(crate) fn gather<K: StoreKey>(store: &Store<K>) -> Stats {
    let c = &store.counters;
    let (values, value_bytes) = store.locmap.counts();
    Stats {
        values,
        value_bytes,
        lookups: c.lookups.load(Ordering::Relaxed),
        lookup_errors: c.lookup_errors.load(Ordering::Relaxed),
        reads: c.reads.load(Ordering::Relaxed),
        read_errors: c.read_errors.load(Ordering::Relaxed),
        writes: c.writes.load(Ordering::Relaxed),
        write_errors: c.write_errors.load(Ordering::Relaxed),
        writes_overridden: c.writes_overridden.load(Ordering::Relaxed),
        deletes: c.deletes.load(Ordering::Relaxed),
        delete_errors: c.delete_errors.load(Ordering::Relaxed),
        deletes_overridden: c.deletes_overridden.load(Ordering::Relaxed),
        in_bulk_sets: c.in_bulk_sets.load(Ordering::Relaxed),
        in_bulk_set_drops: c.in_bulk_set_drops.load(Ordering::Relaxed),
        in_bulk_set_invalids: c.in_bulk_set_invalids.load(Ordering::Relaxed),
        in_bulk_set_writes: c.in_bulk_set_writes.load(Ordering::Relaxed),
        in_bulk_set_write_errors: c.in_bulk_set_write_errors.load(Ordering::Relaxed),
        in_bulk_set_writes_overridden: c.in_bulk_set_writes_overridden.load(Ordering::Relaxed),
        out_bulk_sets: c.out_bulk_sets.load(Ordering::Relaxed),
        out_bulk_set_values: c.out_bulk_set_values.load(Ordering::Relaxed),
        out_bulk_set_pushes: c.out_bulk_set_pushes.load(Ordering::Relaxed),
        out_bulk_set_push_values: c.out_bulk_set_push_values.load(Ordering::Relaxed),
        in_bulk_set_acks: c.in_bulk_set_acks.load(Ordering::Relaxed),
        in_bulk_set_ack_drops: c.in_bulk_set_ack_drops.load(Ordering::Relaxed),
        in_bulk_set_ack_invalids: c.in_bulk_set_ack_invalids.load(Ordering::Relaxed),
        in_bulk_set_ack_writes: c.in_bulk_set_ack_writes.load(Ordering::Relaxed),
        in_bulk_set_ack_write_errors: c.in_bulk_set_ack_write_errors.load(Ordering::Relaxed),
        in_bulk_set_ack_writes_overridden: c
            .in_bulk_set_ack_writes_overridden
            .load(Ordering::Relaxed),
        out_bulk_set_acks: c.out_bulk_set_acks.load(Ordering::Relaxed),
        in_pull_replications: c.in_pull_replications.load(Ordering::Relaxed),
        in_pull_replication_drops: c.in_pull_replication_drops.load(Ordering::Relaxed),
        in_pull_replication_invalids: c.in_pull_replication_invalids.load(Ordering::Relaxed),
        out_pull_replications: c.out_pull_replications.load(Ordering::Relaxed),
        compactions: c.compactions.load(Ordering::Relaxed),
        compaction_rewrites: c.compaction_rewrites.load(Ordering::Relaxed),
        compaction_stale: c.compaction_stale.load(Ordering::Relaxed),
        expired_tombstones: c.expired_tombstones.load(Ordering::Relaxed),
        writes_enabled: store.writes_currently_enabled(),
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "values: {}", self.values)?;
        writeln!(f, "value_bytes: {}", self.value_bytes)?;
        writeln!(f, "lookups: {} ({} misses)", self.lookups, self.lookup_errors)?;
        writeln!(f, "reads: {} ({} errors)", self.reads, self.read_errors)?;
        writeln!(
            f,
            "writes: {} ({} errors, {} overridden)",
            self.writes, self.write_errors, self.writes_overridden
        )?;
        writeln!(
            f,
            "deletes: {} ({} errors, {} overridden)",
            self.deletes, self.delete_errors, self.deletes_overridden
        )?;
        writeln!(
            f,
            "in_bulk_sets: {} ({} dropped, {} invalid)",
            self.in_bulk_sets, self.in_bulk_set_drops, self.in_bulk_set_invalids
        )?;
        writeln!(
            f,
            "out_bulk_sets: {} ({} values), pushes: {} ({} values)",
            self.out_bulk_sets,
            self.out_bulk_set_values,
            self.out_bulk_set_pushes,
            self.out_bulk_set_push_values
        )?;
        writeln!(
            f,
            "in_bulk_set_acks: {} ({} dropped, {} invalid), out: {}",
            self.in_bulk_set_acks,
            self.in_bulk_set_ack_drops,
            self.in_bulk_set_ack_invalids,
            self.out_bulk_set_acks
        )?;
        writeln!(
            f,
            "pull_replications: {} in ({} dropped, {} invalid), {} out",
            self.in_pull_replications,
            self.in_pull_replication_drops,
            self.in_pull_replication_invalids,
            self.out_pull_replications
        )?;
        writeln!(
            f,
            "compactions: {} ({} rewrote, {} stale)",
            self.compactions, self.compaction_rewrites, self.compaction_stale
        )?;
        writeln!(f, "expired_tombstones: {}", self.expired_tombstones)?;
        write!(f, "writes_enabled: {}", self.writes_enabled)
    }
}
