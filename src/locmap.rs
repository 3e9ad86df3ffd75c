//! The location map: `key -> (timestamp bits, block, offset, length)`.
//!
//! Conflict resolution lives here. Updates are compare-and-set on the stored
//! timestamp bits: the larger value wins, an equal value is accepted only
//! when the caller asks for it (compaction rewrites). The map is sharded by
//! the top bits of `key_a`, which is also the partition axis, so range scans
//! touch only the shards a partition can live in.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::keys::StoreKey;

/// Where a key's current value lives. `block_id` 0 means not present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub timestamp_bits: u64,
    pub block_id: u32,
    pub offset: u32,
    pub length: u32,
}

const SHARD_BITS: u32 = 8;
const SHARD_COUNT: usize = 1 << SHARD_BITS;

pub struct LocMap<K: StoreKey> {
    shards: Vec<Mutex<HashMap<K, Location>>>,
}

impl<K: StoreKey> LocMap<K> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Location>> {
        &self.shards[(key.key_a() >> (64 - SHARD_BITS)) as usize]
    }

    pub fn get(&self, key: &K) -> Option<Location> {
        self.shard(key).lock().get(key).copied()
    }

    /// Timestamp-wins compare-and-set. Returns the previously stored
    /// timestamp bits (0 when the key was absent). The update is applied only
    /// when `timestamp_bits` is greater than the stored value, or equal with
    /// `even_if_same_timestamp` set. A winning update with `block_id` 0
    /// removes the entry.
    pub fn set(
        &self,
        key: K,
        timestamp_bits: u64,
        block_id: u32,
        offset: u32,
        length: u32,
        even_if_same_timestamp: bool,
    ) -> u64 {
        let mut shard = self.shard(&key).lock();
        match shard.get_mut(&key) {
            None => {
                if block_id != 0 {
                    shard.insert(
                        key,
                        Location {
                            timestamp_bits,
                            block_id,
                            offset,
                            length,
                        },
                    );
                }
                0
            }
            Some(existing) => {
                let old = existing.timestamp_bits;
                if timestamp_bits > old || (timestamp_bits == old && even_if_same_timestamp) {
                    if block_id == 0 {
                        shard.remove(&key);
                    } else {
                        *existing = Location {
                            timestamp_bits,
                            block_id,
                            offset,
                            length,
                        };
                    }
                }
                old
            }
        }
    }

    /// Visits entries with `key_a` in `[start, stop]` whose timestamp bits
    /// have all of `mask` set, none of `not_mask` set, and are below
    /// `cutoff`. Stops early when the callback returns `false` or after `max`
    /// matches; returns `true` only on a complete scan.
    pub fn scan_callback(
        &self,
        start: u64,
        stop: u64,
        mask: u64,
        not_mask: u64,
        cutoff: u64,
        max: u64,
        mut f: impl FnMut(&K, &Location) -> bool,
    ) -> bool {
        let shard_lo = start >> (64 - SHARD_BITS);
        let shard_hi = stop >> (64 - SHARD_BITS);
        let mut matched = 0u64;
        for index in shard_lo..=shard_hi {
            let shard = self.shards[index as usize].lock();
            for (key, loc) in shard.iter() {
                let key_a = key.key_a();
                if key_a < start || key_a > stop {
                    continue;
                }
                let tsb = loc.timestamp_bits;
                if tsb & mask != mask || tsb & not_mask != 0 || tsb >= cutoff {
                    continue;
                }
                if !f(key, loc) {
                    return false;
                }
                matched += 1;
                if matched >= max {
                    return false;
                }
            }
        }
        true
    }

    /// Live (non-tombstone) entry and byte counts, for stats.
    pub fn counts(&self) -> (u64, u64) {
        let mut entries = 0u64;
        let mut bytes = 0u64;
        for shard in &self.shards {
            for loc in shard.lock().values() {
                if loc.timestamp_bits & crate::tsb::TSB_DELETION == 0 {
                    entries += 1;
                    bytes += u64::from(loc.length);
                }
            }
        }
        (entries, bytes)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }
}

impl<K: StoreKey> Default for LocMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ValueKey;
    use crate::tsb::TSB_DELETION;

    #[test]
    fn test_newer_timestamp_wins() {
        let map = LocMap::new();
        let key = ValueKey::new(1, 2);
        assert_eq!(map.set(key, 0x500, 1, 0, 7, false), 0);
        assert_eq!(map.set(key, 0x600, 2, 10, 8, false), 0x500);
        let loc = map.get(&key).unwrap();
        assert_eq!(loc.timestamp_bits, 0x600);
        assert_eq!(loc.block_id, 2);
    }

    #[test]
    fn test_older_or_equal_is_rejected() {
        let map = LocMap::new();
        let key = ValueKey::new(1, 2);
        map.set(key, 0x600, 1, 0, 7, false);
        assert_eq!(map.set(key, 0x500, 2, 10, 8, false), 0x600);
        assert_eq!(map.set(key, 0x600, 2, 10, 8, false), 0x600);
        let loc = map.get(&key).unwrap();
        assert_eq!(loc.block_id, 1);
    }

    #[test]
    fn test_equal_timestamp_replaces_when_asked() {
        let map = LocMap::new();
        let key = ValueKey::new(1, 2);
        map.set(key, 0x600, 1, 0, 7, false);
        assert_eq!(map.set(key, 0x600, 2, 10, 7, true), 0x600);
        assert_eq!(map.get(&key).unwrap().block_id, 2);
    }

    #[test]
    fn test_winning_zero_block_removes() {
        let map = LocMap::new();
        let key = ValueKey::new(1, 2);
        map.set(key, 0x500, 1, 0, 7, false);
        assert_eq!(map.set(key, 0x600, 0, 0, 0, false), 0x500);
        assert!(map.get(&key).is_none());
        // Absent plus zero block stays absent.
        assert_eq!(map.set(key, 0x400, 0, 0, 0, false), 0);
        assert!(map.get(&key).is_none());
    }

    #[test]
    fn test_scan_range_and_masks() {
        let map = LocMap::new();
        for a in 0..10u64 {
            map.set(ValueKey::new(a << 60, a), 0x500 | ((a & 1) * TSB_DELETION), 1, 0, 3, false);
        }
        let mut seen = Vec::new();
        let complete = map.scan_callback(
            2 << 60,
            (6 << 60) | 0xff,
            0,
            TSB_DELETION,
            u64::MAX,
            u64::MAX,
            |key, _loc| {
                seen.push(key.a >> 60);
                true
            },
        );
        assert!(complete);
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 4, 6]);
    }

    #[test]
    fn test_scan_stops_at_max() {
        let map = LocMap::new();
        for a in 0..100u64 {
            map.set(ValueKey::new(a, a), 0x500, 1, 0, 3, false);
        }
        let mut count = 0;
        let complete = map.scan_callback(0, u64::MAX, 0, 0, u64::MAX, 10, |_k, _l| {
            count += 1;
            true
        });
        assert!(!complete);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_counts_skip_tombstones() {
        let map = LocMap::new();
        map.set(ValueKey::new(1, 1), 0x500, 1, 0, 10, false);
        map.set(ValueKey::new(2, 2), 0x500 | TSB_DELETION, 1, 0, 0, false);
        assert_eq!(map.counts(), (1, 10));
        assert_eq!(map.len(), 2);
    }
}
