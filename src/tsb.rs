//! Packed timestamp bits.
//!
//! Every record carries a single 64-bit field holding the microsecond wall
//! clock in the upper bits and a handful of utility flags in the low byte.
//! Records compete purely on this field: the larger value wins, equal values
//! are idempotent.

use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for flags; the ordering timestamp is
/// `tsb >> TSB_UTIL_BITS`.
pub const TSB_UTIL_BITS: u32 = 8;

/// The record is a tombstone; its value length is 0.
pub const TSB_DELETION: u64 = 1 << 7;

/// A local-only tombstone created while reconciling replication; never itself
/// replicated.
pub const TSB_LOCAL_REMOVAL: u64 = 1 << 6;

/// Lets compaction replace an identical-timestamp location without violating
/// monotonicity. Stripped before the location map is updated.
pub const TSB_COMPACTION_REWRITE: u64 = 1 << 5;

/// Timestamp bits for the current wall clock with no flags set.
pub fn timestamp_bits_now() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    micros << TSB_UTIL_BITS
}

/// The ordering timestamp (microseconds) inside a packed field.
pub fn unix_micros(tsb: u64) -> u64 {
    tsb >> TSB_UTIL_BITS
}

/// A span of seconds expressed in timestamp-bit space, for cutoff
/// arithmetic against packed fields.
pub fn seconds_to_bits(seconds: u64) -> u64 {
    (seconds * 1_000_000) << TSB_UTIL_BITS
}

pub fn is_deletion(tsb: u64) -> bool {
    tsb & TSB_DELETION != 0
}

pub fn is_local_removal(tsb: u64) -> bool {
    tsb & TSB_LOCAL_REMOVAL != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_timestamp() {
        let tsb = (12345u64 << TSB_UTIL_BITS) | TSB_DELETION;
        assert_eq!(unix_micros(tsb), 12345);
        assert!(is_deletion(tsb));
        assert!(!is_local_removal(tsb));
    }

    #[test]
    fn test_now_has_clear_flags() {
        let tsb = timestamp_bits_now();
        assert_eq!(tsb & ((1 << TSB_UTIL_BITS) - 1), 0);
        assert!(unix_micros(tsb) > 0);
    }
}
