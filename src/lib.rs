//! Emberstore: a replicated, append-only key-value storage engine.
//!
//! Values are durably persisted in append-only data files paired with
//! table-of-contents files, both framed with embedded murmur3 checksums. An
//! in-memory location map resolves every key to its current bytes under
//! last-writer-wins timestamp semantics; recovery rebuilds the map by
//! replaying the TOC files. Background passes compact stale file space,
//! audit on-disk checksums, and replicate data across a partition ring via
//! stateless bulk-set, bulk-set-ack, and pull-replication messages.
//!
//! Two variants share the engine: [`ValueStore`] keys records by a 128-bit
//! `(key_a, key_b)` pair, [`GroupStore`] adds a 256-bit member name so one
//! group can hold many named entries.

mod background;
mod bloom;
mod checksum;
mod config;
mod error;
mod keys;
mod locmap;
mod memblock;
mod msgs;
mod ring;
mod store;
mod storefile;
mod tsb;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use keys::{GroupKey, StoreKey, ValueKey};
pub use ring::{Msg, MsgHandler, MsgRing, Ring};
pub use store::{Stats, Store};
pub use tsb::{
    is_deletion, is_local_removal, timestamp_bits_now, unix_micros, TSB_COMPACTION_REWRITE,
    TSB_DELETION, TSB_LOCAL_REMOVAL, TSB_UTIL_BITS,
};

/// The value variant: 128-bit keys.
pub type ValueStore = Store<ValueKey>;

/// The group variant: 256-bit keys mapping groups to named members.
pub type GroupStore = Store<GroupKey>;
