//! Store configuration.
//!
//! Every knob can be set in code or through an environment variable named
//! `<PREFIX>_<NAME>` where the prefix is `VALUESTORE` or `GROUPSTORE`
//! depending on the variant (e.g. `VALUESTORE_PAGE_SIZE`). Resolution order:
//! the environment overrides the struct, then zero values take their
//! defaults, then clamps apply. A zero value always means "use the default";
//! where a check can be turned off entirely, the sentinel is documented on
//! the field.

use std::path::PathBuf;

use crate::keys::StoreKey;
use crate::storefile::FILE_HEADER_SIZE;

// The larger of the two variant trailers, for the file-cap floor.
const FILE_TRAILER_SIZE_MAX: u32 = 16;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory for data files; TOC files land here too unless `path_toc`
    /// is set. Defaults to the current directory.
    pub path: PathBuf,

    /// Directory for TOC files. Defaults to `path`.
    pub path_toc: PathBuf,

    /// Maximum bytes for any single value (default: 1,048,576).
    pub value_cap: u32,

    /// Minimum seconds between starts of background passes (default: 60).
    pub background_interval: u32,

    /// Worker threads for the write pipeline, recovery and background tasks
    /// (default: available parallelism).
    pub workers: usize,

    /// Bytes written to a file before a 4-byte checksum is embedded
    /// (default: 65,532).
    pub checksum_interval: u32,

    /// Size of each reusable write buffer (default: 4,194,304; clamped so a
    /// full page always pushes at least one checksum interval to disk).
    pub page_size: u32,

    /// Write buffers allocated per worker (default: 3).
    pub write_pages_per_worker: usize,

    /// Maximum bytes for outgoing messages (default: 16,777,216).
    pub msg_cap: usize,

    /// Milliseconds an outgoing message may stay pending before it is
    /// dropped (default: 100).
    pub msg_timeout: u64,

    /// Bytes a file may reach before it is closed and a new one opened
    /// (default: u32::MAX).
    pub file_cap: u32,

    /// Open read descriptors per file (default: `workers`).
    pub file_readers: usize,

    /// TOC entries applied per batch during startup recovery
    /// (default: 1,048,576).
    pub recovery_batch_size: usize,

    /// Seconds between tombstone discard passes (default:
    /// `background_interval`).
    pub tombstone_discard_interval: u32,

    /// Tombstones collected per pause while scanning for expired ones
    /// (default: 1,048,576).
    pub tombstone_discard_batch_size: usize,

    /// Seconds a deletion marker is kept so replication can propagate it
    /// (default: 14,400).
    pub tombstone_age: u32,

    /// Seconds a record must age before replication considers it
    /// (default: 60).
    pub replication_ignore_recent: u32,

    pub out_pull_replication_interval: u32,
    pub out_pull_replication_workers: usize,
    pub out_pull_replication_msgs: usize,
    /// Keys the pull-replication bloom filter is sized for
    /// (default: 1,000,000).
    pub out_pull_replication_bloom_n: u64,
    /// Target bloom false-positive rate (default: 0.001).
    pub out_pull_replication_bloom_p: f64,
    pub out_pull_replication_msg_timeout: u64,

    pub in_pull_replication_workers: usize,
    pub in_pull_replication_msgs: usize,
    pub in_pull_replication_response_msg_timeout: u64,

    pub out_push_replication_interval: u32,
    pub out_push_replication_workers: usize,
    pub out_push_replication_msgs: usize,
    pub out_push_replication_msg_timeout: u64,

    /// Maximum bytes for bulk-set messages (default: `msg_cap`).
    pub bulk_set_msg_cap: usize,
    pub out_bulk_set_msgs: usize,
    pub in_bulk_set_workers: usize,
    pub in_bulk_set_msgs: usize,
    pub in_bulk_set_response_msg_timeout: u64,

    /// Maximum bytes for bulk-set-ack messages (default: `msg_cap`).
    pub bulk_set_ack_msg_cap: usize,
    pub in_bulk_set_ack_workers: usize,
    pub in_bulk_set_ack_msgs: usize,
    pub out_bulk_set_ack_msgs: usize,

    pub compaction_interval: u32,
    pub compaction_workers: usize,
    /// Stale fraction a file may accumulate before compaction rewrites it
    /// (default: 0.10).
    pub compaction_threshold: f64,
    /// Seconds a file must age before compaction considers it
    /// (default: 300).
    pub compaction_age_threshold: u32,

    /// Free bytes under which writes are automatically disabled
    /// (default: 8,589,934,592; 1 disables the check).
    pub free_disable_threshold: u64,
    /// Free bytes above which automatically disabled writes are re-enabled
    /// (default: 17,179,869,184; 1 disables the check).
    pub free_reenable_threshold: u64,
    /// Used percentage over which writes are automatically disabled
    /// (default: 95; 1 disables the check).
    pub usage_disable_threshold: f32,
    /// Used percentage under which automatically disabled writes are
    /// re-enabled (default: 90; 1 disables the check).
    pub usage_reenable_threshold: f32,

    /// Modification count under which the once-a-minute flusher calls
    /// `flush` (default: entries that fill one page; negative disables).
    pub flusher_threshold: i32,

    /// Seconds between audit passes (default: 604,800).
    pub audit_interval: u32,
    /// Seconds a file must age before audit considers it
    /// (default: 604,800).
    pub audit_age_threshold: u32,

    /// Seed for the shared jitter/shuffle RNG; defaults to entropy.
    pub rand_seed: Option<u64>,

    /// Derived: smallest value allocation that keeps a full TOC page's worth
    /// of entries backed by at least one checksum interval of data.
    pub(crate) min_value_alloc: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            path_toc: PathBuf::new(),
            value_cap: 0,
            background_interval: 0,
            workers: 0,
            checksum_interval: 0,
            page_size: 0,
            write_pages_per_worker: 0,
            msg_cap: 0,
            msg_timeout: 0,
            file_cap: 0,
            file_readers: 0,
            recovery_batch_size: 0,
            tombstone_discard_interval: 0,
            tombstone_discard_batch_size: 0,
            tombstone_age: 0,
            replication_ignore_recent: 0,
            out_pull_replication_interval: 0,
            out_pull_replication_workers: 0,
            out_pull_replication_msgs: 0,
            out_pull_replication_bloom_n: 0,
            out_pull_replication_bloom_p: 0.0,
            out_pull_replication_msg_timeout: 0,
            in_pull_replication_workers: 0,
            in_pull_replication_msgs: 0,
            in_pull_replication_response_msg_timeout: 0,
            out_push_replication_interval: 0,
            out_push_replication_workers: 0,
            out_push_replication_msgs: 0,
            out_push_replication_msg_timeout: 0,
            bulk_set_msg_cap: 0,
            out_bulk_set_msgs: 0,
            in_bulk_set_workers: 0,
            in_bulk_set_msgs: 0,
            in_bulk_set_response_msg_timeout: 0,
            bulk_set_ack_msg_cap: 0,
            in_bulk_set_ack_workers: 0,
            in_bulk_set_ack_msgs: 0,
            out_bulk_set_ack_msgs: 0,
            compaction_interval: 0,
            compaction_workers: 0,
            compaction_threshold: 0.0,
            compaction_age_threshold: 0,
            free_disable_threshold: 0,
            free_reenable_threshold: 0,
            usage_disable_threshold: 0.0,
            usage_reenable_threshold: 0.0,
            flusher_threshold: 0,
            audit_interval: 0,
            audit_age_threshold: 0,
            rand_seed: None,
            min_value_alloc: 0,
        }
    }
}

fn env_string(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{name}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(prefix: &str, name: &str) -> Option<T> {
    env_string(prefix, name).and_then(|v| v.parse().ok())
}

macro_rules! env_override {
    ($cfg:ident, $prefix:ident, $($field:ident => $name:literal),+ $(,)?) => {
        $(if let Some(val) = env_parse($prefix, $name) {
            $cfg.$field = val;
        })+
    };
}

impl StoreConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the TOC directory.
    pub fn path_toc(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_toc = path.into();
        self
    }

    /// Set the worker thread count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the checksum interval.
    pub fn checksum_interval(mut self, interval: u32) -> Self {
        self.checksum_interval = interval;
        self
    }

    /// Set the write buffer size.
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the file rollover size.
    pub fn file_cap(mut self, cap: u32) -> Self {
        self.file_cap = cap;
        self
    }

    /// Set the value size cap.
    pub fn value_cap(mut self, cap: u32) -> Self {
        self.value_cap = cap;
        self
    }

    /// Applies the environment, fills defaults, and clamps everything into
    /// the ranges the engine relies on.
    pub fn resolve<K: StoreKey>(&self) -> StoreConfig {
        let mut cfg = self.clone();
        let prefix = K::ENV_PREFIX;
        if let Some(path) = env_string(prefix, "PATH") {
            cfg.path = PathBuf::from(path);
        }
        if cfg.path.as_os_str().is_empty() {
            cfg.path = PathBuf::from(".");
        }
        if let Some(path) = env_string(prefix, "PATH_TOC") {
            cfg.path_toc = PathBuf::from(path);
        }
        if cfg.path_toc.as_os_str().is_empty() {
            cfg.path_toc = cfg.path.clone();
        }
        env_override!(cfg, prefix,
            value_cap => "VALUE_CAP",
            background_interval => "BACKGROUND_INTERVAL",
            workers => "WORKERS",
            checksum_interval => "CHECKSUM_INTERVAL",
            page_size => "PAGE_SIZE",
            write_pages_per_worker => "WRITE_PAGES_PER_WORKER",
            msg_cap => "MSG_CAP",
            msg_timeout => "MSG_TIMEOUT",
            file_cap => "FILE_CAP",
            file_readers => "FILE_READERS",
            recovery_batch_size => "RECOVERY_BATCH_SIZE",
            tombstone_discard_interval => "TOMBSTONE_DISCARD_INTERVAL",
            tombstone_discard_batch_size => "TOMBSTONE_DISCARD_BATCH_SIZE",
            tombstone_age => "TOMBSTONE_AGE",
            replication_ignore_recent => "REPLICATION_IGNORE_RECENT",
            out_pull_replication_interval => "OUT_PULL_REPLICATION_INTERVAL",
            out_pull_replication_workers => "OUT_PULL_REPLICATION_WORKERS",
            out_pull_replication_msgs => "OUT_PULL_REPLICATION_MSGS",
            out_pull_replication_bloom_n => "OUT_PULL_REPLICATION_BLOOM_N",
            out_pull_replication_bloom_p => "OUT_PULL_REPLICATION_BLOOM_P",
            out_pull_replication_msg_timeout => "OUT_PULL_REPLICATION_MSG_TIMEOUT",
            in_pull_replication_workers => "IN_PULL_REPLICATION_WORKERS",
            in_pull_replication_msgs => "IN_PULL_REPLICATION_MSGS",
            in_pull_replication_response_msg_timeout => "IN_PULL_REPLICATION_RESPONSE_MSG_TIMEOUT",
            out_push_replication_interval => "OUT_PUSH_REPLICATION_INTERVAL",
            out_push_replication_workers => "OUT_PUSH_REPLICATION_WORKERS",
            out_push_replication_msgs => "OUT_PUSH_REPLICATION_MSGS",
            out_push_replication_msg_timeout => "OUT_PUSH_REPLICATION_MSG_TIMEOUT",
            bulk_set_msg_cap => "BULK_SET_MSG_CAP",
            out_bulk_set_msgs => "OUT_BULK_SET_MSGS",
            in_bulk_set_workers => "IN_BULK_SET_WORKERS",
            in_bulk_set_msgs => "IN_BULK_SET_MSGS",
            in_bulk_set_response_msg_timeout => "IN_BULK_SET_RESPONSE_MSG_TIMEOUT",
            bulk_set_ack_msg_cap => "OUT_BULK_SET_ACK_MSG_CAP",
            in_bulk_set_ack_workers => "IN_BULK_SET_ACK_WORKERS",
            in_bulk_set_ack_msgs => "IN_BULK_SET_ACK_MSGS",
            out_bulk_set_ack_msgs => "OUT_BULK_SET_ACK_MSGS",
            compaction_interval => "COMPACTION_INTERVAL",
            compaction_workers => "COMPACTION_WORKERS",
            compaction_threshold => "COMPACTION_THRESHOLD",
            compaction_age_threshold => "COMPACTION_AGE_THRESHOLD",
            free_disable_threshold => "FREE_DISABLE_THRESHOLD",
            free_reenable_threshold => "FREE_REENABLE_THRESHOLD",
            usage_disable_threshold => "USAGE_DISABLE_THRESHOLD",
            usage_reenable_threshold => "USAGE_REENABLE_THRESHOLD",
            flusher_threshold => "FLUSHER_THRESHOLD",
            audit_interval => "AUDIT_INTERVAL",
            audit_age_threshold => "AUDIT_AGE_THRESHOLD",
        );

        let toc_entry = K::TOC_ENTRY_LEN as u32;
        // Absolute page floor: the header leader plus at least one TOC entry.
        let page_size_min = FILE_HEADER_SIZE + toc_entry;

        if cfg.value_cap == 0 {
            cfg.value_cap = 1_048_576;
        }
        cfg.value_cap = cfg.value_cap.min(1_048_576);
        if cfg.background_interval == 0 {
            cfg.background_interval = 60;
        }
        if cfg.workers == 0 {
            cfg.workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        }
        if cfg.checksum_interval == 0 {
            cfg.checksum_interval = 64 * 1024 - 4;
        }
        cfg.checksum_interval = cfg.checksum_interval.max(FILE_HEADER_SIZE);
        if cfg.page_size == 0 {
            cfg.page_size = 4 * 1024 * 1024;
        }
        // Each full page must push at least the previous page's worth of
        // bytes through a checksum interval.
        cfg.page_size = cfg
            .page_size
            .max(cfg.value_cap.saturating_add(cfg.checksum_interval))
            .max(page_size_min)
            .min(u32::MAX - 1);
        cfg.min_value_alloc = cfg.checksum_interval / (cfg.page_size / toc_entry + 1) + 1;
        if cfg.write_pages_per_worker == 0 {
            cfg.write_pages_per_worker = 3;
        }
        cfg.write_pages_per_worker = cfg.write_pages_per_worker.max(2);
        if cfg.msg_cap == 0 {
            cfg.msg_cap = 16 * 1024 * 1024;
        }
        // Must cover the largest minimum message size of all three types.
        cfg.msg_cap = cfg.msg_cap.max(1024);
        if cfg.msg_timeout == 0 {
            cfg.msg_timeout = 100;
        }
        if cfg.file_cap == 0 {
            cfg.file_cap = u32::MAX;
        }
        cfg.file_cap = cfg
            .file_cap
            .max(FILE_HEADER_SIZE + FILE_TRAILER_SIZE_MAX + cfg.value_cap);
        if cfg.file_readers == 0 {
            cfg.file_readers = cfg.workers;
        }
        if cfg.recovery_batch_size == 0 {
            cfg.recovery_batch_size = 1024 * 1024;
        }
        if cfg.tombstone_discard_interval == 0 {
            cfg.tombstone_discard_interval = cfg.background_interval;
        }
        if cfg.tombstone_discard_batch_size == 0 {
            cfg.tombstone_discard_batch_size = 1024 * 1024;
        }
        if cfg.tombstone_age == 0 {
            cfg.tombstone_age = 4 * 60 * 60;
        }
        if cfg.replication_ignore_recent == 0 {
            cfg.replication_ignore_recent = 60;
        }
        if cfg.out_pull_replication_interval == 0 {
            cfg.out_pull_replication_interval = cfg.background_interval;
        }
        if cfg.out_pull_replication_workers == 0 {
            cfg.out_pull_replication_workers = cfg.workers;
        }
        if cfg.out_pull_replication_msgs == 0 {
            cfg.out_pull_replication_msgs = cfg.out_pull_replication_workers * 4;
        }
        if cfg.out_pull_replication_bloom_n == 0 {
            cfg.out_pull_replication_bloom_n = 1_000_000;
        }
        if cfg.out_pull_replication_bloom_p == 0.0 {
            cfg.out_pull_replication_bloom_p = 0.001;
        }
        cfg.out_pull_replication_bloom_p = cfg.out_pull_replication_bloom_p.max(0.000001);
        if cfg.out_pull_replication_msg_timeout == 0 {
            cfg.out_pull_replication_msg_timeout = cfg.msg_timeout;
        }
        if cfg.in_pull_replication_workers == 0 {
            cfg.in_pull_replication_workers = cfg.workers;
        }
        if cfg.in_pull_replication_msgs == 0 {
            cfg.in_pull_replication_msgs = cfg.in_pull_replication_workers * 4;
        }
        if cfg.in_pull_replication_response_msg_timeout == 0 {
            cfg.in_pull_replication_response_msg_timeout = cfg.msg_timeout;
        }
        if cfg.out_push_replication_interval == 0 {
            cfg.out_push_replication_interval = cfg.background_interval;
        }
        if cfg.out_push_replication_workers == 0 {
            cfg.out_push_replication_workers = cfg.workers;
        }
        if cfg.out_push_replication_msgs == 0 {
            cfg.out_push_replication_msgs = cfg.out_push_replication_workers * 4;
        }
        if cfg.out_push_replication_msg_timeout == 0 {
            cfg.out_push_replication_msg_timeout = cfg.msg_timeout;
        }
        if cfg.bulk_set_msg_cap == 0 {
            cfg.bulk_set_msg_cap = cfg.msg_cap;
        }
        if cfg.out_bulk_set_msgs == 0 {
            cfg.out_bulk_set_msgs = cfg.out_push_replication_workers * 4;
        }
        if cfg.in_bulk_set_workers == 0 {
            cfg.in_bulk_set_workers = cfg.workers;
        }
        if cfg.in_bulk_set_msgs == 0 {
            cfg.in_bulk_set_msgs = cfg.in_bulk_set_workers * 4;
        }
        if cfg.in_bulk_set_response_msg_timeout == 0 {
            cfg.in_bulk_set_response_msg_timeout = cfg.msg_timeout;
        }
        if cfg.bulk_set_ack_msg_cap == 0 {
            cfg.bulk_set_ack_msg_cap = cfg.msg_cap;
        }
        if cfg.in_bulk_set_ack_workers == 0 {
            cfg.in_bulk_set_ack_workers = cfg.workers;
        }
        if cfg.in_bulk_set_ack_msgs == 0 {
            cfg.in_bulk_set_ack_msgs = cfg.in_bulk_set_ack_workers * 4;
        }
        if cfg.out_bulk_set_ack_msgs == 0 {
            cfg.out_bulk_set_ack_msgs = cfg.in_bulk_set_workers * 4;
        }
        if cfg.compaction_interval == 0 {
            cfg.compaction_interval = cfg.background_interval;
        }
        if cfg.compaction_workers == 0 {
            cfg.compaction_workers = cfg.workers;
        }
        if cfg.compaction_threshold == 0.0
            || cfg.compaction_threshold >= 1.0
            || cfg.compaction_threshold <= 0.01
        {
            cfg.compaction_threshold = 0.10;
        }
        if cfg.compaction_age_threshold == 0 {
            cfg.compaction_age_threshold = 300;
        }
        // A value of 1 disables the respective check.
        if cfg.free_disable_threshold == 0 {
            cfg.free_disable_threshold = 8_589_934_592;
        }
        if cfg.free_reenable_threshold == 0 {
            cfg.free_reenable_threshold = 17_179_869_184;
        }
        if cfg.usage_disable_threshold == 0.0 {
            cfg.usage_disable_threshold = 95.0;
        }
        cfg.usage_disable_threshold = cfg.usage_disable_threshold.max(0.0);
        if cfg.usage_reenable_threshold == 0.0 {
            cfg.usage_reenable_threshold = 90.0;
        }
        cfg.usage_reenable_threshold = cfg.usage_reenable_threshold.max(0.0);
        if cfg.flusher_threshold == 0 {
            cfg.flusher_threshold = (cfg.page_size / toc_entry) as i32;
        }
        cfg.flusher_threshold = cfg.flusher_threshold.max(0);
        if cfg.audit_interval == 0 {
            cfg.audit_interval = 604_800;
        }
        if cfg.audit_age_threshold == 0 {
            cfg.audit_age_threshold = 604_800;
        }
        cfg
    }
}
