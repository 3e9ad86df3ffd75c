//! The disk watcher.
//!
//! Polls free space and usage on the data and TOC devices once a minute,
//! automatically disabling writes when either crosses its disable
//! threshold and re-enabling them once both are comfortably back. An
//! automatic re-enable never overrides a user's own disable. A threshold of
//! 1 turns the respective check off.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::Disks;

use crate::keys::StoreKey;

use super::Store;

const WATCH_INTERVAL_SECS: u64 = 60;

pub(crate) fn launch<K: StoreKey>(store: &Arc<Store<K>>) {
    let weak = Arc::downgrade(store);
    std::thread::spawn(move || {
        let mut disabled = false;
        loop {
            std::thread::sleep(Duration::from_secs(WATCH_INTERVAL_SECS));
            let store = match weak.upgrade() {
                Some(store) => store,
                None => return,
            };
            let (free, usage) = match probe(&store.cfg.path) {
                Some(space) => space,
                None => continue,
            };
            let (free_toc, usage_toc) = if store.cfg.path_toc != store.cfg.path {
                match probe(&store.cfg.path_toc) {
                    Some(space) => space,
                    None => continue,
                }
            } else {
                (free, usage)
            };
            let cfg = &store.cfg;
            if disabled {
                let free_ok = cfg.free_reenable_threshold <= 1
                    || (free >= cfg.free_reenable_threshold
                        && free_toc >= cfg.free_reenable_threshold);
                let usage_ok = cfg.usage_reenable_threshold <= 1.0
                    || (usage <= cfg.usage_reenable_threshold
                        && usage_toc <= cfg.usage_reenable_threshold);
                if free_ok && usage_ok {
                    tracing::warn!("passed the free/usage threshold for automatic re-enabling");
                    store.set_writes_enabled(false);
                    disabled = false;
                }
            } else {
                let free_low = cfg.free_disable_threshold > 1
                    && (free <= cfg.free_disable_threshold
                        || free_toc <= cfg.free_disable_threshold);
                let usage_high = cfg.usage_disable_threshold > 1.0
                    && (usage >= cfg.usage_disable_threshold
                        || usage_toc >= cfg.usage_disable_threshold);
                if free_low || usage_high {
                    tracing::warn!("passed the free/usage threshold for automatic disabling");
                    store.set_writes_disabled(false);
                    disabled = true;
                }
            }
        }
    });
}

/// Free bytes and used percentage of the device holding `path`, matched by
/// the longest mount point prefix.
fn probe(path: &Path) -> Option<(u64, f32)> {
    let canonical = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let free = disk.available_space();
    let usage = (total - free) as f32 / total as f32 * 100.0;
    Some((free, usage))
}
