//! The idle flusher.
//!
//! Once a minute, if the store saw some writes but fewer than the
//! threshold, everything pending is flushed to disk. Nearly idle stores thus
//! never leave their last few modifications sitting only in memory, while
//! busy stores keep pushing pages out through volume alone.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::background::launcher_loop;
use crate::keys::StoreKey;

use super::Store;

const FLUSHER_INTERVAL_SECS: u64 = 60;

impl<K: StoreKey> Store<K> {
    /// Resumes the once-a-minute idle flusher.
    pub fn enable_flusher(self: &Arc<Self>) {
        let store = self.clone();
        self.flusher_bg.enable(move |rx| {
            std::thread::spawn(move || {
                let interval = Duration::from_secs(FLUSHER_INTERVAL_SECS);
                launcher_loop("flusher", interval, &store.rng, rx, |_notify_rx| {
                    let modifications = store.modifications.load(Ordering::Relaxed);
                    store.modifications.fetch_sub(modifications, Ordering::Relaxed);
                    if modifications > 0 && modifications < store.cfg.flusher_threshold {
                        tracing::debug!(
                            modifications,
                            threshold = store.cfg.flusher_threshold,
                            "flusher: modifications under threshold; flushing"
                        );
                        store.flush();
                    }
                    None
                });
            });
        });
    }

    /// Stops the idle flusher until re-enabled.
    pub fn disable_flusher(&self) {
        self.flusher_bg.disable();
    }
}
