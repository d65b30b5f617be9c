//! The active-iteration registry.
//!
//! Every iteration handed out by a connection is registered with a weak
//! handle, its explicit-close marker, and the creation site of the caller.
//! `close()` on the connection force-closes whatever is still live, warning
//! per leftover iteration. A sweep with a doubling interval prunes entries
//! whose iteration was dropped without an explicit close and logs the
//! abandonment; when a sweep finds nothing to prune while iterations stay
//! active, the interval doubles up to a ceiling.
//!
//! The registry never blocks iteration progress: it holds weak references
//! only, and resources themselves are released deterministically when the
//! iteration closes or drops.

use parking_lot::Mutex;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stratum_db_core::{ForceCloseable, MAX_LEAK_COLLECTION_INTERVAL_MS};
use tracing::warn;

struct Entry {
    handle: Weak<dyn ForceCloseable>,
    closed: Arc<AtomicBool>,
    site: &'static Location<'static>,
}

struct SweepState {
    interval: Duration,
    last: Instant,
}

pub(crate) struct IterationRegistry {
    track_sites: bool,
    entries: Mutex<Vec<Entry>>,
    sweep: Mutex<SweepState>,
}

impl IterationRegistry {
    pub(crate) fn new(track_sites: bool, initial_interval_ms: u64) -> Self {
        IterationRegistry {
            track_sites,
            entries: Mutex::new(Vec::new()),
            sweep: Mutex::new(SweepState {
                interval: Duration::from_millis(initial_interval_ms),
                last: Instant::now(),
            }),
        }
    }

    /// Register a live iteration. Opportunistically sweeps abandoned ones.
    pub(crate) fn register(
        &self,
        handle: Weak<dyn ForceCloseable>,
        closed: Arc<AtomicBool>,
        site: &'static Location<'static>,
    ) {
        self.sweep_if_due();
        self.entries.lock().push(Entry {
            handle,
            closed,
            site,
        });
    }

    /// True when any registered iteration is still live and unclosed
    pub(crate) fn has_active(&self) -> bool {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.handle.strong_count() > 0);
        entries
            .iter()
            .any(|entry| !entry.closed.load(Ordering::Acquire))
    }

    /// Force-close every live iteration, warning per leftover. Called by
    /// `Connection::close()`.
    pub(crate) fn force_close_all(&self) {
        let drained: Vec<Entry> = std::mem::take(&mut *self.entries.lock());
        for entry in drained {
            if let Some(handle) = entry.handle.upgrade() {
                if !entry.closed.load(Ordering::Acquire) {
                    self.warn_unclosed("forced closing of unclosed iteration", entry.site);
                }
                handle.force_close();
            }
        }
    }

    /// Prune entries whose iteration was dropped without close, logging the
    /// abandonment. Doubles the interval when nothing was pruned while
    /// iterations stay registered.
    fn sweep_if_due(&self) {
        {
            let sweep = self.sweep.lock();
            if sweep.last.elapsed() < sweep.interval {
                return;
            }
        }
        let mut pruned = 0usize;
        let remaining;
        {
            let mut entries = self.entries.lock();
            entries.retain(|entry| {
                if entry.handle.strong_count() > 0 {
                    return true;
                }
                if !entry.closed.load(Ordering::Acquire) {
                    self.warn_unclosed("iteration abandoned without close", entry.site);
                }
                pruned += 1;
                false
            });
            remaining = entries.len();
        }
        let mut sweep = self.sweep.lock();
        sweep.last = Instant::now();
        if pruned == 0 && remaining > 0 {
            let doubled = sweep.interval.saturating_mul(2);
            let ceiling = Duration::from_millis(MAX_LEAK_COLLECTION_INTERVAL_MS);
            sweep.interval = doubled.min(ceiling);
        }
    }

    fn warn_unclosed(&self, message: &str, site: &'static Location<'static>) {
        if self.track_sites {
            warn!(site = %site, "{}", message);
        } else {
            warn!(
                "{}; enable track_resource_sites to record creation sites",
                message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_db_core::CloseableIter;

    fn registry() -> IterationRegistry {
        IterationRegistry::new(true, 10_000)
    }

    #[track_caller]
    fn register(reg: &IterationRegistry, iter: &CloseableIter<u32>) {
        reg.register(
            Arc::downgrade(&iter.handle()),
            iter.close_marker(),
            Location::caller(),
        );
    }

    #[test]
    fn test_has_active_tracks_close() {
        let reg = registry();
        let mut iter = CloseableIter::from_vec(vec![1, 2]);
        register(&reg, &iter);
        assert!(reg.has_active());

        iter.close().unwrap();
        assert!(!reg.has_active());
    }

    #[test]
    fn test_has_active_prunes_dropped() {
        let reg = registry();
        {
            let iter = CloseableIter::from_vec(vec![1]);
            register(&reg, &iter);
        }
        assert!(!reg.has_active());
    }

    #[test]
    fn test_force_close_all_interrupts_live_iterations() {
        let reg = registry();
        let mut iter = CloseableIter::from_vec(vec![1, 2]);
        register(&reg, &iter);

        reg.force_close_all();
        assert!(iter.next().is_err());
        assert!(!reg.has_active());
    }
}
