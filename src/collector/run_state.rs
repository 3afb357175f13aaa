use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::models::{CollectionMode, CollectionStatusReport, CollectionSummary};

/// Run state shared by scheduled and on-demand collection
///
/// At most one collection pass runs at a time. `try_begin` is the single
/// atomic check-and-set guarding that transition.
#[derive(Default)]
pub struct CollectionRunState {
    running: AtomicBool,
    current: Mutex<Option<(CollectionMode, Instant)>>,
    last_summary: Mutex<Option<CollectionSummary>>,
}

/// Held for the duration of a collection pass; marks the state idle on drop
pub struct RunGuard {
    state: Arc<CollectionRunState>,
}

impl CollectionRunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot, or `None` if a pass is already running
    pub fn try_begin(self: &Arc<Self>, mode: CollectionMode) -> Option<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        *self.current.lock() = Some((mode, Instant::now()));

        Some(RunGuard {
            state: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Keep the finished pass's summary for inspection
    pub fn record_summary(&self, summary: CollectionSummary) {
        *self.last_summary.lock() = Some(summary);
    }

    pub fn last_summary(&self) -> Option<CollectionSummary> {
        self.last_summary.lock().clone()
    }

    pub fn report(&self) -> CollectionStatusReport {
        let current = *self.current.lock();
        CollectionStatusReport {
            is_running: self.is_running(),
            current_mode: current.map(|(mode, _)| mode),
            elapsed: current.map(|(_, started)| started.elapsed()),
            last_run_summary: self.last_summary(),
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.state.current.lock() = None;
        self.state.running.store(false, Ordering::Release);
    }
}
