//! Observer that keeps the finder's diagnostics for export.

use std::sync::{Mutex, MutexGuard};

use nalgebra::Vector3;
use secvtx_core::observer::{ScreeningReport, SeedReport};
use secvtx_core::{IterationOutcome, IterationReport, VertexingObserver};

/// Records seeds, pool sizes and outcomes of every iteration.
///
/// Call [`take`](Self::take) between events to split the record.
#[derive(Debug, Default)]
pub struct SeedRecorder {
    inner: Mutex<Recording>,
}

/// Everything recorded since the last [`SeedRecorder::take`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    pub seeds: Vec<Vector3<f64>>,

    /// Pool size after each iteration
    pub pool_sizes: Vec<usize>,

    pub outcomes: Vec<IterationOutcome>,

    /// Tracks routed to split lists
    pub split_tracks: usize,
}

impl SeedRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn take(&self) -> Recording {
        std::mem::take(&mut *self.lock())
    }
}

impl VertexingObserver for SeedRecorder {
    fn on_seed(&self, report: &SeedReport) {
        self.lock().seeds.push(report.seed);
    }

    fn on_screening(&self, report: &ScreeningReport) {
        self.lock().split_tracks += report.split_tracks.len();
    }

    fn on_iteration(&self, report: &IterationReport) {
        let mut recorded = self.lock();
        recorded.pool_sizes.push(report.pool_size);
        recorded.outcomes.push(report.outcome.clone());
    }
}
