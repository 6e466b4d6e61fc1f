//! Diagnostic hooks.
//!
//! The finder reports every seed, screening result and iteration outcome to a
//! [`VertexingObserver`]. Nothing in the algorithm depends on what the
//! observer does with them.

use nalgebra::{Matrix3, Vector3};

use crate::track::TrackKey;
use crate::vertex::FitSummary;

/// A seed and the loose constraint built around it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedReport {
    pub iteration: usize,
    pub seed: Vector3<f64>,
    /// Seed constraint covariance, identity scaled by 1e8
    pub constraint_covariance: Matrix3<f64>,
    pub pool_size: usize,
}

/// Tracks selected around a seed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningReport {
    pub iteration: usize,
    pub fit_tracks: Vec<TrackKey>,
    pub split_tracks: Vec<TrackKey>,
}

/// Why a good fit was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    V0Veto,
    PointingBackwards,
    HitPattern,
    GroomedFitFailed,
    GroomedV0Veto,
}

impl RejectReason {
    pub fn name(&self) -> &'static str {
        match self {
            RejectReason::V0Veto => "v0_veto",
            RejectReason::PointingBackwards => "pointing_backwards",
            RejectReason::HitPattern => "hit_pattern",
            RejectReason::GroomedFitFailed => "groomed_fit_failed",
            RejectReason::GroomedV0Veto => "groomed_v0_veto",
        }
    }
}

/// How one loop iteration ended.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The seed finder returned its sentinel
    NoSeed,
    /// Screening kept no track
    EmptyFitList,
    BadFit(FitSummary),
    BadFitAfterReassignment(FitSummary),
    Rejected(RejectReason),
    Accepted { n_tracks: usize, robbed: usize },
    /// Good vertex, not stored because split mode is on
    Suppressed,
}

impl IterationOutcome {
    /// Outcomes that end the whole search.
    pub fn stops_search(&self) -> bool {
        matches!(self, IterationOutcome::NoSeed | IterationOutcome::EmptyFitList)
    }

    pub fn name(&self) -> &'static str {
        match self {
            IterationOutcome::NoSeed => "no_seed",
            IterationOutcome::EmptyFitList => "empty_fit_list",
            IterationOutcome::BadFit(_) => "bad_fit",
            IterationOutcome::BadFitAfterReassignment(_) => "bad_fit_after_reassignment",
            IterationOutcome::Rejected(reason) => reason.name(),
            IterationOutcome::Accepted { .. } => "accepted",
            IterationOutcome::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub outcome: IterationOutcome,
    /// Pool size after the iteration
    pub pool_size: usize,
}

pub trait VertexingObserver: Send + Sync {
    fn on_seed(&self, _report: &SeedReport) {}

    fn on_screening(&self, _report: &ScreeningReport) {}

    fn on_iteration(&self, _report: &IterationReport) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl VertexingObserver for NoopObserver {}
