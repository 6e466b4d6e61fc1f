//! SecVtx Core - Iterative Secondary-Vertex Finding
//!
//! Finds displaced decay and interaction vertices in a set of reconstructed
//! charged-particle tracks:
//! 1. **Seeding**: a seed finder proposes a position from the remaining pool
//! 2. **Fitting**: an adaptive fitter weights the screened tracks around it
//! 3. **Pruning**: compatible tracks leave the pool, weakly attached ones may
//!    be reassigned to a better vertex later
//! 4. **Classification**: V0 tagging, pointing and hit-pattern vetoes
//!
//! The numerical services (seed finder, fitter, impact-point estimator,
//! linearizer) are traits in [`services`]; the `secvtx_sim` crate ships
//! straight-line implementations and a deterministic event generator.

pub mod compatibility;
pub mod config;
pub mod error;
pub mod finder;
pub mod hit_pattern;
pub mod observer;
pub mod services;
pub mod track;
pub mod track_pool;
pub mod v0;
pub mod vertex;

// Re-export key types for convenience
pub use config::FinderConfig;
pub use error::VertexingError;
pub use finder::{FinderBuilder, FinderOutput, IterativeVertexFinder};
pub use observer::{IterationOutcome, IterationReport, NoopObserver, RejectReason, VertexingObserver};
pub use services::{
    ImpactPointEstimator, LinearizedTrack, LinearizedTrackFactory, ReferenceVertex, SeedFinder, TrackFilter,
    VertexFitter,
};
pub use track::{DetectorLayer, HitPattern, Perigee, Track, TrackId, TrackKey, TrackLink};
pub use vertex::{FittedVertex, SecondaryVertex, TrackAtVertex, VertexDecorations, VertexType};
