//! Finder configuration.
//!
//! Every field has a default, so a partial JSON document only needs to name
//! the options it overrides:
//!
//! ```
//! use secvtx_core::FinderConfig;
//!
//! let config: FinderConfig = serde_json::from_str(r#"{ "filter_level": 3 }"#).unwrap();
//! assert_eq!(config.filter_level, 3);
//! assert_eq!(config.max_vertices, 20);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::VertexingError;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables of the iterative secondary-vertex finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Strictness of the V0, pointing and hit-pattern vetoes (default: 0)
    ///
    /// - `>= 2`: reject candidates whose momentum points back to the primary
    /// - `>= 3`: reject V0-tagged candidates
    /// - `>= 5`: groom two-track candidates by hit-pattern consistency
    pub filter_level: u32,

    /// Max impact-distance significance for a track to join a seed's fit (default: 10.0)
    pub significance_cut_seeding: f64,

    /// Max compatibility for an unused track to be purged with a vertex (default: 36.0)
    pub max_compatibility_cut_seeding: f64,

    /// Fit weight above which a track counts as a full member (default: 0.02)
    pub min_track_weight_at_vtx: f64,

    /// Iteration cap and upper bound on the output size (default: 20)
    pub max_vertices: usize,

    /// Grooming score above which a candidate is discarded (default: 0.95)
    pub track_inner_outer_fraction: f64,

    /// Minimum momentum projection on the flight direction, in mm (default: -999.9)
    pub momentum_projection_on_direction: f64,

    /// Minimum vertex-vertex Mahalanobis distance that allows robbing at filter level >= 2 (default: 0.1)
    pub seeds_minimum_distance: f64,

    /// Route every n-th screened track into a split list instead of storing vertices (default: false)
    pub create_split_vertices: bool,

    /// The n used by split mode (default: 2)
    pub split_vertices_trk_inv_fraction: usize,

    /// Let new candidates rob loosely attached tracks from earlier vertices (default: true)
    pub reassign_tracks_after_first_fit: bool,

    /// Skip events with too many selected tracks (default: false)
    pub do_max_tracks_cut: bool,

    /// Threshold for `do_max_tracks_cut` (default: 5000)
    pub max_tracks: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            filter_level: 0,
            significance_cut_seeding: 10.0,
            max_compatibility_cut_seeding: 36.0, // 6 sigma
            min_track_weight_at_vtx: 0.02,
            max_vertices: 20,
            track_inner_outer_fraction: 0.95,
            momentum_projection_on_direction: -999.9, // effectively off
            seeds_minimum_distance: 0.1,
            create_split_vertices: false,
            split_vertices_trk_inv_fraction: 2,
            reassign_tracks_after_first_fit: true,
            do_max_tracks_cut: false,
            max_tracks: 5000,
        }
    }
}

impl FinderConfig {
    /// Reject values the finder cannot run with.
    pub fn validate(&self) -> Result<(), VertexingError> {
        if self.max_vertices == 0 {
            return Err(VertexingError::invalid_config("max_vertices must be positive"));
        }
        if self.split_vertices_trk_inv_fraction == 0 {
            return Err(VertexingError::invalid_config(
                "split_vertices_trk_inv_fraction must be positive",
            ));
        }
        if !(self.significance_cut_seeding >= 0.0) {
            return Err(VertexingError::invalid_config(
                "significance_cut_seeding must be non-negative",
            ));
        }
        if !(self.max_compatibility_cut_seeding >= 0.0) {
            return Err(VertexingError::invalid_config(
                "max_compatibility_cut_seeding must be non-negative",
            ));
        }
        if !(0.0..1.0).contains(&self.min_track_weight_at_vtx) {
            return Err(VertexingError::invalid_config(
                "min_track_weight_at_vtx must lie in [0, 1)",
            ));
        }
        if !(self.track_inner_outer_fraction >= 0.0) {
            return Err(VertexingError::invalid_config(
                "track_inner_outer_fraction must be non-negative",
            ));
        }
        if !(self.seeds_minimum_distance >= 0.0) {
            return Err(VertexingError::invalid_config(
                "seeds_minimum_distance must be non-negative",
            ));
        }
        Ok(())
    }
}
