//! Vertex types: raw fitter output, in-flight candidates and the persisted
//! output vertices.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::track::{Perigee, TrackId, TrackKey};

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Classification tag of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VertexType {
    #[default]
    Unclassified,
    NoVtx,
    KinkVtx,
    SecVtx,
    V0Vtx,
}

impl VertexType {
    pub fn name(&self) -> &'static str {
        match self {
            VertexType::Unclassified => "unclassified",
            VertexType::NoVtx => "no_vtx",
            VertexType::KinkVtx => "kink_vtx",
            VertexType::SecVtx => "sec_vtx",
            VertexType::V0Vtx => "v0_vtx",
        }
    }
}

// ============================================================================
// FITTER OUTPUT
// ============================================================================

/// One track as seen by a fitted vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackAtVertex {
    pub key: TrackKey,

    /// Adaptive-fit weight in [0, 1]
    pub weight: f64,

    /// Track parameters refitted with the vertex constraint
    pub perigee_at_vertex: Option<Perigee>,
}

/// What a [`VertexFitter`](crate::services::VertexFitter) returns.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedVertex {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    pub chi2: f64,
    pub ndof: f64,
    pub tracks: Vec<TrackAtVertex>,
}

impl FittedVertex {
    /// chi2/ndof, or infinity for a fit without degrees of freedom.
    pub fn reduced_chi2(&self) -> f64 {
        if self.ndof > 0.0 {
            self.chi2 / self.ndof
        } else {
            f64::INFINITY
        }
    }

    /// Tracks whose weight exceeds `min_weight`.
    pub fn full_members(&self, min_weight: f64) -> impl Iterator<Item = &TrackAtVertex> {
        self.tracks.iter().filter(move |t| t.weight > min_weight)
    }

    pub fn count_full_members(&self, min_weight: f64) -> usize {
        self.full_members(min_weight).count()
    }

    pub fn contains(&self, key: TrackKey) -> bool {
        self.tracks.iter().any(|t| t.key == key)
    }

    /// Remove a track from the vertex, returning it if it was attached.
    pub fn detach(&mut self, key: TrackKey) -> Option<TrackAtVertex> {
        let pos = self.tracks.iter().position(|t| t.key == key)?;
        Some(self.tracks.remove(pos))
    }

    /// Refitted momenta of the full members.
    ///
    /// A member without a refitted perigee contributes nothing.
    pub fn momenta(&self, min_weight: f64) -> Vec<Vector3<f64>> {
        self.full_members(min_weight)
            .filter_map(|t| match &t.perigee_at_vertex {
                Some(perigee) => Some(perigee.momentum()),
                None => {
                    debug!("Track {:?} has no refitted perigee, skipping its momentum", t.key);
                    None
                }
            })
            .collect()
    }
}

/// Per-fit scratch values the finder decides on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    pub ndof: f64,
    pub n_tracks: usize,
}

impl FitSummary {
    /// Summarize a fit; a missing fit reports `ndof = -3` and no tracks.
    pub fn of(fit: Option<&FittedVertex>, min_weight: f64) -> Self {
        match fit {
            Some(vertex) => Self {
                ndof: vertex.ndof,
                n_tracks: vertex.count_full_members(min_weight),
            },
            None => Self {
                ndof: -3.0,
                n_tracks: 0,
            },
        }
    }

    /// `ndof > 0` with at least two full members.
    pub fn is_good(&self) -> bool {
        self.ndof > 0.0 && self.n_tracks >= 2
    }
}

// ============================================================================
// DECORATIONS
// ============================================================================

/// Typed scalar decorations carried by every accepted vertex.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VertexDecorations {
    /// Pion-hypothesis invariant mass (MeV)
    pub mass: Option<f64>,

    /// Summed pion-hypothesis energy (MeV)
    pub energy: Option<f64>,

    /// Momentum sum projected on the flight direction (mm)
    pub direction: Option<f64>,

    /// Hit-pattern grooming score, 0 when grooming did not run
    pub hits_filter: f64,

    /// Size of the pool the candidate was screened from
    pub input_tracks: usize,

    /// Number of tracks other vertices robbed from this one
    pub robbed: u32,

    /// Full-member count
    pub num_tracks: usize,

    /// Sum of refitted pT² over linked tracks (GeV²)
    pub sum_pt2: f64,
}

/// A vertex owned by the finder while an event is processed.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateVertex {
    pub fit: FittedVertex,
    pub vertex_type: VertexType,
    pub decorations: VertexDecorations,
}

impl CandidateVertex {
    pub fn new(fit: FittedVertex) -> Self {
        Self {
            fit,
            vertex_type: VertexType::Unclassified,
            decorations: VertexDecorations::default(),
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// A track linked to an output vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexTrack {
    pub track_id: TrackId,
    pub weight: f64,
    pub perigee_at_vertex: Option<Perigee>,
}

/// A secondary vertex as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryVertex {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    pub chi2: f64,
    pub ndof: f64,
    pub vertex_type: VertexType,
    pub tracks: Vec<VertexTrack>,
    pub decorations: VertexDecorations,
}

impl SecondaryVertex {
    /// Transverse distance from the beam line (mm).
    pub fn rxy(&self) -> f64 {
        self.position.xy().norm()
    }

    pub fn full_members(&self, min_weight: f64) -> impl Iterator<Item = &VertexTrack> {
        self.tracks.iter().filter(move |t| t.weight > min_weight)
    }
}
