//! Collaborator interfaces consumed by the finder.
//!
//! The numerical work of seeding, fitting, impact estimation and
//! linearization lives behind these traits. Implementations are shared as
//! `Arc<dyn Trait>` and must be `Send + Sync` so one configured finder can
//! serve several threads.

use nalgebra::{Matrix3, Matrix5, SMatrix, Vector2, Vector3, Vector5};

use crate::error::VertexingError;
use crate::track::{Perigee, Track, TrackLink};
use crate::vertex::FittedVertex;

/// The vertex a track selector is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceVertex {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl ReferenceVertex {
    /// Origin with zero covariance.
    pub fn null() -> Self {
        Self {
            position: Vector3::zeros(),
            covariance: Matrix3::zeros(),
        }
    }
}

/// Track preselection. A track is used only if every configured filter accepts it.
pub trait TrackFilter: Send + Sync {
    fn accept(&self, track: &Track, reference: &ReferenceVertex) -> bool;
}

/// Proposes a vertex position from the remaining pool.
pub trait SeedFinder: Send + Sync {
    /// Returns a point with `z == 0.0` exactly when no seed can be found.
    fn find_seed(&self, approx_primary_xy: Vector2<f64>, perigees: &[&Perigee]) -> Vector3<f64>;
}

/// Distance of closest approach between a track and a point.
pub trait ImpactPointEstimator: Send + Sync {
    fn estimate(&self, track: &Track, point: &Vector3<f64>) -> Result<f64, VertexingError>;
}

/// Adaptive vertex fit.
pub trait VertexFitter: Send + Sync {
    /// `None` when the fit does not converge.
    fn fit(&self, tracks: &[TrackLink<'_>], start: &Vector3<f64>) -> Option<FittedVertex>;
}

/// A track linearized around a trial vertex position.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearizedTrack {
    /// Perigee parameters predicted at the point of closest approach to the vertex
    pub expected_parameters: Vector5<f64>,

    /// Covariance of `expected_parameters`
    pub expected_covariance: Matrix5<f64>,

    /// d(parameters)/d(vertex position)
    pub position_jacobian: SMatrix<f64, 5, 3>,
}

pub trait LinearizedTrackFactory: Send + Sync {
    fn linearize(&self, track: &Track, position: &Vector3<f64>) -> Result<LinearizedTrack, VertexingError>;
}
