//! Chi-square style distances between tracks and vertices.
//!
//! - [`compatibility`]: track vs. vertex, in the transverse (d0, z0) plane
//! - [`vertex_distance`]: vertex vs. vertex, squared Mahalanobis distance

use nalgebra::{Matrix2, Matrix3, Matrix5, Vector2, Vector3};

use crate::error::VertexingError;
use crate::services::LinearizedTrackFactory;
use crate::track::Track;
use crate::vertex::FittedVertex;

/// Compatibility of `track` with a vertex at `position` with `covariance`.
///
/// χ² = rᵀ (V_track + J C Jᵀ)⁻¹ r
///
/// Where:
/// - r = expected (d0, z0) of the track relative to the vertex
/// - V_track = expected (d0, z0) covariance
/// - J = position Jacobian of (d0, z0)
/// - C = vertex covariance
///
/// Returns f64::MAX if the summed 2×2 covariance is singular or the χ² is
/// NaN. Linearization failures (e.g. a track without covariance) are
/// returned to the caller.
pub fn compatibility(
    linearizer: &dyn LinearizedTrackFactory,
    track: &Track,
    covariance: &Matrix3<f64>,
    position: &Vector3<f64>,
) -> Result<f64, VertexingError> {
    let linearized = linearizer.linearize(track, position)?;
    let jacobian = &linearized.position_jacobian;

    let vertex_error: Matrix5<f64> = jacobian * covariance * jacobian.transpose();
    let reduced: Matrix2<f64> = linearized
        .expected_covariance
        .fixed_view::<2, 2>(0, 0)
        .into_owned()
        + vertex_error.fixed_view::<2, 2>(0, 0);

    let weight = match reduced.try_inverse() {
        Some(inv) => inv,
        None => return Ok(f64::MAX),
    };

    let residual: Vector2<f64> = linearized.expected_parameters.fixed_rows::<2>(0).into_owned();
    let chi2 = residual.dot(&(weight * residual));

    if chi2.is_nan() {
        return Ok(f64::MAX);
    }
    Ok(chi2.max(0.0))
}

/// Squared Mahalanobis distance between two vertex positions,
/// Δᵀ (C₁ + C₂)⁻¹ Δ.
///
/// Falls back to the squared Euclidean distance if C₁ + C₂ is singular.
pub fn vertex_distance(a: &FittedVertex, b: &FittedVertex) -> f64 {
    let delta = a.position - b.position;
    match (a.covariance + b.covariance).try_inverse() {
        Some(weight) => delta.dot(&(weight * delta)),
        None => delta.norm_squared(),
    }
}
