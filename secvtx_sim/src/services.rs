//! Straight-line reference implementations of the finder's services.
//!
//! Tracks are modelled as straight lines (no magnetic field): a perigee is
//! the point `(x0 - d0 sinφ, y0 + d0 cosφ, z_ref + z0)` on the line plus the
//! direction given by (φ, θ). Every quantity below is exact for that model,
//! which keeps the simulation self-consistent.

use nalgebra::{Matrix2, Matrix3, Matrix5, SMatrix, Vector2, Vector3};
use secvtx_core::{
    FittedVertex, ImpactPointEstimator, LinearizedTrack, LinearizedTrackFactory, Perigee, ReferenceVertex,
    SeedFinder, Track, TrackAtVertex, TrackFilter, TrackLink, VertexFitter, VertexingError,
};
use tracing::{debug, trace, warn};

/// Variance of the loose prior around the fit start point (mm²).
const PRIOR_VARIANCE: f64 = 1e8;

// ============================================================================
// GEOMETRY
// ============================================================================

/// Perigee (w.r.t. `reference`) of the straight line through `point` along
/// `momentum` with the given `charge`.
pub fn perigee_through(point: &Vector3<f64>, momentum: &Vector3<f64>, charge: f64, reference: &Vector3<f64>) -> Perigee {
    let p = momentum.norm();
    let direction = momentum / p;
    let phi = direction.y.atan2(direction.x);
    let theta = direction.z.clamp(-1.0, 1.0).acos();

    let relative = point - reference;
    let transverse = direction.xy();
    let t = if transverse.norm_squared() > 0.0 {
        -relative.xy().dot(&transverse) / transverse.norm_squared()
    } else {
        0.0
    };
    let pca = relative + direction * t;

    let (sin_phi, cos_phi) = phi.sin_cos();
    let d0 = -pca.x * sin_phi + pca.y * cos_phi;
    Perigee::new(d0, pca.z, phi, theta, charge / p, *reference)
}

/// (d0, z0) of a track's line expressed w.r.t. `point`, and their Jacobian
/// with respect to `point`.
///
/// Fails for a track parallel to the beam, which has no transverse perigee.
pub fn impact_parameters(
    perigee: &Perigee,
    point: &Vector3<f64>,
) -> Result<(Vector2<f64>, SMatrix<f64, 2, 3>), VertexingError> {
    let (sin_theta, cos_theta) = perigee.theta().sin_cos();
    if sin_theta.abs() < 1e-9 {
        return Err(VertexingError::linearization("track parallel to the beam axis"));
    }
    let cot_theta = cos_theta / sin_theta;
    let (sin_phi, cos_phi) = perigee.phi().sin_cos();

    let delta = perigee.position() - point;
    let d0 = -delta.x * sin_phi + delta.y * cos_phi;
    let z0 = delta.z - (delta.x * cos_phi + delta.y * sin_phi) * cot_theta;

    #[rustfmt::skip]
    let jacobian = SMatrix::<f64, 2, 3>::new(
        sin_phi,             -cos_phi,            0.0,
        cos_phi * cot_theta, sin_phi * cot_theta, -1.0,
    );
    Ok((Vector2::new(d0, z0), jacobian))
}

/// Closest approach of two lines: midpoint and separation.
///
/// `None` for (nearly) parallel lines.
pub fn closest_approach(
    p1: &Vector3<f64>,
    u1: &Vector3<f64>,
    p2: &Vector3<f64>,
    u2: &Vector3<f64>,
) -> Option<(Vector3<f64>, f64)> {
    let w0 = p1 - p2;
    let b = u1.dot(u2);
    let d = u1.dot(&w0);
    let e = u2.dot(&w0);

    let denom = 1.0 - b * b;
    if denom < 1e-12 {
        return None;
    }

    let s = (b * e - d) / denom;
    let t = (e - b * d) / denom;
    let c1 = p1 + u1 * s;
    let c2 = p2 + u2 * t;
    Some(((c1 + c2) * 0.5, (c1 - c2).norm()))
}

/// Pseudorapidity of a polar angle.
pub fn eta(theta: f64) -> f64 {
    -(theta / 2.0).tan().ln()
}

// ============================================================================
// LINEARIZER & IMPACT POINT
// ============================================================================

/// Exact linearization of a straight track around a vertex position.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightLineLinearizer;

impl LinearizedTrackFactory for StraightLineLinearizer {
    fn linearize(&self, track: &Track, position: &Vector3<f64>) -> Result<LinearizedTrack, VertexingError> {
        let covariance = track
            .perigee
            .covariance
            .ok_or(VertexingError::MissingCovariance(track.id))?;
        let (impact, jacobian) = impact_parameters(&track.perigee, position)?;

        let mut expected_parameters = track.perigee.parameters;
        expected_parameters[0] = impact.x;
        expected_parameters[1] = impact.y;

        let mut position_jacobian = SMatrix::<f64, 5, 3>::zeros();
        position_jacobian.fixed_rows_mut::<2>(0).copy_from(&jacobian);

        Ok(LinearizedTrack {
            expected_parameters,
            expected_covariance: covariance,
            position_jacobian,
        })
    }
}

/// 3D distance of closest approach between a track line and a point.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightLineImpactEstimator;

impl ImpactPointEstimator for StraightLineImpactEstimator {
    fn estimate(&self, track: &Track, point: &Vector3<f64>) -> Result<f64, VertexingError> {
        let direction = track.perigee.direction();
        if direction.norm_squared() == 0.0 {
            return Err(VertexingError::impact_point(format!("track {} has no direction", track.id)));
        }
        Ok((point - track.perigee.position()).cross(&direction).norm())
    }
}

// ============================================================================
// SEED FINDER
// ============================================================================

/// Seeds at the densest cluster of pairwise track crossings.
#[derive(Debug, Clone)]
pub struct PairCrossingSeedFinder {
    /// Max separation of two lines for their midpoint to count as a crossing (mm)
    pub max_pair_distance: f64,

    /// Crossings closer than this belong to the same cluster (mm)
    pub cluster_radius: f64,

    /// Crossings this close to the primary in the transverse plane are ignored (mm)
    pub min_transverse_distance: f64,
}

impl Default for PairCrossingSeedFinder {
    fn default() -> Self {
        Self {
            max_pair_distance: 1.0,
            cluster_radius: 5.0,
            min_transverse_distance: 2.0,
        }
    }
}

impl PairCrossingSeedFinder {
    fn crossings(&self, approx_primary_xy: &Vector2<f64>, perigees: &[&Perigee]) -> Vec<Vector3<f64>> {
        let lines: Vec<(Vector3<f64>, Vector3<f64>)> =
            perigees.iter().map(|p| (p.position(), p.direction())).collect();

        let mut crossings = Vec::new();
        for (i, (p1, u1)) in lines.iter().enumerate() {
            for (p2, u2) in &lines[i + 1..] {
                let Some((midpoint, separation)) = closest_approach(p1, u1, p2, u2) else {
                    continue;
                };
                if separation > self.max_pair_distance {
                    continue;
                }
                if (midpoint.xy() - approx_primary_xy).norm() < self.min_transverse_distance {
                    continue;
                }
                crossings.push(midpoint);
            }
        }
        crossings
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

impl SeedFinder for PairCrossingSeedFinder {
    fn find_seed(&self, approx_primary_xy: Vector2<f64>, perigees: &[&Perigee]) -> Vector3<f64> {
        if perigees.len() < 2 {
            return Vector3::zeros();
        }

        let crossings = self.crossings(&approx_primary_xy, perigees);
        if crossings.is_empty() {
            debug!("No track crossings among {} perigees", perigees.len());
            return Vector3::zeros();
        }

        let neighbours = |center: &Vector3<f64>| {
            crossings
                .iter()
                .filter(|c| (*c - center).norm() < self.cluster_radius)
                .count()
        };

        // First crossing wins ties
        let mut densest = &crossings[0];
        let mut best = neighbours(densest);
        for crossing in &crossings[1..] {
            let count = neighbours(crossing);
            if count > best {
                densest = crossing;
                best = count;
            }
        }

        let cluster: Vec<&Vector3<f64>> = crossings
            .iter()
            .filter(|c| (*c - densest).norm() < self.cluster_radius)
            .collect();
        let mut seed = Vector3::new(
            median(cluster.iter().map(|c| c.x).collect()),
            median(cluster.iter().map(|c| c.y).collect()),
            median(cluster.iter().map(|c| c.z).collect()),
        );

        // z == 0 means "no seed" to the finder
        if seed.z == 0.0 {
            seed.z = f64::EPSILON;
        }
        trace!("Seed from {} of {} crossings", cluster.len(), crossings.len());
        seed
    }
}

// ============================================================================
// ADAPTIVE FITTER
// ============================================================================

/// Temperatures of the first fit iterations; later iterations run at 1.
const ANNEALING: [f64; 4] = [64.0, 16.0, 4.0, 1.0];

fn temperature(iteration: usize) -> f64 {
    ANNEALING.get(iteration).copied().unwrap_or(1.0)
}

/// Iteratively reweighted least-squares vertex fit on straight tracks.
///
/// Track weights follow `exp(-χ²/2T) / (exp(-χ²/2T) + exp(-cut/2T))`, so a
/// track far beyond the cut drops towards zero weight instead of being cut
/// hard. The temperature T is annealed down to 1, starting from weights
/// evaluated at the start point.
#[derive(Debug, Clone)]
pub struct AdaptiveStraightLineFitter {
    /// χ² at which a track's weight is one half
    pub chi2_cut: f64,

    pub max_iterations: usize,

    /// Position change that counts as converged (mm)
    pub tolerance: f64,

    linearizer: StraightLineLinearizer,
}

impl Default for AdaptiveStraightLineFitter {
    fn default() -> Self {
        Self {
            chi2_cut: 9.0,
            max_iterations: 50,
            tolerance: 1e-4,
            linearizer: StraightLineLinearizer,
        }
    }
}

struct FitTerm<'a> {
    link: TrackLink<'a>,
    weight_matrix: Matrix2<f64>,
}

impl AdaptiveStraightLineFitter {
    fn adaptive_weight(&self, chi2: f64, temperature: f64) -> f64 {
        let compatible = (-chi2 / (2.0 * temperature)).exp();
        compatible / (compatible + (-self.chi2_cut / (2.0 * temperature)).exp())
    }

    fn term<'a>(&self, link: TrackLink<'a>, start: &Vector3<f64>) -> Option<FitTerm<'a>> {
        let linearized = match self.linearizer.linearize(link.track, start) {
            Ok(linearized) => linearized,
            Err(e) => {
                warn!("Dropping track {} from fit: {}", link.track.id, e);
                return None;
            }
        };
        let covariance: Matrix2<f64> = linearized.expected_covariance.fixed_view::<2, 2>(0, 0).into_owned();
        let weight_matrix = covariance.try_inverse()?;
        Some(FitTerm { link, weight_matrix })
    }

    fn chi2(term: &FitTerm<'_>, position: &Vector3<f64>) -> Option<f64> {
        let (residual, _) = impact_parameters(&term.link.track.perigee, position).ok()?;
        Some(residual.dot(&(term.weight_matrix * residual)))
    }

    /// Normal matrix and gradient of the weighted objective at `position`.
    fn normal_equations(
        terms: &[FitTerm<'_>],
        weights: &[f64],
        position: &Vector3<f64>,
        start: &Vector3<f64>,
    ) -> Option<(Matrix3<f64>, Vector3<f64>)> {
        let mut normal = Matrix3::identity() / PRIOR_VARIANCE;
        let mut gradient = (position - start) / PRIOR_VARIANCE;
        for (term, weight) in terms.iter().zip(weights) {
            let (residual, jacobian) = impact_parameters(&term.link.track.perigee, position).ok()?;
            let projected = jacobian.transpose() * term.weight_matrix;
            normal += (projected * jacobian) * *weight;
            gradient += (projected * residual) * *weight;
        }
        Some((normal, gradient))
    }
}

impl VertexFitter for AdaptiveStraightLineFitter {
    fn fit(&self, tracks: &[TrackLink<'_>], start: &Vector3<f64>) -> Option<FittedVertex> {
        let terms: Vec<FitTerm<'_>> = tracks.iter().filter_map(|link| self.term(*link, start)).collect();
        if terms.len() < 2 {
            debug!("Only {} usable tracks, no fit", terms.len());
            return None;
        }

        let mut position = *start;
        let mut weights = terms
            .iter()
            .map(|term| Self::chi2(term, start).map(|chi2| self.adaptive_weight(chi2, temperature(0))))
            .collect::<Option<Vec<f64>>>()?;
        let mut converged = false;

        for iteration in 0..self.max_iterations {
            let (normal, gradient) = Self::normal_equations(&terms, &weights, &position, start)?;
            let step = -(normal.try_inverse()? * gradient);
            position += step;

            if !position.iter().all(|x| x.is_finite()) {
                warn!("Fit diverged after {} iterations", iteration + 1);
                return None;
            }

            let t = temperature(iteration + 1);
            for (term, weight) in terms.iter().zip(weights.iter_mut()) {
                *weight = self.adaptive_weight(Self::chi2(term, &position)?, t);
            }

            if t == 1.0 && step.norm() < self.tolerance {
                trace!("Fit converged after {} iterations", iteration + 1);
                converged = true;
                break;
            }
        }

        if !converged {
            debug!("Fit did not converge in {} iterations", self.max_iterations);
            return None;
        }

        let (normal, _) = Self::normal_equations(&terms, &weights, &position, start)?;
        let covariance = normal.try_inverse()?;

        let mut chi2 = 0.0;
        let mut at_vertex = Vec::with_capacity(terms.len());
        for (term, weight) in terms.iter().zip(&weights) {
            chi2 += weight * Self::chi2(term, &position)?;
            let perigee = &term.link.track.perigee;
            let mut refitted = Perigee::new(0.0, 0.0, perigee.phi(), perigee.theta(), perigee.qop(), position);
            refitted.covariance = perigee.covariance;
            at_vertex.push(TrackAtVertex {
                key: term.link.key,
                weight: *weight,
                perigee_at_vertex: Some(refitted),
            });
        }

        Some(FittedVertex {
            position,
            covariance,
            chi2,
            ndof: 2.0 * weights.iter().sum::<f64>() - 3.0,
            tracks: at_vertex,
        })
    }
}

// ============================================================================
// TRACK FILTERS
// ============================================================================

/// Basic quality: covariance present, enough pT, inside the tracker acceptance.
#[derive(Debug, Clone)]
pub struct QualityTrackFilter {
    /// MeV
    pub min_pt: f64,
    pub max_abs_eta: f64,
}

impl Default for QualityTrackFilter {
    fn default() -> Self {
        Self {
            min_pt: 300.0,
            max_abs_eta: 2.5,
        }
    }
}

impl TrackFilter for QualityTrackFilter {
    fn accept(&self, track: &Track, _reference: &ReferenceVertex) -> bool {
        track.perigee.covariance.is_some()
            && track.perigee.pt() >= self.min_pt
            && eta(track.perigee.theta()).abs() <= self.max_abs_eta
    }
}

/// Rejects tracks that point back to the reference vertex.
#[derive(Debug, Clone)]
pub struct DisplacedTrackFilter {
    /// mm
    pub min_abs_d0: f64,
}

impl Default for DisplacedTrackFilter {
    fn default() -> Self {
        Self { min_abs_d0: 0.3 }
    }
}

impl TrackFilter for DisplacedTrackFilter {
    fn accept(&self, track: &Track, reference: &ReferenceVertex) -> bool {
        match impact_parameters(&track.perigee, &reference.position) {
            Ok((impact, _)) => impact.x.abs() >= self.min_abs_d0,
            Err(_) => false,
        }
    }
}

/// Diagonal perigee covariance from per-parameter resolutions.
pub fn diagonal_covariance(sigma_d0: f64, sigma_z0: f64, sigma_angle: f64, sigma_qop: f64) -> Matrix5<f64> {
    Matrix5::from_diagonal(&nalgebra::Vector5::new(
        sigma_d0 * sigma_d0,
        sigma_z0 * sigma_z0,
        sigma_angle * sigma_angle,
        sigma_angle * sigma_angle,
        sigma_qop * sigma_qop,
    ))
}
