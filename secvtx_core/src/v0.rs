//! V0 kinematics: two-body invariant masses and the pointing scalar.
//!
//! A two-track vertex is tagged as a V0 when any of the following hold:
//! - pion-pion mass within 100 MeV of the K-short mass
//! - electron-electron mass below 40 MeV (photon conversion)
//! - proton-pion mass within 200 MeV of the Lambda mass
//!
//! Vertices far from the beam line (Rxy > 500 mm) or whose momentum misses
//! the primary by more than 15 mm longitudinally are never tagged.

use nalgebra::Vector3;
use tracing::debug;

// ============================================================================
// CONSTANTS (MeV, mm)
// ============================================================================

pub const PION_MASS: f64 = 139.57018;
pub const ELECTRON_MASS: f64 = 0.511;
pub const PROTON_MASS: f64 = 938.27205;
pub const KSHORT_MASS: f64 = 497.614;
pub const LAMBDA_MASS: f64 = 1115.683;

const KSHORT_WINDOW: f64 = 100.0;
const LAMBDA_WINDOW: f64 = 200.0;
const GAMMA_MAX_MASS: f64 = 40.0;
const MAX_A0Z: f64 = 15.0;
const MAX_RXY: f64 = 500.0;

/// Result of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct V0Classification {
    pub is_v0: bool,

    /// Pion-hypothesis invariant mass of all momenta
    pub mass: Option<f64>,

    /// Summed pion-hypothesis energy
    pub energy: Option<f64>,

    /// (Σp) · (vertex − primary) / |Σp|
    pub direction: Option<f64>,

    /// Electron-electron mass, two-track vertices only
    pub gamma_mass: Option<f64>,

    /// Proton-pion mass with the harder track as proton, two-track vertices only
    pub lambda_mass: Option<f64>,
}

fn abs_sqrt(m2: f64) -> f64 {
    m2.abs().sqrt()
}

/// Classify the momenta of a vertex at `vertex` given the primary at `primary`.
pub fn classify(momenta: &[Vector3<f64>], vertex: &Vector3<f64>, primary: &Vector3<f64>) -> V0Classification {
    if momenta.len() < 2 {
        debug!("{} momenta, no mass to test", momenta.len());
        return V0Classification::default();
    }

    let p2: Vec<f64> = momenta.iter().map(|p| p.norm_squared()).collect();
    let total: Vector3<f64> = momenta.iter().sum();
    let total2 = total.norm_squared();

    let energy: f64 = p2.iter().map(|p2| (p2 + PION_MASS * PION_MASS).sqrt()).sum();
    let mass = abs_sqrt(energy * energy - total2);

    let flight = vertex - primary;
    let direction = if total2 > 0.0 {
        Some(total.dot(&flight) / total2.sqrt())
    } else {
        None
    };

    // Longitudinal miss of the momentum line w.r.t. the primary
    let perpendicular = flight - total * (total.dot(&flight) / (total2 + 1e-5));
    let a0z = perpendicular.z.abs();
    let rxy = flight.xy().norm();

    debug!("V0 kinematics: mass = {:.1} a0z = {:.2} Rxy = {:.1} direction = {:?}", mass, a0z, rxy, direction);

    let mut result = V0Classification {
        is_v0: false,
        mass: Some(mass),
        energy: Some(energy),
        direction,
        gamma_mass: None,
        lambda_mass: None,
    };

    if momenta.len() != 2 {
        return result;
    }

    let e_gamma = (p2[0] + ELECTRON_MASS * ELECTRON_MASS).sqrt() + (p2[1] + ELECTRON_MASS * ELECTRON_MASS).sqrt();
    let m2_gamma = e_gamma * e_gamma - total2;

    let (proton, pion) = if p2[0] > p2[1] { (p2[0], p2[1]) } else { (p2[1], p2[0]) };
    let e_lambda = (proton + PROTON_MASS * PROTON_MASS).sqrt() + (pion + PION_MASS * PION_MASS).sqrt();
    let m2_lambda = e_lambda * e_lambda - total2;

    result.gamma_mass = Some(abs_sqrt(m2_gamma));
    result.lambda_mass = Some(abs_sqrt(m2_lambda));

    if a0z > MAX_A0Z || rxy > MAX_RXY {
        return result;
    }

    let kshort = (mass - KSHORT_MASS).abs() < KSHORT_WINDOW;
    let gamma = m2_gamma > 0.0 && m2_gamma.sqrt() < GAMMA_MAX_MASS;
    let lambda = m2_lambda > 0.0 && (m2_lambda.sqrt() - LAMBDA_MASS).abs() < LAMBDA_WINDOW;

    result.is_v0 = kshort || gamma || lambda;
    result
}
