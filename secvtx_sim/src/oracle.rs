//! Ground truth oracle for simulation.
//!
//! The Oracle generates synthetic events with known secondary vertices:
//! - Two-body decays (K-short, Lambda) and photon conversions
//! - Three-prong hadronic interactions in detector material
//! - Prompt tracks from the primary vertex
//!
//! Tracks are straight lines, smeared with Gaussian noise, and carry the hit
//! pattern a particle produced at their origin would leave.

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use secvtx_core::track::DetectorLayer;
use secvtx_core::v0::{ELECTRON_MASS, KSHORT_MASS, LAMBDA_MASS, PION_MASS, PROTON_MASS};
use secvtx_core::{HitPattern, Track};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::services::{diagonal_covariance, perigee_through};

/// Barrel layers: (layer, radius, half length), mm.
const BARREL: [(DetectorLayer, f64, f64); 7] = [
    (DetectorLayer::PixelBarrel0, 33.25, 400.5),
    (DetectorLayer::PixelBarrel1, 50.5, 400.5),
    (DetectorLayer::PixelBarrel2, 88.5, 400.5),
    (DetectorLayer::PixelBarrel3, 122.5, 400.5),
    (DetectorLayer::SctBarrel0, 299.0, 749.0),
    (DetectorLayer::SctBarrel1, 371.0, 749.0),
    (DetectorLayer::SctBarrel2, 443.0, 749.0),
];

/// Invariant mass given to converting photons so both electrons open up (MeV).
const CONVERSION_MASS: f64 = 20.0;

// ============================================================================
// TRUTH
// ============================================================================

/// What produced a truth vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruthKind {
    KShort,
    Lambda,
    Conversion,
    MaterialInteraction,
}

impl TruthKind {
    pub fn name(&self) -> &'static str {
        match self {
            TruthKind::KShort => "kshort",
            TruthKind::Lambda => "lambda",
            TruthKind::Conversion => "conversion",
            TruthKind::MaterialInteraction => "material_interaction",
        }
    }
}

/// A generated secondary vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthVertex {
    pub kind: TruthKind,

    /// Exact production point of the daughters (mm)
    pub position: Vector3<f64>,

    /// Ids of the daughter tracks
    pub track_ids: Vec<u64>,
}

impl TruthVertex {
    pub fn rxy(&self) -> f64 {
        self.position.xy().norm()
    }
}

/// Composition of one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecipe {
    pub kshorts: usize,
    pub lambdas: usize,
    pub conversions: usize,
    pub interactions: usize,
    pub prompt: usize,
}

impl EventRecipe {
    /// Number of tracks an event with this recipe contains.
    pub fn track_count(&self) -> usize {
        2 * (self.kshorts + self.lambdas + self.conversions) + 3 * self.interactions + self.prompt
    }
}

/// A generated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub index: usize,

    /// True primary vertex
    pub primary: Vector3<f64>,

    pub tracks: Vec<Track>,

    pub truth: Vec<TruthVertex>,
}

// ============================================================================
// ORACLE
// ============================================================================

/// The Oracle - generates events and keeps the truth behind them.
#[derive(Debug)]
pub struct Oracle {
    /// RNG for kinematics, smearing and hit inefficiency
    physics_rng: ChaCha8Rng,

    /// Next track id
    next_track_id: u64,

    /// Next event index
    next_event: usize,

    /// Transverse impact resolution (mm)
    sigma_d0: f64,

    /// Longitudinal impact resolution (mm)
    sigma_z0: f64,

    /// Angular resolution (rad)
    sigma_angle: f64,

    /// Relative q/p resolution
    sigma_qop_rel: f64,

    /// Probability that a crossed layer records a hit
    hit_efficiency: f64,

    /// Transverse decay-radius window of K-shorts and Lambdas (mm)
    decay_radius: (f64, f64),
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            next_track_id: 0,
            next_event: 0,
            sigma_d0: 0.05,         // 50 µm
            sigma_z0: 0.1,          // 100 µm
            sigma_angle: 1e-4,      // 0.1 mrad
            sigma_qop_rel: 0.01,    // 1%
            hit_efficiency: 0.98,
            decay_radius: (10.0, 300.0),
        }
    }

    pub fn set_hit_efficiency(&mut self, efficiency: f64) {
        self.hit_efficiency = efficiency.clamp(0.0, 1.0);
    }

    /// Generates one event.
    pub fn generate_event(&mut self, recipe: &EventRecipe) -> SimEvent {
        let index = self.next_event;
        self.next_event += 1;

        let primary = Vector3::new(0.0, 0.0, self.gaussian() * 30.0);
        let mut event = SimEvent {
            index,
            primary,
            tracks: Vec::with_capacity(recipe.track_count()),
            truth: Vec::new(),
        };

        for _ in 0..recipe.kshorts {
            self.two_body_decay(&mut event, TruthKind::KShort, KSHORT_MASS, (PION_MASS, PION_MASS));
        }
        for _ in 0..recipe.lambdas {
            self.two_body_decay(&mut event, TruthKind::Lambda, LAMBDA_MASS, (PROTON_MASS, PION_MASS));
        }
        for _ in 0..recipe.conversions {
            self.two_body_decay(&mut event, TruthKind::Conversion, CONVERSION_MASS, (ELECTRON_MASS, ELECTRON_MASS));
        }
        for _ in 0..recipe.interactions {
            self.material_interaction(&mut event);
        }
        for _ in 0..recipe.prompt {
            let momentum = self.random_momentum(400.0, 5000.0, 2.4);
            let charge = self.random_charge();
            let track = self.make_track(&primary, &momentum, charge);
            event.tracks.push(track);
        }

        event
    }

    // ========================================================================
    // KINEMATICS
    // ========================================================================

    fn gaussian(&mut self) -> f64 {
        self.physics_rng.sample(StandardNormal)
    }

    fn random_charge(&mut self) -> f64 {
        if self.physics_rng.gen_bool(0.5) {
            1.0
        } else {
            -1.0
        }
    }

    fn isotropic_direction(&mut self) -> Vector3<f64> {
        let cos_theta: f64 = self.physics_rng.gen_range(-1.0..1.0);
        let phi: f64 = self.physics_rng.gen_range(0.0..2.0 * PI);
        let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
        Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
    }

    /// Momentum with magnitude in [p_min, p_max) MeV and |η| below `max_eta`.
    fn random_momentum(&mut self, p_min: f64, p_max: f64, max_eta: f64) -> Vector3<f64> {
        let p = self.physics_rng.gen_range(p_min..p_max);
        let eta: f64 = self.physics_rng.gen_range(-max_eta..max_eta);
        let theta = 2.0 * (-eta).exp().atan();
        let phi: f64 = self.physics_rng.gen_range(0.0..2.0 * PI);
        Vector3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos()) * p
    }

    /// Point at transverse radius `radius` along `momentum` from `origin`.
    fn along(origin: &Vector3<f64>, momentum: &Vector3<f64>, radius: f64) -> Vector3<f64> {
        let transverse = momentum.xy().norm();
        origin + momentum * (radius / transverse)
    }

    fn two_body_decay(&mut self, event: &mut SimEvent, kind: TruthKind, mass: f64, daughters: (f64, f64)) {
        let parent = self.random_momentum(1000.0, 8000.0, 1.5);
        let radius = match kind {
            TruthKind::Conversion => self.material_radius(),
            _ => self.physics_rng.gen_range(self.decay_radius.0..self.decay_radius.1),
        };
        let position = Self::along(&event.primary, &parent, radius);

        let direction = self.isotropic_direction();
        let (p1, p2) = two_body_momenta(&parent, mass, daughters, &direction);

        let charge = self.random_charge();
        let first = self.make_track(&position, &p1, charge);
        let second = self.make_track(&position, &p2, -charge);

        event.truth.push(TruthVertex {
            kind,
            position,
            track_ids: vec![first.id.0, second.id.0],
        });
        event.tracks.push(first);
        event.tracks.push(second);
    }

    /// Radius of a random pixel layer, with some spread for its thickness.
    fn material_radius(&mut self) -> f64 {
        let layer = self.physics_rng.gen_range(0..4);
        BARREL[layer].1 + self.gaussian() * 1.5
    }

    fn material_interaction(&mut self, event: &mut SimEvent) {
        let parent = self.random_momentum(2000.0, 8000.0, 1.5);
        let radius = self.material_radius();
        let position = Self::along(&event.primary, &parent, radius);

        let axis = parent.normalize();
        let helper = if axis.z.abs() < 0.9 { Vector3::z() } else { Vector3::x() };
        let u = axis.cross(&helper).normalize();
        let v = axis.cross(&u);

        let mut track_ids = Vec::with_capacity(3);
        for _ in 0..3 {
            let longitudinal = self.physics_rng.gen_range(400.0..2500.0);
            let momentum = axis * longitudinal + u * (self.gaussian() * 200.0) + v * (self.gaussian() * 200.0);
            let charge = self.random_charge();
            let track = self.make_track(&position, &momentum, charge);
            track_ids.push(track.id.0);
            event.tracks.push(track);
        }

        event.truth.push(TruthVertex {
            kind: TruthKind::MaterialInteraction,
            position,
            track_ids,
        });
    }

    // ========================================================================
    // DETECTOR RESPONSE
    // ========================================================================

    /// Smeared track produced at `origin`.
    fn make_track(&mut self, origin: &Vector3<f64>, momentum: &Vector3<f64>, charge: f64) -> Track {
        let id = self.next_track_id;
        self.next_track_id += 1;

        let hit_pattern = self.hit_pattern(origin, momentum);
        let truth = perigee_through(origin, momentum, charge, &Vector3::zeros());

        let mut perigee = truth.clone();
        perigee.parameters[0] += self.gaussian() * self.sigma_d0;
        perigee.parameters[1] += self.gaussian() * self.sigma_z0;
        perigee.parameters[2] += self.gaussian() * self.sigma_angle;
        perigee.parameters[3] += self.gaussian() * self.sigma_angle;
        perigee.parameters[4] *= 1.0 + self.gaussian() * self.sigma_qop_rel;

        let sigma_qop = self.sigma_qop_rel * truth.qop().abs();
        let perigee = perigee.with_covariance(diagonal_covariance(
            self.sigma_d0,
            self.sigma_z0,
            self.sigma_angle,
            sigma_qop,
        ));

        Track::new(id, perigee, hit_pattern)
    }

    /// Layers crossed by a particle leaving `origin` along `momentum`.
    fn hit_pattern(&mut self, origin: &Vector3<f64>, momentum: &Vector3<f64>) -> HitPattern {
        let mut pattern = HitPattern::default();
        for (layer, radius, half_length) in BARREL {
            let Some(z) = layer_crossing_z(origin, momentum, radius) else {
                continue;
            };
            if z.abs() < half_length && self.physics_rng.gen_bool(self.hit_efficiency) {
                pattern = pattern.with(layer);
            }
        }
        pattern
    }
}

/// Lab-frame momenta of a two-body decay with daughter masses `daughters`,
/// emitted along ±`direction` in the parent rest frame.
pub fn two_body_momenta(
    parent: &Vector3<f64>,
    mass: f64,
    daughters: (f64, f64),
    direction: &Vector3<f64>,
) -> (Vector3<f64>, Vector3<f64>) {
    let (m1, m2) = daughters;
    let p_star = ((mass * mass - (m1 + m2).powi(2)) * (mass * mass - (m1 - m2).powi(2))).max(0.0).sqrt() / (2.0 * mass);

    let rest1 = direction * p_star;
    let rest2 = -rest1;
    let e1 = (p_star * p_star + m1 * m1).sqrt();
    let e2 = (p_star * p_star + m2 * m2).sqrt();

    (boost(&rest1, e1, parent, mass), boost(&rest2, e2, parent, mass))
}

/// Boost a rest-frame momentum into the frame where the parent has `parent` momentum.
fn boost(rest: &Vector3<f64>, rest_energy: f64, parent: &Vector3<f64>, mass: f64) -> Vector3<f64> {
    let p = parent.norm();
    if p == 0.0 {
        return *rest;
    }
    let axis = parent / p;
    let energy = (p * p + mass * mass).sqrt();
    let gamma = energy / mass;
    let beta = p / energy;

    let parallel = rest.dot(&axis);
    let perpendicular = rest - axis * parallel;
    perpendicular + axis * (gamma * (parallel + beta * rest_energy))
}

/// z where a line from `origin` along `momentum` first reaches transverse
/// radius `radius` moving outwards. `None` if it starts outside the layer.
fn layer_crossing_z(origin: &Vector3<f64>, momentum: &Vector3<f64>, radius: f64) -> Option<f64> {
    let o = origin.xy();
    let v = momentum.xy();
    let a = v.norm_squared();
    let c = o.norm_squared() - radius * radius;
    if a == 0.0 || c >= 0.0 {
        return None;
    }
    let b = o.dot(&v);
    let t = (-b + (b * b - a * c).sqrt()) / a;
    Some(origin.z + momentum.z * t)
}
