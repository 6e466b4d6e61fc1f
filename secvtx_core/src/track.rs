//! Input tracks: perigee parameters, detector hit patterns and the per-event
//! registry that hands out stable [`TrackKey`]s.
//!
//! Units are millimetres and MeV throughout. The perigee parameter vector is
//! laid out as `[d0, z0, phi, theta, q/p]`.

use std::fmt;

use nalgebra::{Matrix5, Vector3, Vector5};
use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Caller-supplied identifier of an input track. Stable across the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a selected track in the per-event [`TrackRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackKey(pub usize);

// ============================================================================
// PERIGEE
// ============================================================================

/// Track parameters expressed at the point of closest approach to `reference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perigee {
    /// `[d0, z0, phi, theta, q/p]`
    pub parameters: Vector5<f64>,

    /// 5×5 covariance of `parameters`, if the producer supplied one
    pub covariance: Option<Matrix5<f64>>,

    /// Reference point the parameters are expressed against
    pub reference: Vector3<f64>,
}

impl Perigee {
    pub fn new(d0: f64, z0: f64, phi: f64, theta: f64, qop: f64, reference: Vector3<f64>) -> Self {
        Self {
            parameters: Vector5::new(d0, z0, phi, theta, qop),
            covariance: None,
            reference,
        }
    }

    pub fn with_covariance(mut self, covariance: Matrix5<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    #[inline]
    pub fn d0(&self) -> f64 {
        self.parameters[0]
    }

    #[inline]
    pub fn z0(&self) -> f64 {
        self.parameters[1]
    }

    #[inline]
    pub fn phi(&self) -> f64 {
        self.parameters[2]
    }

    #[inline]
    pub fn theta(&self) -> f64 {
        self.parameters[3]
    }

    #[inline]
    pub fn qop(&self) -> f64 {
        self.parameters[4]
    }

    /// Global position of the perigee point.
    pub fn position(&self) -> Vector3<f64> {
        let (sin_phi, cos_phi) = self.phi().sin_cos();
        Vector3::new(
            self.reference.x - self.d0() * sin_phi,
            self.reference.y + self.d0() * cos_phi,
            self.reference.z + self.z0(),
        )
    }

    /// Unit direction of flight at the perigee point.
    pub fn direction(&self) -> Vector3<f64> {
        let (sin_phi, cos_phi) = self.phi().sin_cos();
        let (sin_theta, cos_theta) = self.theta().sin_cos();
        Vector3::new(sin_theta * cos_phi, sin_theta * sin_phi, cos_theta)
    }

    /// Momentum vector in MeV. Zero for a track without curvature information.
    pub fn momentum(&self) -> Vector3<f64> {
        if self.qop() == 0.0 {
            return Vector3::zeros();
        }
        self.direction() / self.qop().abs()
    }

    /// Transverse momentum in MeV.
    pub fn pt(&self) -> f64 {
        if self.qop() == 0.0 {
            return 0.0;
        }
        self.theta().sin().abs() / self.qop().abs()
    }

    /// `var(d0) + var(z0)`, the approximate impact-parameter error squared.
    pub fn impact_variance(&self) -> Option<f64> {
        self.covariance.map(|cov| cov[(0, 0)] + cov[(1, 1)])
    }
}

// ============================================================================
// HIT PATTERN
// ============================================================================

/// Silicon barrel layers that take part in the hit-pattern consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorLayer {
    PixelBarrel0,
    PixelBarrel1,
    PixelBarrel2,
    PixelBarrel3,
    SctBarrel0,
    SctBarrel1,
    SctBarrel2,
}

impl DetectorLayer {
    /// All layers, innermost first.
    pub fn all() -> [DetectorLayer; 7] {
        [
            DetectorLayer::PixelBarrel0,
            DetectorLayer::PixelBarrel1,
            DetectorLayer::PixelBarrel2,
            DetectorLayer::PixelBarrel3,
            DetectorLayer::SctBarrel0,
            DetectorLayer::SctBarrel1,
            DetectorLayer::SctBarrel2,
        ]
    }

    /// Bit position in a [`HitPattern`].
    pub fn bit(self) -> u32 {
        match self {
            DetectorLayer::PixelBarrel0 => 0,
            DetectorLayer::PixelBarrel1 => 1,
            DetectorLayer::PixelBarrel2 => 2,
            DetectorLayer::PixelBarrel3 => 3,
            DetectorLayer::SctBarrel0 => 7,
            DetectorLayer::SctBarrel1 => 8,
            DetectorLayer::SctBarrel2 => 9,
        }
    }
}

/// Bit-per-layer record of which detector layers registered a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HitPattern(pub u32);

impl HitPattern {
    pub fn from_layers(layers: &[DetectorLayer]) -> Self {
        layers
            .iter()
            .fold(HitPattern::default(), |pattern, layer| pattern.with(*layer))
    }

    #[inline]
    pub fn has(self, layer: DetectorLayer) -> bool {
        self.0 & (1 << layer.bit()) != 0
    }

    #[must_use]
    pub fn with(self, layer: DetectorLayer) -> Self {
        HitPattern(self.0 | (1 << layer.bit()))
    }
}

// ============================================================================
// TRACK
// ============================================================================

/// A reconstructed charged-particle track as handed to the finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub perigee: Perigee,
    pub hit_pattern: HitPattern,
}

impl Track {
    pub fn new(id: u64, perigee: Perigee, hit_pattern: HitPattern) -> Self {
        Self {
            id: TrackId(id),
            perigee,
            hit_pattern,
        }
    }
}

/// A selected track together with its registry key, the unit handed to the
/// vertex fitter.
#[derive(Debug, Clone, Copy)]
pub struct TrackLink<'a> {
    pub key: TrackKey,
    pub track: &'a Track,
}

/// The tracks selected for one event. Borrowed, never owned.
#[derive(Debug, Clone, Default)]
pub struct TrackRegistry<'a> {
    tracks: Vec<&'a Track>,
}

impl<'a> TrackRegistry<'a> {
    pub fn new(tracks: Vec<&'a Track>) -> Self {
        Self { tracks }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Look up a key. Keys are only ever produced by this registry.
    pub fn get(&self, key: TrackKey) -> Option<&'a Track> {
        self.tracks.get(key.0).copied()
    }

    pub fn link(&self, key: TrackKey) -> Option<TrackLink<'a>> {
        self.get(key).map(|track| TrackLink { key, track })
    }

    /// All keys in selection order.
    pub fn keys(&self) -> impl Iterator<Item = TrackKey> + '_ {
        (0..self.tracks.len()).map(TrackKey)
    }
}
