//! Hit-pattern consistency between a track and a displaced vertex.
//!
//! A track produced at radius r cannot have hits on layers inside r, and
//! should have a hit on the first layer outside it. The detector is split
//! into radial zones; each zone lists the layers that must be empty and the
//! layer that must be hit. Zones that straddle a layer say nothing about that
//! layer, since the vertex resolution cannot tell which side it sits on.

use tracing::{debug, error};

use crate::track::{DetectorLayer, HitPattern, Track, TrackKey, TrackRegistry};
use crate::vertex::FittedVertex;

use DetectorLayer::*;

// ============================================================================
// ZONES
// ============================================================================

/// Radial zone of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexZone {
    InsideBeamPipe,
    InsidePixelBarrel0,
    AroundPixelBarrel0,
    OutsidePixelBarrel0InsidePixelBarrel1,
    AroundPixelBarrel1,
    OutsidePixelBarrel1InsidePixelBarrel2,
    AroundPixelBarrel2,
    OutsidePixelBarrel2InsidePixelBarrel3,
    AroundPixelBarrel3,
    OutsidePixelBarrel3InsideSctBarrel0,
    AroundSctBarrel0,
    OutsideSctBarrel0InsideSctBarrel1,
    AroundSctBarrel1,
    InsideSilicon,
}

/// Upper radius and |z| bounds of every bounded zone, innermost first (mm).
const ZONE_BOUNDS: [(VertexZone, f64, f64); 13] = [
    (VertexZone::InsideBeamPipe, 23.5, f64::INFINITY),
    (VertexZone::InsidePixelBarrel0, 31.0, 331.5),
    (VertexZone::AroundPixelBarrel0, 38.4, 331.5),
    (VertexZone::OutsidePixelBarrel0InsidePixelBarrel1, 47.7, 400.5),
    (VertexZone::AroundPixelBarrel1, 54.4, 400.5),
    (VertexZone::OutsidePixelBarrel1InsidePixelBarrel2, 85.5, 400.5),
    (VertexZone::AroundPixelBarrel2, 92.2, 400.5),
    (VertexZone::OutsidePixelBarrel2InsidePixelBarrel3, 119.3, 400.5),
    (VertexZone::AroundPixelBarrel3, 126.1, 400.5),
    (VertexZone::OutsidePixelBarrel3InsideSctBarrel0, 290.0, 749.0),
    (VertexZone::AroundSctBarrel0, 315.0, 749.0),
    (VertexZone::OutsideSctBarrel0InsideSctBarrel1, 360.0, 749.0),
    (VertexZone::AroundSctBarrel1, 390.0, 749.0),
];

impl VertexZone {
    /// Zone of a vertex at transverse radius `radius` and longitudinal `abs_z`.
    pub fn locate(radius: f64, abs_z: f64) -> Self {
        ZONE_BOUNDS
            .iter()
            .find(|(_, max_r, max_z)| radius < *max_r && abs_z < *max_z)
            .map(|(zone, _, _)| *zone)
            .unwrap_or(VertexZone::InsideSilicon)
    }

    /// Layers that must be empty, and the layer that must be hit.
    pub fn requirements(self) -> (&'static [DetectorLayer], Option<DetectorLayer>) {
        match self {
            VertexZone::InsideBeamPipe => (&[], Some(PixelBarrel0)),
            VertexZone::InsidePixelBarrel0 => (&[], Some(PixelBarrel0)),
            VertexZone::AroundPixelBarrel0 => (&[], Some(PixelBarrel1)),
            VertexZone::OutsidePixelBarrel0InsidePixelBarrel1 => (&[PixelBarrel0], Some(PixelBarrel1)),
            VertexZone::AroundPixelBarrel1 => (&[PixelBarrel0], Some(PixelBarrel2)),
            VertexZone::OutsidePixelBarrel1InsidePixelBarrel2 => {
                (&[PixelBarrel0, PixelBarrel1], Some(PixelBarrel2))
            }
            VertexZone::AroundPixelBarrel2 => (&[PixelBarrel0, PixelBarrel1], Some(PixelBarrel3)),
            VertexZone::OutsidePixelBarrel2InsidePixelBarrel3 => {
                (&[PixelBarrel0, PixelBarrel1, PixelBarrel2], Some(PixelBarrel3))
            }
            VertexZone::AroundPixelBarrel3 => {
                (&[PixelBarrel0, PixelBarrel1, PixelBarrel2], Some(SctBarrel0))
            }
            VertexZone::OutsidePixelBarrel3InsideSctBarrel0 => (
                &[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3],
                Some(SctBarrel0),
            ),
            VertexZone::AroundSctBarrel0 => (
                &[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3],
                Some(SctBarrel1),
            ),
            VertexZone::OutsideSctBarrel0InsideSctBarrel1 => (
                &[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3, SctBarrel0],
                Some(SctBarrel1),
            ),
            VertexZone::AroundSctBarrel1 => (
                &[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3, SctBarrel0],
                Some(SctBarrel2),
            ),
            VertexZone::InsideSilicon => (&[], None),
        }
    }

    pub fn accepts(self, pattern: HitPattern) -> bool {
        let (forbidden, required) = self.requirements();
        if forbidden.iter().any(|layer| pattern.has(*layer)) {
            return false;
        }
        required.map_or(true, |layer| pattern.has(layer))
    }
}

/// Whether `track`'s hits are consistent with a vertex at (`radius`, `abs_z`).
pub fn passes_hits_filter(track: &Track, radius: f64, abs_z: f64) -> bool {
    let zone = VertexZone::locate(radius, abs_z);
    let pass = zone.accepts(track.hit_pattern);
    debug!(
        "Hit filter: track {} pattern {:#b} zone {:?} -> {}",
        track.id, track.hit_pattern.0, zone, pass
    );
    pass
}

// ============================================================================
// GROOMING
// ============================================================================

/// Drop full members whose hit pattern contradicts the vertex position.
///
/// Inconsistent tracks are removed from `fit_list` and from the vertex's
/// track list. Returns
/// `0.4 * n_inconsistent / n_total + 0.6 * pt_inconsistent / pt_total`,
/// or 0 (with nothing removed) when there are no full members or no pT.
pub fn groom(
    vertex: &mut FittedVertex,
    fit_list: &mut Vec<TrackKey>,
    registry: &TrackRegistry<'_>,
    min_weight: f64,
) -> f64 {
    let radius = vertex.position.xy().norm();
    let abs_z = vertex.position.z.abs();

    let mut total = 0usize;
    let mut pt_total = 0.0;
    let mut pt_inconsistent = 0.0;
    let mut inconsistent = Vec::new();

    for member in vertex.full_members(min_weight) {
        let Some(track) = registry.get(member.key) else {
            error!("Vertex track {:?} is not in the registry", member.key);
            continue;
        };
        total += 1;

        let pt = member.perigee_at_vertex.as_ref().map_or(0.0, |p| p.pt());
        pt_total += pt;

        if passes_hits_filter(track, radius, abs_z) {
            continue;
        }
        if fit_list.contains(&member.key) {
            inconsistent.push(member.key);
            pt_inconsistent += pt;
        }
    }

    if total == 0 || pt_total == 0.0 {
        return 0.0;
    }

    for key in &inconsistent {
        fit_list.retain(|k| k != key);
        vertex.detach(*key);
    }
    debug!("Groomed {} of {} tracks from vertex", inconsistent.len(), total);

    0.4 * inconsistent.len() as f64 / total as f64 + 0.6 * pt_inconsistent / pt_total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Perigee;
    use crate::vertex::TrackAtVertex;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use std::f64::consts::FRAC_PI_2;

    fn track_with(layers: &[DetectorLayer]) -> Track {
        Track::new(
            0,
            Perigee::new(0.0, 0.0, 0.0, FRAC_PI_2, 1e-3, Vector3::zeros()),
            HitPattern::from_layers(layers),
        )
    }

    #[test]
    fn test_zone_lookup() {
        assert_eq!(VertexZone::locate(10.0, 1000.0), VertexZone::InsideBeamPipe);
        assert_eq!(VertexZone::locate(30.0, 100.0), VertexZone::InsidePixelBarrel0);
        assert_eq!(VertexZone::locate(30.0, 350.0), VertexZone::OutsidePixelBarrel0InsidePixelBarrel1);
        assert_eq!(VertexZone::locate(100.0, 0.0), VertexZone::OutsidePixelBarrel2InsidePixelBarrel3);
        assert_eq!(VertexZone::locate(200.0, 0.0), VertexZone::OutsidePixelBarrel3InsideSctBarrel0);
        assert_eq!(VertexZone::locate(389.0, 748.0), VertexZone::AroundSctBarrel1);
        assert_eq!(VertexZone::locate(400.0, 0.0), VertexZone::InsideSilicon);
        assert_eq!(VertexZone::locate(200.0, 800.0), VertexZone::InsideSilicon);
    }

    #[test]
    fn test_outer_vertex_requires_missing_inner_hits() {
        let clean = track_with(&[PixelBarrel3, SctBarrel0, SctBarrel1]);
        let prompt = track_with(&[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3, SctBarrel0]);

        // Between pixel barrel 2 and 3
        assert!(passes_hits_filter(&clean, 100.0, 0.0));
        assert!(!passes_hits_filter(&prompt, 100.0, 0.0));

        // Missing the next outer layer
        let late = track_with(&[SctBarrel0]);
        assert!(!passes_hits_filter(&late, 100.0, 0.0));
    }

    #[test]
    fn test_around_zone_ignores_straddled_layer() {
        let with_layer = track_with(&[PixelBarrel2, PixelBarrel3]);
        let without_layer = track_with(&[PixelBarrel3]);
        assert!(passes_hits_filter(&with_layer, 90.0, 0.0));
        assert!(passes_hits_filter(&without_layer, 90.0, 0.0));
    }

    #[test]
    fn test_inside_silicon_accepts_everything() {
        assert!(passes_hits_filter(&track_with(&[]), 450.0, 0.0));
        assert!(passes_hits_filter(&track_with(&[PixelBarrel0]), 450.0, 0.0));
    }

    fn member(key: usize, pt: f64) -> TrackAtVertex {
        TrackAtVertex {
            key: TrackKey(key),
            weight: 0.9,
            perigee_at_vertex: Some(Perigee::new(0.0, 0.0, 0.0, FRAC_PI_2, 1.0 / pt, Vector3::zeros())),
        }
    }

    #[test]
    fn test_groom_removes_inconsistent_track() {
        let good = track_with(&[PixelBarrel3, SctBarrel0]);
        let bad = track_with(&[PixelBarrel0, PixelBarrel1, PixelBarrel2, PixelBarrel3]);
        let registry = TrackRegistry::new(vec![&good, &bad]);

        let mut vertex = FittedVertex {
            position: Vector3::new(100.0, 0.0, 0.0),
            covariance: Matrix3::identity(),
            chi2: 1.0,
            ndof: 1.0,
            tracks: vec![member(0, 3000.0), member(1, 1000.0)],
        };
        let mut fit_list = vec![TrackKey(0), TrackKey(1)];

        let score = groom(&mut vertex, &mut fit_list, &registry, 0.02);
        // 0.4 * 1/2 + 0.6 * 1000/4000
        assert_relative_eq!(score, 0.35, epsilon = 1e-9);
        assert_eq!(fit_list, vec![TrackKey(0)]);
        assert!(!vertex.contains(TrackKey(1)));
    }

    #[test]
    fn test_groom_consistent_vertex_scores_zero() {
        let good = track_with(&[PixelBarrel3, SctBarrel0]);
        let registry = TrackRegistry::new(vec![&good, &good]);
        let mut vertex = FittedVertex {
            position: Vector3::new(100.0, 0.0, 0.0),
            covariance: Matrix3::identity(),
            chi2: 1.0,
            ndof: 1.0,
            tracks: vec![member(0, 3000.0), member(1, 1000.0)],
        };
        let mut fit_list = vec![TrackKey(0), TrackKey(1)];
        assert_eq!(groom(&mut vertex, &mut fit_list, &registry, 0.02), 0.0);
        assert_eq!(fit_list.len(), 2);
        assert_eq!(vertex.tracks.len(), 2);
    }

    #[test]
    fn test_groom_without_members_scores_zero() {
        let registry = TrackRegistry::new(vec![]);
        let mut vertex = FittedVertex {
            position: Vector3::new(100.0, 0.0, 0.0),
            covariance: Matrix3::identity(),
            chi2: 0.0,
            ndof: 1.0,
            tracks: Vec::new(),
        };
        let mut fit_list = Vec::new();
        assert_eq!(groom(&mut vertex, &mut fit_list, &registry, 0.02), 0.0);
    }
}
