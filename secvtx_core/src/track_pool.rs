//! The seed-track pool and the rules that shrink it.
//!
//! The pool holds the keys of tracks still available for seeding. It only
//! grows when a new vertex robs a loosely attached track from an older one;
//! every other operation removes keys.

use nalgebra::{Matrix3, Vector3};
use tracing::{debug, error, warn};

use crate::compatibility::compatibility;
use crate::services::LinearizedTrackFactory;
use crate::track::{TrackKey, TrackRegistry};
use crate::vertex::FittedVertex;

// ============================================================================
// SEED TRACK POOL
// ============================================================================

/// Ordered set of track keys. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedTrackPool {
    keys: Vec<TrackKey>,
}

impl SeedTrackPool {
    pub fn new(keys: impl IntoIterator<Item = TrackKey>) -> Self {
        let mut pool = Self::default();
        for key in keys {
            pool.reinsert(key);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: TrackKey) -> bool {
        self.keys.contains(&key)
    }

    pub fn keys(&self) -> &[TrackKey] {
        &self.keys
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&mut self, key: TrackKey) -> bool {
        match self.keys.iter().position(|k| *k == key) {
            Some(pos) => {
                self.keys.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Put a robbed track back. No-op if it is already pooled.
    pub fn reinsert(&mut self, key: TrackKey) {
        if !self.contains(key) {
            self.keys.push(key);
        }
    }
}

// ============================================================================
// POOL MANAGER
// ============================================================================

/// Applies vertex outcomes to the pool.
pub struct TrackPoolManager<'r, 'a> {
    registry: &'r TrackRegistry<'a>,
    linearizer: &'r dyn LinearizedTrackFactory,
    min_weight: f64,
    max_compatibility: f64,
}

impl<'r, 'a> TrackPoolManager<'r, 'a> {
    pub fn new(
        registry: &'r TrackRegistry<'a>,
        linearizer: &'r dyn LinearizedTrackFactory,
        min_weight: f64,
        max_compatibility: f64,
    ) -> Self {
        Self {
            registry,
            linearizer,
            min_weight,
            max_compatibility,
        }
    }

    /// Compatibility of a registered track with a vertex. Tracks that cannot
    /// be evaluated count as incompatible.
    pub fn compatibility_of(&self, key: TrackKey, covariance: &Matrix3<f64>, position: &Vector3<f64>) -> f64 {
        let Some(track) = self.registry.get(key) else {
            error!("Track {:?} is not in the registry", key);
            return f64::MAX;
        };
        match compatibility(self.linearizer, track, covariance, position) {
            Ok(chi2) => chi2,
            Err(e) => {
                warn!("Compatibility of track {} unavailable: {}", track.id, e);
                f64::MAX
            }
        }
    }

    /// Take every track of a failed fit out of the pool.
    pub fn remove_all_from(&self, pool: &mut SeedTrackPool, fit_list: &[TrackKey]) {
        for key in fit_list {
            if !pool.remove(*key) {
                error!("Track {:?} of a bad fit is not in the seed pool", key);
            }
        }
    }

    /// Shrink the pool around a fitted vertex.
    ///
    /// - Full members leave the pool and the fit list.
    /// - Fit-list leftovers compatible with the vertex leave the pool.
    /// - Incompatible leftovers stay pooled and are detached from the vertex.
    pub fn remove_compatible_tracks(
        &self,
        vertex: &mut FittedVertex,
        fit_list: &mut Vec<TrackKey>,
        pool: &mut SeedTrackPool,
    ) {
        let members: Vec<(TrackKey, bool)> = vertex
            .tracks
            .iter()
            .map(|t| (t.key, t.weight > self.min_weight))
            .collect();

        for (key, full) in members {
            if !pool.contains(key) {
                warn!("Vertex track {:?} is not in the seed pool", key);
            } else if full {
                pool.remove(key);
            }

            match fit_list.iter().position(|k| *k == key) {
                Some(pos) if full => {
                    fit_list.remove(pos);
                }
                Some(_) => {}
                None => warn!("Vertex track {:?} is not in the fit list", key),
            }
        }

        debug!("Outliers still to be considered: {}", fit_list.len());

        let covariance = vertex.covariance;
        let position = vertex.position;
        for key in fit_list.iter() {
            let chi2 = self.compatibility_of(*key, &covariance, &position);
            if chi2 < self.max_compatibility {
                if !pool.remove(*key) {
                    error!("Compatible track {:?} is not in the seed pool", key);
                }
            } else if vertex.detach(*key).is_some() {
                debug!("Detached incompatible track {:?} (chi2 = {:.2})", key, chi2);
            }
        }
    }
}
