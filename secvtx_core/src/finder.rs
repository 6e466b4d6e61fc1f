//! The iterative secondary-vertex finder.
//!
//! Each iteration runs the pipeline:
//! 1. Seed search on the remaining pool
//! 2. Perigee screening around the seed
//! 3. Adaptive fit and goodness gate
//! 4. Track reassignment ("robbing") from earlier vertices
//! 5. V0 / pointing classification
//! 6. Hit-pattern grooming (highest filter levels only)
//! 7. Acceptance and pool shrinking
//!
//! After the loop, vertices that lost tracks are refitted, and every
//! surviving track is linked back to its input id.

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use tracing::{debug, error, warn};

use crate::compatibility::vertex_distance;
use crate::config::FinderConfig;
use crate::error::VertexingError;
use crate::hit_pattern::groom;
use crate::observer::{
    IterationOutcome, IterationReport, NoopObserver, RejectReason, ScreeningReport, SeedReport,
    VertexingObserver,
};
use crate::services::{
    ImpactPointEstimator, LinearizedTrackFactory, ReferenceVertex, SeedFinder, TrackFilter,
    VertexFitter,
};
use crate::track::{Perigee, Track, TrackKey, TrackRegistry};
use crate::track_pool::{SeedTrackPool, TrackPoolManager};
use crate::v0::{classify, V0Classification};
use crate::vertex::{
    CandidateVertex, FitSummary, FittedVertex, SecondaryVertex, VertexTrack, VertexType,
};

/// Covariance scale of the loose constraint placed around each seed.
const SEED_CONSTRAINT_SCALE: f64 = 1e8;

// ============================================================================
// OUTPUT
// ============================================================================

/// Result of one [`IterativeVertexFinder::find_vertices`] call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FinderOutput {
    /// Accepted vertices in the order they were found
    pub vertices: Vec<SecondaryVertex>,

    /// Loop iterations performed
    pub iterations: usize,

    /// Tracks that passed the preselection
    pub selected_tracks: usize,

    /// How every iteration ended
    pub outcomes: Vec<IterationOutcome>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles an [`IterativeVertexFinder`] from its services.
pub struct FinderBuilder {
    config: FinderConfig,
    track_filters: Vec<Arc<dyn TrackFilter>>,
    seed_finder: Option<Arc<dyn SeedFinder>>,
    impact_estimator: Option<Arc<dyn ImpactPointEstimator>>,
    fitter: Option<Arc<dyn VertexFitter>>,
    linearizer: Option<Arc<dyn LinearizedTrackFactory>>,
    observer: Arc<dyn VertexingObserver>,
}

impl FinderBuilder {
    pub fn new(config: FinderConfig) -> Self {
        Self {
            config,
            track_filters: Vec::new(),
            seed_finder: None,
            impact_estimator: None,
            fitter: None,
            linearizer: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Add a preselection filter. Filters are applied in insertion order.
    pub fn with_track_filter(mut self, filter: Arc<dyn TrackFilter>) -> Self {
        self.track_filters.push(filter);
        self
    }

    pub fn with_seed_finder(mut self, seed_finder: Arc<dyn SeedFinder>) -> Self {
        self.seed_finder = Some(seed_finder);
        self
    }

    pub fn with_impact_estimator(mut self, estimator: Arc<dyn ImpactPointEstimator>) -> Self {
        self.impact_estimator = Some(estimator);
        self
    }

    pub fn with_fitter(mut self, fitter: Arc<dyn VertexFitter>) -> Self {
        self.fitter = Some(fitter);
        self
    }

    pub fn with_linearizer(mut self, linearizer: Arc<dyn LinearizedTrackFactory>) -> Self {
        self.linearizer = Some(linearizer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn VertexingObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<IterativeVertexFinder, VertexingError> {
        self.config.validate()?;
        Ok(IterativeVertexFinder {
            seed_finder: self
                .seed_finder
                .ok_or(VertexingError::MissingService("seed finder"))?,
            impact_estimator: self
                .impact_estimator
                .ok_or(VertexingError::MissingService("impact point estimator"))?,
            fitter: self
                .fitter
                .ok_or(VertexingError::MissingService("vertex fitter"))?,
            linearizer: self
                .linearizer
                .ok_or(VertexingError::MissingService("linearized track factory"))?,
            track_filters: self.track_filters,
            observer: self.observer,
            config: self.config,
            primary_vertex: Vector3::zeros(),
        })
    }
}

// ============================================================================
// FINDER
// ============================================================================

/// Seeds, fits, prunes and classifies secondary vertices.
///
/// The finder is immutable while it runs; all per-event state lives inside
/// [`find_vertices`](Self::find_vertices).
pub struct IterativeVertexFinder {
    config: FinderConfig,
    track_filters: Vec<Arc<dyn TrackFilter>>,
    seed_finder: Arc<dyn SeedFinder>,
    impact_estimator: Arc<dyn ImpactPointEstimator>,
    fitter: Arc<dyn VertexFitter>,
    linearizer: Arc<dyn LinearizedTrackFactory>,
    observer: Arc<dyn VertexingObserver>,
    primary_vertex: Vector3<f64>,
}

/// Mutable state of one event.
struct EventState {
    pool: SeedTrackPool,
    vertices: Vec<CandidateVertex>,
}

impl IterativeVertexFinder {
    pub fn builder(config: FinderConfig) -> FinderBuilder {
        FinderBuilder::new(config)
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// Approximate primary-vertex position used for seeding and pointing.
    pub fn set_primary_vertex(&mut self, position: Vector3<f64>) {
        self.primary_vertex = position;
    }

    pub fn primary_vertex(&self) -> &Vector3<f64> {
        &self.primary_vertex
    }

    /// Find secondary vertices among `tracks`.
    ///
    /// Never fails: per-event problems are logged and at worst shrink the
    /// output.
    pub fn find_vertices(&self, tracks: &[Track]) -> FinderOutput {
        let reference = ReferenceVertex::null();
        let selected: Vec<&Track> = tracks
            .iter()
            .filter(|track| self.track_filters.iter().all(|f| f.accept(track, &reference)))
            .collect();
        debug!("Of {} tracks {} survived the preselection", tracks.len(), selected.len());

        let registry = TrackRegistry::new(selected);
        let mut output = FinderOutput {
            selected_tracks: registry.len(),
            ..Default::default()
        };

        if self.config.do_max_tracks_cut && registry.len() > self.config.max_tracks {
            warn!(
                "{} tracks exceed the maximum of {}, skipping vertexing",
                registry.len(),
                self.config.max_tracks
            );
            return output;
        }

        let manager = TrackPoolManager::new(
            &registry,
            self.linearizer.as_ref(),
            self.config.min_track_weight_at_vtx,
            self.config.max_compatibility_cut_seeding,
        );
        let mut state = EventState {
            pool: SeedTrackPool::new(registry.keys()),
            vertices: Vec::new(),
        };

        while state.pool.len() > 1 && output.iterations < self.config.max_vertices {
            let iteration = output.iterations;
            output.iterations += 1;
            debug!("Iteration {} with {} seed tracks", iteration, state.pool.len());

            let outcome = self.iterate(iteration, &registry, &manager, &mut state);
            self.observer.on_iteration(&IterationReport {
                iteration,
                outcome: outcome.clone(),
                pool_size: state.pool.len(),
            });

            let stop = outcome.stops_search();
            output.outcomes.push(outcome);
            if stop {
                break;
            }
        }
        debug!("Iterations done: {}", output.iterations);

        let vertices = self.refit_robbed(&registry, &manager, state.vertices);
        output.vertices = self.link_tracks(&registry, vertices);

        debug!(
            "Found {} secondary vertices from {} tracks in {} iterations",
            output.vertices.len(),
            output.selected_tracks,
            output.iterations
        );
        output
    }

    // ========================================================================
    // ITERATION
    // ========================================================================

    fn iterate(
        &self,
        iteration: usize,
        registry: &TrackRegistry<'_>,
        manager: &TrackPoolManager<'_, '_>,
        state: &mut EventState,
    ) -> IterationOutcome {
        let min_weight = self.config.min_track_weight_at_vtx;

        // Seed
        let perigees: Vec<&Perigee> = state
            .pool
            .keys()
            .iter()
            .filter_map(|key| registry.get(*key))
            .map(|track| &track.perigee)
            .collect();
        let seed = self.seed_finder.find_seed(self.primary_vertex.xy(), &perigees);
        self.observer.on_seed(&SeedReport {
            iteration,
            seed,
            constraint_covariance: Matrix3::identity() * SEED_CONSTRAINT_SCALE,
            pool_size: state.pool.len(),
        });
        debug!("Seed at ({:.3}, {:.3}, {:.3})", seed.x, seed.y, seed.z);

        if seed.z == 0.0 {
            debug!("No seed found: no further vertices in event");
            return IterationOutcome::NoSeed;
        }

        // Screening
        let input_tracks = state.pool.len();
        let (mut fit_list, split_list) = self.screen(registry, &state.pool, &seed);
        self.observer.on_screening(&ScreeningReport {
            iteration,
            fit_tracks: fit_list.clone(),
            split_tracks: split_list,
        });

        if fit_list.is_empty() {
            debug!("No track compatible with the seed, stopping the search");
            return IterationOutcome::EmptyFitList;
        }

        // Fit
        let fit = self.fit(registry, &fit_list, &seed);
        let summary = FitSummary::of(fit.as_ref(), min_weight);
        debug!("Fit: ndof = {:.2}, full members = {}", summary.ndof, summary.n_tracks);

        let mut vertex = match fit {
            Some(vertex) if summary.is_good() => vertex,
            other => {
                self.discard_bad_fit(manager, other, &mut fit_list, &mut state.pool);
                return IterationOutcome::BadFit(summary);
            }
        };

        // Reassignment
        let mut robbed = 0;
        if self.config.reassign_tracks_after_first_fit && !self.config.create_split_vertices {
            robbed = self.reassign_tracks(manager, &vertex, &mut fit_list, state);
            if robbed > 0 {
                debug!("Refit with {} additional tracks from other vertices", robbed);
                let refit = self.fit(registry, &fit_list, &vertex.position);
                let summary = FitSummary::of(refit.as_ref(), min_weight);
                vertex = match refit {
                    Some(vertex) if summary.is_good() => vertex,
                    other => {
                        debug!("Adding robbed tracks produced an invalid vertex");
                        self.discard_bad_fit(manager, other, &mut fit_list, &mut state.pool);
                        return IterationOutcome::BadFitAfterReassignment(summary);
                    }
                };
            }
        }

        // Classification
        let mut candidate = CandidateVertex::new(vertex);
        candidate.vertex_type = VertexType::SecVtx;
        let n_tracks = candidate.fit.count_full_members(min_weight);
        let v0 = self.classify_vertex(&candidate.fit);

        if let Some(reason) = self.classification_veto(&v0) {
            manager.remove_compatible_tracks(&mut candidate.fit, &mut fit_list, &mut state.pool);
            return IterationOutcome::Rejected(reason);
        }

        apply_classification(&mut candidate, &v0, n_tracks);
        candidate.decorations.input_tracks = input_tracks;
        if v0.is_v0 {
            candidate.vertex_type = VertexType::V0Vtx;
        }

        // Grooming
        if self.config.filter_level > 4 && n_tracks == 2 && candidate.vertex_type != VertexType::V0Vtx {
            if let Err(reason) = self.groom_candidate(registry, manager, &mut candidate, &mut fit_list, state) {
                return IterationOutcome::Rejected(reason);
            }
        }

        // Acceptance
        manager.remove_compatible_tracks(&mut candidate.fit, &mut fit_list, &mut state.pool);
        candidate.decorations.num_tracks = candidate.fit.count_full_members(min_weight);

        if self.config.create_split_vertices {
            return IterationOutcome::Suppressed;
        }

        let n_tracks = candidate.decorations.num_tracks;
        debug!(
            "Stored {} vertex with {} tracks at ({:.2}, {:.2}, {:.2})",
            candidate.vertex_type.name(),
            n_tracks,
            candidate.fit.position.x,
            candidate.fit.position.y,
            candidate.fit.position.z
        );
        state.vertices.push(candidate);
        IterationOutcome::Accepted { n_tracks, robbed }
    }

    /// Select the pool tracks that take part in the fit around `seed`.
    ///
    /// Returns the fit list and, in split mode, the split list.
    fn screen(
        &self,
        registry: &TrackRegistry<'_>,
        pool: &SeedTrackPool,
        seed: &Vector3<f64>,
    ) -> (Vec<TrackKey>, Vec<TrackKey>) {
        let n = pool.len();
        let split = self.config.create_split_vertices;
        let fraction = self.config.split_vertices_trk_inv_fraction;

        let mut fit_list = Vec::new();
        let mut split_list = Vec::new();
        let mut counter = 0usize;

        for key in pool.keys() {
            let Some(track) = registry.get(*key) else {
                error!("Pool track {:?} is not in the registry", key);
                continue;
            };

            if n <= 2 || (n <= 3 && !split) {
                fit_list.push(*key);
                counter += 1;
                continue;
            }

            if split && n <= fraction.saturating_mul(4) {
                // Few tracks left: alternate regardless of position
                if counter % fraction == 0 {
                    fit_list.push(*key);
                } else {
                    split_list.push(*key);
                }
                counter += 1;
                continue;
            }

            let distance = match self.impact_estimator.estimate(track, seed) {
                Ok(distance) => distance,
                Err(e) => {
                    warn!("Impact point estimation failed for track {}: {}", track.id, e);
                    0.0
                }
            };
            if distance < 0.0 {
                warn!("Negative distance {} between track {} and seed", distance, track.id);
            }

            let mut error = track.perigee.impact_variance().map_or(0.0, f64::sqrt);
            if error == 0.0 {
                error!("Track {} has zero impact parameter error", track.id);
                error = 1.0;
            }

            if distance / error < self.config.significance_cut_seeding {
                if !split || counter % fraction == 0 {
                    fit_list.push(*key);
                } else {
                    split_list.push(*key);
                }
                counter += 1;
            }
        }

        debug!("Considering {} tracks for the fit, {} for the split vertex", fit_list.len(), split_list.len());
        (fit_list, split_list)
    }

    /// Fit the given tracks. A single track never produces a vertex.
    fn fit(&self, registry: &TrackRegistry<'_>, fit_list: &[TrackKey], start: &Vector3<f64>) -> Option<FittedVertex> {
        if fit_list.len() < 2 {
            return None;
        }
        let links: Vec<_> = fit_list.iter().filter_map(|key| registry.link(*key)).collect();
        self.fitter.fit(&links, start)
    }

    /// Shrink the pool after a fit failed the goodness gate.
    fn discard_bad_fit(
        &self,
        manager: &TrackPoolManager<'_, '_>,
        fit: Option<FittedVertex>,
        fit_list: &mut Vec<TrackKey>,
        pool: &mut SeedTrackPool,
    ) {
        match fit {
            Some(mut vertex) => manager.remove_compatible_tracks(&mut vertex, fit_list, pool),
            None => manager.remove_all_from(pool, fit_list),
        }
        debug!("Going to new iteration with {} seed tracks after bad vertex", pool.len());
    }

    /// Move loosely attached tracks of earlier vertices to `new_vertex` when
    /// they are strictly more compatible with it. Returns how many moved.
    fn reassign_tracks(
        &self,
        manager: &TrackPoolManager<'_, '_>,
        new_vertex: &FittedVertex,
        fit_list: &mut Vec<TrackKey>,
        state: &mut EventState,
    ) -> usize {
        let min_weight = self.config.min_track_weight_at_vtx;
        let mut added = 0;

        for old in state.vertices.iter_mut() {
            let separation = vertex_distance(new_vertex, &old.fit);
            let separated = self.config.filter_level < 2 || separation > self.config.seeds_minimum_distance;

            let loose: Vec<TrackKey> = old
                .fit
                .tracks
                .iter()
                .filter(|t| t.weight <= min_weight)
                .map(|t| t.key)
                .collect();

            let mut robbed = 0u32;
            for key in loose {
                let chi2_new = manager.compatibility_of(key, &new_vertex.covariance, &new_vertex.position);
                let chi2_old = manager.compatibility_of(key, &old.fit.covariance, &old.fit.position);

                if chi2_new < chi2_old && separated {
                    debug!(
                        "Track {:?} more compatible with new vertex ({:.2} < {:.2})",
                        key, chi2_new, chi2_old
                    );
                    old.fit.detach(key);
                    state.pool.reinsert(key);
                    if !fit_list.contains(&key) {
                        fit_list.push(key);
                    }
                    robbed += 1;
                }
            }

            if robbed > 0 {
                old.decorations.robbed += robbed;
                added += robbed as usize;
            }
        }
        added
    }

    fn classify_vertex(&self, vertex: &FittedVertex) -> V0Classification {
        let min_weight = self.config.min_track_weight_at_vtx;
        if vertex.count_full_members(min_weight) < 2 {
            return V0Classification::default();
        }
        classify(&vertex.momenta(min_weight), &vertex.position, &self.primary_vertex)
    }

    fn points_backwards(&self, v0: &V0Classification) -> bool {
        v0.direction
            .map_or(false, |dir| dir < self.config.momentum_projection_on_direction)
    }

    fn classification_veto(&self, v0: &V0Classification) -> Option<RejectReason> {
        if self.config.filter_level >= 3 && v0.is_v0 {
            return Some(RejectReason::V0Veto);
        }
        if self.config.filter_level >= 2 && self.points_backwards(v0) {
            return Some(RejectReason::PointingBackwards);
        }
        None
    }

    /// Drop hit-inconsistent members of a two-track candidate and refit.
    fn groom_candidate(
        &self,
        registry: &TrackRegistry<'_>,
        manager: &TrackPoolManager<'_, '_>,
        candidate: &mut CandidateVertex,
        fit_list: &mut Vec<TrackKey>,
        state: &mut EventState,
    ) -> Result<(), RejectReason> {
        let min_weight = self.config.min_track_weight_at_vtx;

        let mut groomed = candidate.fit.clone();
        let score = groom(&mut groomed, fit_list, registry, min_weight);
        candidate.decorations.hits_filter = score;
        debug!("Hit pattern grooming score {:.3}", score);

        if score > self.config.track_inner_outer_fraction {
            manager.remove_compatible_tracks(&mut groomed, fit_list, &mut state.pool);
            return Err(RejectReason::HitPattern);
        }
        if score <= 0.0 {
            return Ok(());
        }

        let refit = self.fit(registry, fit_list, &candidate.fit.position);
        let summary = FitSummary::of(refit.as_ref(), min_weight);
        let refit = match refit {
            Some(vertex) if summary.is_good() => vertex,
            _ => {
                manager.remove_compatible_tracks(&mut candidate.fit, fit_list, &mut state.pool);
                return Err(RejectReason::GroomedFitFailed);
            }
        };

        candidate.fit = refit;
        let v0 = self.classify_vertex(&candidate.fit);
        if v0.is_v0 || self.points_backwards(&v0) {
            manager.remove_compatible_tracks(&mut candidate.fit, fit_list, &mut state.pool);
            return Err(if v0.is_v0 {
                RejectReason::GroomedV0Veto
            } else {
                RejectReason::PointingBackwards
            });
        }

        candidate.vertex_type = VertexType::SecVtx;
        apply_classification(candidate, &v0, summary.n_tracks);
        debug!("Grooming kept {} tracks", summary.n_tracks);
        Ok(())
    }

    // ========================================================================
    // FINALIZATION
    // ========================================================================

    /// Refit vertices that lost tracks to later ones. A refit replaces the
    /// stored vertex only if it is good and has a strictly smaller chi2/ndof.
    fn refit_robbed(
        &self,
        registry: &TrackRegistry<'_>,
        manager: &TrackPoolManager<'_, '_>,
        vertices: Vec<CandidateVertex>,
    ) -> Vec<CandidateVertex> {
        let min_weight = self.config.min_track_weight_at_vtx;
        let mut kept = Vec::with_capacity(vertices.len());

        for mut candidate in vertices {
            if candidate.decorations.robbed == 0 {
                kept.push(candidate);
                continue;
            }

            let mut fit_list: Vec<TrackKey> = candidate.fit.tracks.iter().map(|t| t.key).collect();
            let Some(mut refit) = self.fit(registry, &fit_list, &candidate.fit.position) else {
                kept.push(candidate);
                continue;
            };

            let mut scratch_pool = SeedTrackPool::new(fit_list.iter().copied());
            manager.remove_compatible_tracks(&mut refit, &mut fit_list, &mut scratch_pool);

            let good = FitSummary::of(Some(&refit), min_weight).is_good();
            if !good || refit.reduced_chi2() >= candidate.fit.reduced_chi2() {
                debug!("Refit of robbed vertex does not improve chi2/ndof, keeping original");
                kept.push(candidate);
                continue;
            }

            candidate.fit = refit;
            let n_tracks = candidate.fit.count_full_members(min_weight);
            let v0 = self.classify_vertex(&candidate.fit);
            apply_classification(&mut candidate, &v0, n_tracks);
            candidate.vertex_type = if v0.is_v0 && n_tracks == 2 {
                VertexType::V0Vtx
            } else {
                VertexType::SecVtx
            };

            let v0_veto = self.config.filter_level >= 3 && n_tracks == 2 && v0.is_v0;
            let pointing_veto = self.config.filter_level > 2 && self.points_backwards(&v0);
            if v0_veto || pointing_veto {
                debug!("Refitted vertex vetoed (v0: {}, pointing: {})", v0_veto, pointing_veto);
                continue;
            }
            kept.push(candidate);
        }
        kept
    }

    /// Resolve every vertex track to its input id and compute the pT² sum.
    fn link_tracks(&self, registry: &TrackRegistry<'_>, vertices: Vec<CandidateVertex>) -> Vec<SecondaryVertex> {
        let min_weight = self.config.min_track_weight_at_vtx;
        let mut linked: HashSet<TrackKey> = HashSet::new();

        vertices
            .into_iter()
            .map(|mut candidate| {
                let mut tracks = Vec::with_capacity(candidate.fit.tracks.len());
                let mut sum_pt2 = 0.0;

                for at_vertex in candidate.fit.tracks.drain(..) {
                    let Some(track) = registry.get(at_vertex.key) else {
                        error!("Cannot resolve vertex track {:?} to an input track", at_vertex.key);
                        continue;
                    };
                    if !linked.insert(at_vertex.key) {
                        error!("Track {} is already linked to an earlier vertex", track.id);
                        continue;
                    }
                    if let Some(perigee) = &at_vertex.perigee_at_vertex {
                        let pt_gev = perigee.pt() * 1e-3;
                        sum_pt2 += pt_gev * pt_gev;
                    }
                    tracks.push(VertexTrack {
                        track_id: track.id,
                        weight: at_vertex.weight,
                        perigee_at_vertex: at_vertex.perigee_at_vertex,
                    });
                }

                candidate.decorations.sum_pt2 = sum_pt2;
                candidate.decorations.num_tracks = tracks.iter().filter(|t| t.weight > min_weight).count();

                SecondaryVertex {
                    position: candidate.fit.position,
                    covariance: candidate.fit.covariance,
                    chi2: candidate.fit.chi2,
                    ndof: candidate.fit.ndof,
                    vertex_type: candidate.vertex_type,
                    tracks,
                    decorations: candidate.decorations,
                }
            })
            .collect()
    }
}

fn apply_classification(candidate: &mut CandidateVertex, v0: &V0Classification, n_tracks: usize) {
    candidate.decorations.mass = v0.mass;
    candidate.decorations.energy = v0.energy;
    candidate.decorations.direction = v0.direction;
    candidate.decorations.num_tracks = n_tracks;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::LinearizedTrack;
    use crate::track::{DetectorLayer, HitPattern, TrackId, TrackLink};
    use crate::v0::{KSHORT_MASS, PION_MASS};
    use crate::vertex::TrackAtVertex;
    use nalgebra::{Matrix5, SMatrix, Vector2, Vector5};
    use std::f64::consts::FRAC_PI_2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Mock services
    // ------------------------------------------------------------------

    /// Returns a fixed seed when at least two perigees are offered.
    struct FixedSeed(Vector3<f64>);

    impl SeedFinder for FixedSeed {
        fn find_seed(&self, _xy: Vector2<f64>, perigees: &[&Perigee]) -> Vector3<f64> {
            if perigees.len() < 2 {
                return Vector3::zeros();
            }
            self.0
        }
    }

    struct ZeroImpact;

    impl ImpactPointEstimator for ZeroImpact {
        fn estimate(&self, _track: &Track, _point: &Vector3<f64>) -> Result<f64, VertexingError> {
            Ok(0.0)
        }
    }

    /// Places the vertex at the start point with every track at high weight.
    #[derive(Default)]
    struct StartPointFitter {
        calls: AtomicUsize,
    }

    impl VertexFitter for StartPointFitter {
        fn fit(&self, tracks: &[crate::track::TrackLink<'_>], start: &Vector3<f64>) -> Option<FittedVertex> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let weight = 0.98;
            Some(FittedVertex {
                position: *start,
                covariance: Matrix3::identity() * 0.01,
                chi2: 0.5,
                ndof: 2.0 * weight * tracks.len() as f64 - 3.0,
                tracks: tracks
                    .iter()
                    .map(|link| TrackAtVertex {
                        key: link.key,
                        weight,
                        perigee_at_vertex: Some(link.track.perigee.clone()),
                    })
                    .collect(),
            })
        }
    }

    type FitScript = dyn Fn(&[TrackLink<'_>], &Vector3<f64>) -> Option<FittedVertex> + Send + Sync;

    /// Fitter driven by a closure.
    struct ScriptedFitter(Box<FitScript>);

    impl VertexFitter for ScriptedFitter {
        fn fit(&self, tracks: &[TrackLink<'_>], start: &Vector3<f64>) -> Option<FittedVertex> {
            (self.0)(tracks, start)
        }
    }

    /// Vertex at `start` with per-track weights and `ndof = 2 Σw - 3`.
    fn weighted_fit(tracks: &[TrackLink<'_>], start: &Vector3<f64>, weight: impl Fn(&Track) -> f64) -> FittedVertex {
        let tracks: Vec<TrackAtVertex> = tracks
            .iter()
            .map(|link| TrackAtVertex {
                key: link.key,
                weight: weight(link.track),
                perigee_at_vertex: Some(link.track.perigee.clone()),
            })
            .collect();
        let weight_sum: f64 = tracks.iter().map(|t| t.weight).sum();
        FittedVertex {
            position: *start,
            covariance: Matrix3::identity() * 0.01,
            chi2: 0.5,
            ndof: 2.0 * weight_sum - 3.0,
            tracks,
        }
    }

    /// Hands out the given seeds in order, then the no-seed sentinel.
    struct SeedSequence(Mutex<Vec<Vector3<f64>>>);

    impl SeedSequence {
        fn new(mut seeds: Vec<Vector3<f64>>) -> Self {
            seeds.reverse();
            Self(Mutex::new(seeds))
        }
    }

    impl SeedFinder for SeedSequence {
        fn find_seed(&self, _xy: Vector2<f64>, _perigees: &[&Perigee]) -> Vector3<f64> {
            self.0.lock().unwrap().pop().unwrap_or_else(Vector3::zeros)
        }
    }

    /// Residual (d0 - x, 0): compatibility is (d0 - x)².
    struct OffsetLinearizer;

    impl LinearizedTrackFactory for OffsetLinearizer {
        fn linearize(&self, track: &Track, position: &Vector3<f64>) -> Result<LinearizedTrack, VertexingError> {
            Ok(LinearizedTrack {
                expected_parameters: Vector5::new(track.perigee.d0() - position.x, 0.0, 0.0, 1.0, 1e-3),
                expected_covariance: Matrix5::identity(),
                position_jacobian: SMatrix::<f64, 5, 3>::zeros(),
            })
        }
    }

    struct RejectAll;

    impl TrackFilter for RejectAll {
        fn accept(&self, _track: &Track, _reference: &ReferenceVertex) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seeds: AtomicUsize,
        outcomes: Mutex<Vec<IterationOutcome>>,
    }

    impl VertexingObserver for RecordingObserver {
        fn on_seed(&self, report: &SeedReport) {
            assert_eq!(report.constraint_covariance, Matrix3::identity() * 1e8);
            self.seeds.fetch_add(1, Ordering::SeqCst);
        }

        fn on_iteration(&self, report: &IterationReport) {
            self.outcomes.lock().unwrap().push(report.outcome.clone());
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    const SEED: Vector3<f64> = Vector3::new(100.0, 0.0, 5.0);

    fn finder_with(config: FinderConfig, fitter: Arc<StartPointFitter>) -> IterativeVertexFinder {
        IterativeVertexFinder::builder(config)
            .with_seed_finder(Arc::new(FixedSeed(SEED)))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(fitter)
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap()
    }

    fn track(id: u64, phi: f64, p: f64, layers: &[DetectorLayer]) -> Track {
        let cov = Matrix5::from_diagonal(&Vector5::new(0.01, 0.01, 1e-6, 1e-6, 1e-12));
        Track::new(
            id,
            Perigee::new(0.0, 0.0, phi, FRAC_PI_2, 1.0 / p, Vector3::zeros()).with_covariance(cov),
            HitPattern::from_layers(layers),
        )
    }

    /// Two tracks at 90 degrees: far from any V0 mass.
    fn wide_pair(layers: &[DetectorLayer]) -> Vec<Track> {
        vec![track(1, 0.0, 1000.0, layers), track(2, FRAC_PI_2, 1000.0, layers)]
    }

    /// Two tracks with a K-short invariant mass under the pion hypothesis.
    fn kshort_pair() -> Vec<Track> {
        let p_star = (KSHORT_MASS * KSHORT_MASS / 4.0 - PION_MASS * PION_MASS).sqrt();
        let p = (500.0f64 * 500.0 + p_star * p_star).sqrt();
        let phi = p_star.atan2(500.0);
        vec![track(1, phi, p, &[]), track(2, -phi, p, &[])]
    }

    const CLEAN_AT_100MM: [DetectorLayer; 3] =
        [DetectorLayer::PixelBarrel3, DetectorLayer::SctBarrel0, DetectorLayer::SctBarrel1];
    const PROMPT: [DetectorLayer; 5] = [
        DetectorLayer::PixelBarrel0,
        DetectorLayer::PixelBarrel1,
        DetectorLayer::PixelBarrel2,
        DetectorLayer::PixelBarrel3,
        DetectorLayer::SctBarrel0,
    ];

    // ------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------

    #[test]
    fn test_builder_requires_services() {
        let result = IterativeVertexFinder::builder(FinderConfig::default())
            .with_seed_finder(Arc::new(FixedSeed(SEED)))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build();
        assert!(matches!(result, Err(VertexingError::MissingService("vertex fitter"))));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = FinderConfig {
            max_vertices: 0,
            ..Default::default()
        };
        let result = IterativeVertexFinder::builder(config).build();
        assert!(matches!(result, Err(VertexingError::InvalidConfig(_))));
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_two_track_acceptance() {
        let fitter = Arc::new(StartPointFitter::default());
        let finder = finder_with(FinderConfig::default(), fitter.clone());
        let tracks = wide_pair(&CLEAN_AT_100MM);

        let output = finder.find_vertices(&tracks);

        assert_eq!(output.vertices.len(), 1);
        let vertex = &output.vertices[0];
        assert!(vertex.ndof > 0.0);
        assert_eq!(vertex.full_members(0.02).count(), 2);
        assert!(matches!(vertex.vertex_type, VertexType::SecVtx | VertexType::V0Vtx));
        assert_eq!(vertex.position, SEED);
        assert_eq!(vertex.decorations.input_tracks, 2);
        assert_eq!(vertex.decorations.num_tracks, 2);
        // 1 GeV² per track
        assert!((vertex.decorations.sum_pt2 - 2.0).abs() < 1e-9);

        let ids: Vec<u64> = vertex.tracks.iter().map(|t| t.track_id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(output.outcomes, vec![IterationOutcome::Accepted { n_tracks: 2, robbed: 0 }]);
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_seed_with_single_track() {
        let fitter = Arc::new(StartPointFitter::default());
        let finder = finder_with(FinderConfig::default(), fitter.clone());
        let tracks = vec![track(1, 0.0, 1000.0, &[])];

        let output = finder.find_vertices(&tracks);

        assert!(output.vertices.is_empty());
        assert_eq!(output.iterations, 0);
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_seed_sentinel_stops_search() {
        let fitter = Arc::new(StartPointFitter::default());
        let finder = IterativeVertexFinder::builder(FinderConfig::default())
            .with_seed_finder(Arc::new(FixedSeed(Vector3::new(10.0, 10.0, 0.0))))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(fitter.clone())
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap();

        let output = finder.find_vertices(&wide_pair(&[]));
        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::NoSeed]);
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiplicity_cut() {
        let config = FinderConfig {
            do_max_tracks_cut: true,
            max_tracks: 2,
            ..Default::default()
        };
        let fitter = Arc::new(StartPointFitter::default());
        let finder = finder_with(config, fitter.clone());
        let mut tracks = wide_pair(&[]);
        tracks.push(track(3, 1.0, 800.0, &[]));

        let output = finder.find_vertices(&tracks);
        assert!(output.vertices.is_empty());
        assert_eq!(output.iterations, 0);
        assert_eq!(output.selected_tracks, 3);
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_track_filters_are_chained() {
        let finder = IterativeVertexFinder::builder(FinderConfig::default())
            .with_track_filter(Arc::new(RejectAll))
            .with_seed_finder(Arc::new(FixedSeed(SEED)))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(Arc::new(StartPointFitter::default()))
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap();

        let output = finder.find_vertices(&wide_pair(&[]));
        assert_eq!(output.selected_tracks, 0);
        assert!(output.vertices.is_empty());
    }

    #[test]
    fn test_v0_veto_at_filter_level_three() {
        let config = FinderConfig {
            filter_level: 3,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));

        let output = finder.find_vertices(&kshort_pair());
        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::Rejected(RejectReason::V0Veto)]);
    }

    #[test]
    fn test_kshort_tagged_at_low_filter_level() {
        let finder = finder_with(FinderConfig::default(), Arc::new(StartPointFitter::default()));

        let output = finder.find_vertices(&kshort_pair());
        assert_eq!(output.vertices.len(), 1);
        assert_eq!(output.vertices[0].vertex_type, VertexType::V0Vtx);
        let mass = output.vertices[0].decorations.mass.unwrap();
        assert!((mass - KSHORT_MASS).abs() < 1e-3);
    }

    #[test]
    fn test_pointing_veto() {
        let config = FinderConfig {
            filter_level: 2,
            momentum_projection_on_direction: 0.0,
            ..Default::default()
        };
        let fitter = Arc::new(StartPointFitter::default());
        let finder = IterativeVertexFinder::builder(config)
            .with_seed_finder(Arc::new(FixedSeed(Vector3::new(-100.0, 0.0, 5.0))))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(fitter)
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap();

        // Momentum along +x, vertex at -x
        let output = finder.find_vertices(&kshort_pair());
        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::Rejected(RejectReason::PointingBackwards)]);
    }

    #[test]
    fn test_hit_pattern_veto_at_filter_level_five() {
        let config = FinderConfig {
            filter_level: 5,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));

        // Groomed tracks stay pooled, so the same rejection repeats up to the cap
        let output = finder.find_vertices(&wide_pair(&PROMPT));
        assert!(output.vertices.is_empty());
        assert_eq!(output.iterations, 20);
        assert!(output
            .outcomes
            .iter()
            .all(|o| *o == IterationOutcome::Rejected(RejectReason::HitPattern)));

        let output = finder.find_vertices(&wide_pair(&CLEAN_AT_100MM));
        assert_eq!(output.vertices.len(), 1);
        assert_eq!(output.vertices[0].decorations.hits_filter, 0.0);
    }

    #[test]
    fn test_split_mode_suppresses_storage() {
        let config = FinderConfig {
            create_split_vertices: true,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));

        let output = finder.find_vertices(&wide_pair(&[]));
        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::Suppressed]);
    }

    #[test]
    fn test_observer_sees_every_iteration() {
        let observer = Arc::new(RecordingObserver::default());
        let finder = IterativeVertexFinder::builder(FinderConfig::default())
            .with_seed_finder(Arc::new(FixedSeed(SEED)))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(Arc::new(StartPointFitter::default()))
            .with_linearizer(Arc::new(OffsetLinearizer))
            .with_observer(observer.clone())
            .build()
            .unwrap();

        let output = finder.find_vertices(&wide_pair(&[]));
        assert_eq!(observer.seeds.load(Ordering::SeqCst), output.iterations);
        assert_eq!(*observer.outcomes.lock().unwrap(), output.outcomes);
    }

    #[test]
    fn test_iteration_cap_bounds_output() {
        let config = FinderConfig {
            max_vertices: 1,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));
        let mut tracks = wide_pair(&[]);
        tracks.extend(vec![track(3, 1.0, 900.0, &[]), track(4, 2.0, 900.0, &[])]);

        // Every screened track joins the first fit; only one iteration is allowed
        let output = finder.find_vertices(&tracks);
        assert_eq!(output.iterations, 1);
        assert!(output.vertices.len() <= 1);
    }

    #[test]
    fn test_split_mode_with_huge_fraction_does_not_overflow() {
        let config = FinderConfig {
            create_split_vertices: true,
            split_vertices_trk_inv_fraction: usize::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));
        let mut tracks = wide_pair(&[]);
        tracks.extend(vec![track(3, 0.0, 1000.0, &[]), track(4, FRAC_PI_2, 1000.0, &[])]);

        // Only the first pooled track reaches the fit until two tracks remain
        let output = finder.find_vertices(&tracks);
        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes.len(), 3);
        assert!(matches!(output.outcomes[0], IterationOutcome::BadFit(_)));
        assert!(matches!(output.outcomes[1], IterationOutcome::BadFit(_)));
        assert_eq!(output.outcomes[2], IterationOutcome::Suppressed);
    }

    // ------------------------------------------------------------------
    // Grooming
    // ------------------------------------------------------------------

    /// Track 3 is loosely attached while the prompt track 1 takes part.
    /// With `refit_fails`, every fit without track 1 fails.
    fn shadowing_fitter(refit_fails: bool) -> Arc<ScriptedFitter> {
        Arc::new(ScriptedFitter(Box::new(move |links: &[TrackLink<'_>], start: &Vector3<f64>| {
            let shadowed = links.iter().any(|l| l.track.id == TrackId(1));
            if refit_fails && !shadowed {
                return None;
            }
            Some(weighted_fit(links, start, |t| {
                if shadowed && t.id == TrackId(3) {
                    0.01
                } else {
                    0.98
                }
            }))
        })))
    }

    fn grooming_finder(fitter: Arc<ScriptedFitter>) -> IterativeVertexFinder {
        let config = FinderConfig {
            filter_level: 5,
            ..Default::default()
        };
        IterativeVertexFinder::builder(config)
            .with_seed_finder(Arc::new(FixedSeed(SEED)))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(fitter)
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap()
    }

    #[test]
    fn test_grooming_drops_inconsistent_track_and_refits() {
        let finder = grooming_finder(shadowing_fitter(false));
        let tracks = vec![
            track(1, 1.0, 1000.0, &PROMPT),
            track(2, 0.0, 1000.0, &CLEAN_AT_100MM),
            track(3, FRAC_PI_2, 1000.0, &CLEAN_AT_100MM),
        ];

        let output = finder.find_vertices(&tracks);

        assert_eq!(output.outcomes, vec![IterationOutcome::Accepted { n_tracks: 2, robbed: 0 }]);
        assert_eq!(output.vertices.len(), 1);
        let vertex = &output.vertices[0];
        assert_eq!(vertex.vertex_type, VertexType::SecVtx);
        // 0.4 * 1/2 + 0.6 * 1000/2000
        assert!((vertex.decorations.hits_filter - 0.5).abs() < 1e-9);
        let members: Vec<(u64, f64)> = vertex.tracks.iter().map(|t| (t.track_id.0, t.weight)).collect();
        assert_eq!(members, vec![(2, 0.98), (3, 0.98)]);
    }

    #[test]
    fn test_grooming_rejects_failed_refit() {
        let finder = grooming_finder(shadowing_fitter(true));
        let tracks = vec![
            track(1, 1.0, 1000.0, &PROMPT),
            track(2, 0.0, 1000.0, &CLEAN_AT_100MM),
            track(3, FRAC_PI_2, 1000.0, &CLEAN_AT_100MM),
        ];

        let output = finder.find_vertices(&tracks);

        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::Rejected(RejectReason::GroomedFitFailed)]);
    }

    #[test]
    fn test_grooming_rejects_v0_after_refit() {
        let finder = grooming_finder(shadowing_fitter(false));
        // The clean pair is a K-short, the prompt pairing is not
        let mut tracks = vec![track(1, FRAC_PI_2, 1000.0, &PROMPT)];
        for (id, v0_track) in [2, 3].into_iter().zip(kshort_pair()) {
            tracks.push(Track::new(id, v0_track.perigee, HitPattern::from_layers(&CLEAN_AT_100MM)));
        }

        let output = finder.find_vertices(&tracks);

        assert!(output.vertices.is_empty());
        assert_eq!(output.outcomes, vec![IterationOutcome::Rejected(RejectReason::GroomedV0Veto)]);
    }

    // ------------------------------------------------------------------
    // Robbing during the search
    // ------------------------------------------------------------------

    /// A (d0 = 100) and B form the first vertex at x = 100 with R (d0 = 105)
    /// loosely attached. C and D (d0 = 108) form the second vertex at
    /// x = 108, which is closer to R.
    fn robbing_event() -> Vec<Track> {
        let cov = Matrix5::from_diagonal(&Vector5::new(0.01, 0.01, 1e-6, 1e-6, 1e-12));
        [(1, 100.0, 0.0), (2, 100.0, 1.0), (3, 105.0, 2.0), (4, 108.0, 0.5), (5, 108.0, 2.5)]
            .into_iter()
            .map(|(id, d0, phi)| {
                Track::new(
                    id,
                    Perigee::new(d0, 0.0, phi, FRAC_PI_2, 1e-3, Vector3::zeros()).with_covariance(cov),
                    HitPattern::default(),
                )
            })
            .collect()
    }

    /// Full weight for tracks within 1 mm of the start point in d0, loose otherwise.
    /// With `fail_with_three`, the three-track refit after robbing fails.
    fn robbing_finder(fail_with_three: bool) -> IterativeVertexFinder {
        let fitter = ScriptedFitter(Box::new(move |links: &[TrackLink<'_>], start: &Vector3<f64>| {
            if fail_with_three && links.len() == 3 {
                return None;
            }
            Some(weighted_fit(links, start, |t| {
                if (t.perigee.d0() - start.x).abs() < 1.0 {
                    0.98
                } else {
                    0.01
                }
            }))
        }));
        IterativeVertexFinder::builder(FinderConfig::default())
            .with_seed_finder(Arc::new(SeedSequence::new(vec![
                Vector3::new(100.0, 0.0, 5.0),
                Vector3::new(108.0, 0.0, 5.0),
            ])))
            .with_impact_estimator(Arc::new(ZeroImpact))
            .with_fitter(Arc::new(fitter))
            .with_linearizer(Arc::new(OffsetLinearizer))
            .build()
            .unwrap()
    }

    fn ids(vertex: &SecondaryVertex) -> Vec<u64> {
        vertex.tracks.iter().map(|t| t.track_id.0).collect()
    }

    #[test]
    fn test_robbed_track_joins_later_vertex() {
        let output = robbing_finder(false).find_vertices(&robbing_event());

        assert_eq!(
            output.outcomes,
            vec![
                IterationOutcome::Accepted { n_tracks: 2, robbed: 0 },
                IterationOutcome::Accepted { n_tracks: 2, robbed: 1 },
            ]
        );
        assert_eq!(output.vertices.len(), 2);
        assert_eq!(ids(&output.vertices[0]), vec![1, 2]);
        assert_eq!(output.vertices[0].decorations.robbed, 1);
        assert_eq!(ids(&output.vertices[1]), vec![4, 5, 3]);
        assert_eq!(output.vertices[1].position.x, 108.0);
    }

    #[test]
    fn test_bad_refit_after_robbing_discards_candidate() {
        let output = robbing_finder(true).find_vertices(&robbing_event());

        assert_eq!(output.outcomes.len(), 2);
        assert!(matches!(output.outcomes[1], IterationOutcome::BadFitAfterReassignment(_)));
        // The robbed track stays with neither vertex
        assert_eq!(output.vertices.len(), 1);
        assert_eq!(ids(&output.vertices[0]), vec![1, 2]);
        assert_eq!(output.vertices[0].decorations.robbed, 1);
    }

    // ------------------------------------------------------------------
    // Reassignment
    // ------------------------------------------------------------------

    fn vertex_at(x: f64, tracks: Vec<TrackAtVertex>) -> FittedVertex {
        FittedVertex {
            position: Vector3::new(x, 0.0, 0.0),
            covariance: Matrix3::identity(),
            chi2: 1.0,
            ndof: 1.0,
            tracks,
        }
    }

    fn loose(key: usize) -> TrackAtVertex {
        TrackAtVertex {
            key: TrackKey(key),
            weight: 0.01,
            perigee_at_vertex: None,
        }
    }

    fn d0_track(id: u64, d0: f64) -> Track {
        Track::new(id, Perigee::new(d0, 0.0, 0.0, 1.0, 1e-3, Vector3::zeros()), HitPattern(0))
    }

    #[test]
    fn test_reassignment_robs_more_compatible_track() {
        let finder = finder_with(FinderConfig::default(), Arc::new(StartPointFitter::default()));
        let owned = vec![d0_track(0, 0.0), d0_track(1, 0.0), d0_track(2, 10.0)];
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let mut state = EventState {
            pool: SeedTrackPool::default(),
            vertices: vec![CandidateVertex::new(vertex_at(0.0, vec![loose(2)]))],
        };
        let new_vertex = vertex_at(10.0, Vec::new());
        let mut fit_list = vec![TrackKey(0), TrackKey(1)];

        let robbed = finder.reassign_tracks(&manager, &new_vertex, &mut fit_list, &mut state);

        assert_eq!(robbed, 1);
        assert_eq!(fit_list, vec![TrackKey(0), TrackKey(1), TrackKey(2)]);
        assert!(state.pool.contains(TrackKey(2)));
        assert!(!state.vertices[0].fit.contains(TrackKey(2)));
        assert_eq!(state.vertices[0].decorations.robbed, 1);
    }

    #[test]
    fn test_reassignment_tie_keeps_track() {
        let finder = finder_with(FinderConfig::default(), Arc::new(StartPointFitter::default()));
        let owned = vec![d0_track(0, 10.0)];
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let mut state = EventState {
            pool: SeedTrackPool::default(),
            vertices: vec![CandidateVertex::new(vertex_at(0.0, vec![loose(0)]))],
        };
        // Equally far on the other side
        let new_vertex = vertex_at(20.0, Vec::new());
        let mut fit_list = Vec::new();

        assert_eq!(finder.reassign_tracks(&manager, &new_vertex, &mut fit_list, &mut state), 0);
        assert!(state.vertices[0].fit.contains(TrackKey(0)));
        assert!(state.pool.is_empty());
    }

    #[test]
    fn test_reassignment_needs_separation_at_filter_level_two() {
        let config = FinderConfig {
            filter_level: 2,
            seeds_minimum_distance: 1000.0,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));
        let owned = vec![d0_track(0, 10.0)];
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let mut state = EventState {
            pool: SeedTrackPool::default(),
            vertices: vec![CandidateVertex::new(vertex_at(0.0, vec![loose(0)]))],
        };
        let new_vertex = vertex_at(10.0, Vec::new());
        let mut fit_list = Vec::new();

        // Mahalanobis separation 100 / 2 = 50 < 1000
        assert_eq!(finder.reassign_tracks(&manager, &new_vertex, &mut fit_list, &mut state), 0);
    }

    #[test]
    fn test_refit_robbed_keeps_original_when_not_improved() {
        let finder = finder_with(FinderConfig::default(), Arc::new(StartPointFitter::default()));
        let owned = vec![d0_track(0, 100.0), d0_track(1, 100.0)];
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let members = vec![
            TrackAtVertex { key: TrackKey(0), weight: 0.9, perigee_at_vertex: None },
            TrackAtVertex { key: TrackKey(1), weight: 0.9, perigee_at_vertex: None },
        ];
        let mut original = CandidateVertex::new(FittedVertex {
            chi2: 0.01,
            ndof: 1.0,
            ..vertex_at(100.0, members)
        });
        original.decorations.robbed = 1;

        // The mock refit has chi2/ndof = 0.5 / 0.92, worse than 0.01
        let kept = finder.refit_robbed(&registry, &manager, vec![original.clone()]);
        assert_eq!(kept, vec![original]);
    }

    fn robbed_kshort(registry_tracks: &[Track]) -> CandidateVertex {
        let members = registry_tracks
            .iter()
            .enumerate()
            .map(|(key, t)| TrackAtVertex {
                key: TrackKey(key),
                weight: 0.9,
                perigee_at_vertex: Some(t.perigee.clone()),
            })
            .collect();
        let mut candidate = CandidateVertex::new(FittedVertex {
            position: SEED,
            covariance: Matrix3::identity(),
            chi2: 100.0,
            ndof: 1.0,
            tracks: members,
        });
        candidate.decorations.robbed = 1;
        candidate
    }

    #[test]
    fn test_refit_robbed_replaces_and_retags_improved_vertex() {
        let finder = finder_with(FinderConfig::default(), Arc::new(StartPointFitter::default()));
        let owned = kshort_pair();
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let kept = finder.refit_robbed(&registry, &manager, vec![robbed_kshort(&owned)]);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].fit.chi2, 0.5);
        assert_eq!(kept[0].vertex_type, VertexType::V0Vtx);
        assert_eq!(kept[0].decorations.num_tracks, 2);
        assert!((kept[0].decorations.mass.unwrap() - KSHORT_MASS).abs() < 1e-3);
    }

    #[test]
    fn test_refit_robbed_drops_v0_at_filter_level_three() {
        let config = FinderConfig {
            filter_level: 3,
            ..Default::default()
        };
        let finder = finder_with(config, Arc::new(StartPointFitter::default()));
        let owned = kshort_pair();
        let registry = TrackRegistry::new(owned.iter().collect());
        let manager = TrackPoolManager::new(&registry, &OffsetLinearizer, 0.02, 36.0);

        let kept = finder.refit_robbed(&registry, &manager, vec![robbed_kshort(&owned)]);
        assert!(kept.is_empty());
    }
}
