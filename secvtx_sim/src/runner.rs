//! Scenario runner - drives the finder over simulated events and scores it
//! against the truth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use secvtx_core::{
    FinderConfig, FinderOutput, IterationOutcome, IterativeVertexFinder, ReferenceVertex, Track, TrackFilter,
    VertexType,
};
use tracing::{debug, info, warn};

use crate::error::SimError;
use crate::exporter::{EventFrame, SimExport};
use crate::oracle::{Oracle, SimEvent, TruthVertex};
use crate::recorder::SeedRecorder;
use crate::scenarios::ScenarioId;
use crate::services::{
    AdaptiveStraightLineFitter, DisplacedTrackFilter, PairCrossingSeedFinder, QualityTrackFilter,
    StraightLineImpactEstimator, StraightLineLinearizer,
};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Events simulated
    pub events: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioMetrics {
    /// Tracks produced by the oracle
    pub tracks_generated: usize,

    /// Tracks that passed both filters
    pub tracks_selected: usize,

    /// Loop iterations over all events
    pub iterations: usize,

    /// Seeds handed to the observer
    pub seeds_tried: usize,

    /// Good fits thrown away by a veto
    pub rejections: usize,

    pub vertices_found: usize,

    /// Found vertices tagged as V0
    pub v0_tagged: usize,

    /// Truth vertices with at least two selected daughters
    pub truth_findable: usize,

    /// Findable truth vertices with two daughters on one found vertex
    pub truth_matched: usize,

    /// Found vertices that match no truth vertex
    pub fakes: usize,

    /// Summed distance between matched found and truth vertices (mm)
    pub residual_sum_mm: f64,
}

impl ScenarioMetrics {
    /// Fraction of findable truth vertices that were found.
    pub fn efficiency(&self) -> Option<f64> {
        (self.truth_findable > 0).then(|| self.truth_matched as f64 / self.truth_findable as f64)
    }

    /// Mean distance of matched vertices to the truth (mm).
    pub fn mean_residual_mm(&self) -> Option<f64> {
        (self.truth_matched > 0).then(|| self.residual_sum_mm / self.truth_matched as f64)
    }
}

/// Runs vertexing scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Events per scenario
    events: usize,

    /// Finder configuration before scenario overrides
    base_config: FinderConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            events: 20,
            base_config: FinderConfig::default(),
        }
    }

    /// Sets the number of events per scenario.
    pub fn with_events(mut self, events: usize) -> Self {
        self.events = events;
        self
    }

    /// Sets the configuration scenarios start from.
    pub fn with_base_config(mut self, config: FinderConfig) -> Self {
        self.base_config = config;
        self
    }

    /// The finder configuration `scenario` runs with.
    pub fn config_for(&self, scenario: ScenarioId) -> FinderConfig {
        let mut config = self.base_config.clone();
        scenario.configure(&mut config);
        config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        self.execute(scenario, None)
    }

    /// Runs a scenario and keeps every event for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> Result<(ScenarioResult, SimExport), SimError> {
        let mut export = SimExport::new(scenario.name(), self.seed, self.config_for(scenario));
        let result = self.execute(scenario, Some(&mut export))?;
        export.finalize(result.passed, result.metrics.efficiency());
        Ok((result, export))
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> Result<ScenarioResult, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let config = self.config_for(scenario);
        let filters = track_filters();
        let recorder = Arc::new(SeedRecorder::new());
        let mut finder = build_finder(config.clone(), &filters, recorder.clone())?;

        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = Oracle::new(physics_seed);
        let recipe = scenario.recipe();

        let mut metrics = ScenarioMetrics::default();
        let mut violations = Vec::new();

        for _ in 0..self.events {
            let event = oracle.generate_event(&recipe);
            finder.set_primary_vertex(event.primary);
            let output = finder.find_vertices(&event.tracks);
            let recording = recorder.take();

            if let Err(reason) = check_invariants(&config, &output) {
                warn!("Event {}: {}", event.index, reason);
                violations.push(format!("event {}: {}", event.index, reason));
            }

            metrics.tracks_generated += event.tracks.len();
            metrics.tracks_selected += output.selected_tracks;
            metrics.iterations += output.iterations;
            metrics.seeds_tried += recording.seeds.len();
            metrics.rejections += output
                .outcomes
                .iter()
                .filter(|o| matches!(o, IterationOutcome::Rejected(_)))
                .count();
            metrics.vertices_found += output.vertices.len();
            metrics.v0_tagged += output
                .vertices
                .iter()
                .filter(|v| v.vertex_type == VertexType::V0Vtx)
                .count();
            score_event(&config, &filters, &event, &output, &mut metrics);

            debug!(
                "  event {} | tracks={} | selected={} | found={}",
                event.index,
                event.tracks.len(),
                output.selected_tracks,
                output.vertices.len()
            );

            if let Some(export) = export.as_mut() {
                export.add_frame(EventFrame {
                    event: event.index,
                    primary: event.primary,
                    tracks: event.tracks,
                    truth: event.truth,
                    seeds: recording.seeds,
                    outcomes: recording.outcomes.iter().map(|o| o.name().to_string()).collect(),
                    vertices: output.vertices,
                });
            }
        }

        let failure_reason = if let Some(first) = violations.first() {
            Some(format!("{} invariant violations, first: {}", violations.len(), first))
        } else {
            check_expectation(scenario, &metrics)
        };
        let passed = failure_reason.is_none();

        info!(
            "✓ {} complete: {} found, {}/{} truth matched, {} fakes",
            scenario.name(),
            metrics.vertices_found,
            metrics.truth_matched,
            metrics.truth_findable,
            metrics.fakes
        );

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            events: self.events,
            failure_reason,
            metrics,
        })
    }
}

// ============================================================================
// FINDER SETUP
// ============================================================================

fn track_filters() -> Vec<Arc<dyn TrackFilter>> {
    vec![
        Arc::new(QualityTrackFilter::default()),
        Arc::new(DisplacedTrackFilter::default()),
    ]
}

fn build_finder(
    config: FinderConfig,
    filters: &[Arc<dyn TrackFilter>],
    recorder: Arc<SeedRecorder>,
) -> Result<IterativeVertexFinder, SimError> {
    let builder = filters.iter().fold(IterativeVertexFinder::builder(config), |builder, filter| {
        builder.with_track_filter(filter.clone())
    });

    let finder = builder
        .with_seed_finder(Arc::new(PairCrossingSeedFinder::default()))
        .with_impact_estimator(Arc::new(StraightLineImpactEstimator))
        .with_fitter(Arc::new(AdaptiveStraightLineFitter::default()))
        .with_linearizer(Arc::new(StraightLineLinearizer))
        .with_observer(recorder)
        .build()?;
    Ok(finder)
}

// ============================================================================
// SCORING
// ============================================================================

/// Checks what must hold for any event, whatever the scenario.
fn check_invariants(config: &FinderConfig, output: &FinderOutput) -> Result<(), String> {
    if output.iterations > config.max_vertices {
        return Err(format!("{} iterations exceed the cap of {}", output.iterations, config.max_vertices));
    }
    if output.vertices.len() > config.max_vertices {
        return Err(format!("{} vertices exceed the cap of {}", output.vertices.len(), config.max_vertices));
    }
    if config.do_max_tracks_cut && output.selected_tracks > config.max_tracks && output.iterations > 0 {
        return Err(format!("vertexing ran on {} tracks despite the multiplicity cut", output.selected_tracks));
    }
    if config.create_split_vertices && !output.vertices.is_empty() {
        return Err("split mode stored vertices".to_string());
    }

    let mut seen = HashSet::new();
    for vertex in &output.vertices {
        if vertex.ndof <= 0.0 {
            return Err(format!("vertex at rxy {:.1} mm has ndof {:.2}", vertex.rxy(), vertex.ndof));
        }
        if vertex.full_members(config.min_track_weight_at_vtx).count() < 2 {
            return Err(format!("vertex at rxy {:.1} mm has fewer than two full members", vertex.rxy()));
        }
        if config.filter_level >= 3 && vertex.vertex_type == VertexType::V0Vtx {
            return Err(format!("V0 vertex survived filter level {}", config.filter_level));
        }
        for track in &vertex.tracks {
            if !seen.insert(track.track_id) {
                return Err(format!("track {} is attached to two vertices", track.track_id));
            }
        }
    }
    Ok(())
}

/// A truth vertex is findable when at least two of its daughters pass every filter.
fn is_findable(truth: &TruthVertex, tracks: &HashMap<u64, &Track>, filters: &[Arc<dyn TrackFilter>]) -> bool {
    let reference = ReferenceVertex::null();
    truth
        .track_ids
        .iter()
        .filter_map(|id| tracks.get(id))
        .filter(|track| filters.iter().all(|f| f.accept(track, &reference)))
        .count()
        >= 2
}

fn score_event(
    config: &FinderConfig,
    filters: &[Arc<dyn TrackFilter>],
    event: &SimEvent,
    output: &FinderOutput,
    metrics: &mut ScenarioMetrics,
) {
    let tracks: HashMap<u64, &Track> = event.tracks.iter().map(|t| (t.id.0, t)).collect();
    let members: Vec<HashSet<u64>> = output
        .vertices
        .iter()
        .map(|v| {
            v.full_members(config.min_track_weight_at_vtx)
                .map(|t| t.track_id.0)
                .collect()
        })
        .collect();

    let shares_daughters = |truth: &TruthVertex, found: &HashSet<u64>| {
        truth.track_ids.iter().filter(|id| found.contains(id)).count() >= 2
    };

    for truth in &event.truth {
        if !is_findable(truth, &tracks, filters) {
            continue;
        }
        metrics.truth_findable += 1;

        let matched = output
            .vertices
            .iter()
            .zip(&members)
            .find(|(_, found)| shares_daughters(truth, *found));
        match matched {
            Some((vertex, _)) => {
                metrics.truth_matched += 1;
                metrics.residual_sum_mm += (vertex.position - truth.position).norm();
            }
            None => debug!("  missed {} at rxy {:.1} mm", truth.kind.name(), truth.rxy()),
        }
    }

    metrics.fakes += members
        .iter()
        .filter(|found| !event.truth.iter().any(|truth| shares_daughters(truth, *found)))
        .count();
}

fn check_expectation(scenario: ScenarioId, metrics: &ScenarioMetrics) -> Option<String> {
    let expectation = scenario.expectation();

    if let Some(min_efficiency) = expectation.min_efficiency {
        match metrics.efficiency() {
            None => return Some("no findable truth vertex".to_string()),
            Some(efficiency) if efficiency < min_efficiency => {
                return Some(format!(
                    "efficiency {:.2} below threshold {:.2}",
                    efficiency, min_efficiency
                ));
            }
            Some(_) => {}
        }
    }
    if let Some(max_found) = expectation.max_found {
        if metrics.vertices_found > max_found {
            return Some(format!(
                "{} vertices found, at most {} expected",
                metrics.vertices_found, max_found
            ));
        }
    }
    if expectation.forbid_v0 && metrics.v0_tagged > 0 {
        return Some(format!("{} vertices tagged as V0", metrics.v0_tagged));
    }
    None
}
