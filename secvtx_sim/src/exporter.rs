//! JSON exporter for offline inspection.
//!
//! Exports every simulated event together with its truth, the seeds the
//! finder tried and the vertices it returned.

use nalgebra::Vector3;
use secvtx_core::{FinderConfig, SecondaryVertex, Track};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::oracle::TruthVertex;

/// A single event of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event index within the run
    pub event: usize,

    /// True primary vertex
    pub primary: Vector3<f64>,

    /// Input tracks, before any selection
    pub tracks: Vec<Track>,

    pub truth: Vec<TruthVertex>,

    /// Seed of every iteration, in order
    pub seeds: Vec<Vector3<f64>>,

    /// Outcome name of every iteration, in order
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub outcomes: Vec<String>,

    pub vertices: Vec<SecondaryVertex>,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Finder configuration after scenario overrides
    pub config: FinderConfig,

    pub events: Vec<EventFrame>,

    /// Final results
    pub passed: bool,

    /// Fraction of findable truth vertices that were found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64, config: FinderConfig) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            config,
            events: Vec::new(),
            passed: false,
            efficiency: None,
        }
    }

    pub fn add_frame(&mut self, frame: EventFrame) {
        self.events.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, efficiency: Option<f64>) {
        self.passed = passed;
        self.efficiency = efficiency;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
