//! SecVtx Simulation Harness
//!
//! Straight-line reference services for the iterative secondary-vertex
//! finder, a deterministic event generator with known truth, and a scenario
//! runner that scores the finder against that truth.
//!
//! # Core Principle: One Seed
//!
//! Every event is derived from a single 64-bit seed, so a failing scenario
//! is reproduced by rerunning it with the seed it reported.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  tracks   ┌────────────────────────┐  vertices  ┌──────────┐
//! │    Oracle    │──────────►│ IterativeVertexFinder  │───────────►│  Runner  │
//! │ (truth, hits)│           │  + straight-line svcs  │            │ (scoring)│
//! └──────────────┘           └───────────┬────────────┘            └────┬─────┘
//!                                        │ observer                     │
//!                                  ┌─────▼──────┐                 ┌─────▼─────┐
//!                                  │SeedRecorder│────────────────►│ SimExport │
//!                                  └────────────┘                 └───────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use secvtx_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_events(10).run(ScenarioId::KShortGun)?;
//! assert!(result.passed);
//! ```

mod config;
mod error;
mod exporter;
mod oracle;
mod recorder;
mod runner;
pub mod scenarios;
pub mod services;

pub use config::{load_finder_config, parse_finder_config};
pub use error::SimError;
pub use exporter::{EventFrame, SimExport};
pub use oracle::{two_body_momenta, EventRecipe, Oracle, SimEvent, TruthKind, TruthVertex};
pub use recorder::{Recording, SeedRecorder};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
