//! Vertexing scenarios for the simulation harness.

use secvtx_core::FinderConfig;

use crate::error::SimError;
use crate::oracle::EventRecipe;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SV-001: K-short decays only
    KShortGun,

    /// SV-002: Lambda decays only
    LambdaGun,

    /// SV-003: Photon conversions in the pixel layers
    Conversions,

    /// SV-004: Three-prong hadronic interactions, V0 veto on
    MaterialInteractions,

    /// SV-005: Everything at once plus prompt tracks
    MixedEvent,

    // ═══════════════════════════════════════════════════
    // FILTER & EDGE-CASE SCENARIOS
    // ═══════════════════════════════════════════════════

    /// SV-006: K-shorts and interactions at filter level 3
    V0Veto,

    /// SV-007: Hit-pattern grooming at filter level 5
    HitPatternGrooming,

    /// SV-008: Split-vertex mode
    SplitVertices,

    /// SV-009: Multiplicity cut
    HighMultiplicity,

    /// SV-010: Nothing to vertex
    Sparse,
}

/// What a scenario run must show to pass, on top of the invariants that are
/// always checked.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Expectation {
    /// Minimum fraction of findable truth vertices that must be found
    pub min_efficiency: Option<f64>,

    /// Maximum number of vertices over the whole run
    pub max_found: Option<usize>,

    /// No vertex may be tagged as V0
    pub forbid_v0: bool,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::KShortGun,
            ScenarioId::LambdaGun,
            ScenarioId::Conversions,
            ScenarioId::MaterialInteractions,
            ScenarioId::MixedEvent,
            ScenarioId::V0Veto,
            ScenarioId::HitPatternGrooming,
            ScenarioId::SplitVertices,
            ScenarioId::HighMultiplicity,
            ScenarioId::Sparse,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::KShortGun => "kshort_gun",
            ScenarioId::LambdaGun => "lambda_gun",
            ScenarioId::Conversions => "conversions",
            ScenarioId::MaterialInteractions => "material_interactions",
            ScenarioId::MixedEvent => "mixed_event",
            ScenarioId::V0Veto => "v0_veto",
            ScenarioId::HitPatternGrooming => "hit_pattern_grooming",
            ScenarioId::SplitVertices => "split_vertices",
            ScenarioId::HighMultiplicity => "high_multiplicity",
            ScenarioId::Sparse => "sparse",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::KShortGun => "4 K-shorts per event decaying at 10-300 mm",
            ScenarioId::LambdaGun => "4 Lambdas per event, soft pions often lost",
            ScenarioId::Conversions => "4 photon conversions per event on the pixel layers",
            ScenarioId::MaterialInteractions => "3 three-prong interactions per event, V0s vetoed",
            ScenarioId::MixedEvent => "V0s, conversions, interactions and 30 prompt tracks",
            ScenarioId::V0Veto => "filter level 3: no V0 may survive",
            ScenarioId::HitPatternGrooming => "filter level 5: two-track vertices groomed by hit pattern",
            ScenarioId::SplitVertices => "split mode: vertices are fitted but never stored",
            ScenarioId::HighMultiplicity => "more selected tracks than the cut allows: empty output",
            ScenarioId::Sparse => "a single prompt track: nothing to seed",
        }
    }

    /// Event composition.
    pub fn recipe(&self) -> EventRecipe {
        match self {
            ScenarioId::KShortGun => EventRecipe {
                kshorts: 4,
                ..Default::default()
            },
            ScenarioId::LambdaGun => EventRecipe {
                lambdas: 4,
                ..Default::default()
            },
            ScenarioId::Conversions => EventRecipe {
                conversions: 4,
                ..Default::default()
            },
            ScenarioId::MaterialInteractions => EventRecipe {
                interactions: 3,
                ..Default::default()
            },
            ScenarioId::MixedEvent => EventRecipe {
                kshorts: 2,
                lambdas: 1,
                conversions: 1,
                interactions: 2,
                prompt: 30,
            },
            ScenarioId::V0Veto => EventRecipe {
                kshorts: 4,
                interactions: 2,
                ..Default::default()
            },
            ScenarioId::HitPatternGrooming => EventRecipe {
                kshorts: 2,
                conversions: 2,
                interactions: 2,
                prompt: 10,
                ..Default::default()
            },
            ScenarioId::SplitVertices => EventRecipe {
                kshorts: 3,
                interactions: 1,
                ..Default::default()
            },
            ScenarioId::HighMultiplicity => EventRecipe {
                kshorts: 10,
                ..Default::default()
            },
            ScenarioId::Sparse => EventRecipe {
                prompt: 1,
                ..Default::default()
            },
        }
    }

    /// Apply the scenario's settings on top of a base configuration.
    pub fn configure(&self, config: &mut FinderConfig) {
        match self {
            ScenarioId::MaterialInteractions | ScenarioId::V0Veto => {
                config.filter_level = 3;
            }
            ScenarioId::HitPatternGrooming => {
                config.filter_level = 5;
            }
            ScenarioId::SplitVertices => {
                config.create_split_vertices = true;
            }
            ScenarioId::HighMultiplicity => {
                config.do_max_tracks_cut = true;
                config.max_tracks = 5;
            }
            _ => {}
        }
    }

    pub fn expectation(&self) -> Expectation {
        match self {
            ScenarioId::KShortGun => Expectation {
                min_efficiency: Some(0.5),
                ..Default::default()
            },
            ScenarioId::LambdaGun | ScenarioId::Conversions | ScenarioId::MaterialInteractions => Expectation {
                min_efficiency: Some(0.3),
                ..Default::default()
            },
            ScenarioId::MixedEvent => Expectation {
                min_efficiency: Some(0.3),
                ..Default::default()
            },
            ScenarioId::V0Veto | ScenarioId::HitPatternGrooming => Expectation {
                forbid_v0: true,
                ..Default::default()
            },
            ScenarioId::SplitVertices | ScenarioId::HighMultiplicity | ScenarioId::Sparse => Expectation {
                max_found: Some(0),
                ..Default::default()
            },
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kshort_gun" | "kshort" | "sv-001" => Ok(ScenarioId::KShortGun),
            "lambda_gun" | "lambda" | "sv-002" => Ok(ScenarioId::LambdaGun),
            "conversions" | "conversion" | "sv-003" => Ok(ScenarioId::Conversions),
            "material_interactions" | "material" | "sv-004" => Ok(ScenarioId::MaterialInteractions),
            "mixed_event" | "mixed" | "sv-005" => Ok(ScenarioId::MixedEvent),
            "v0_veto" | "sv-006" => Ok(ScenarioId::V0Veto),
            "hit_pattern_grooming" | "grooming" | "sv-007" => Ok(ScenarioId::HitPatternGrooming),
            "split_vertices" | "split" | "sv-008" => Ok(ScenarioId::SplitVertices),
            "high_multiplicity" | "multiplicity" | "sv-009" => Ok(ScenarioId::HighMultiplicity),
            "sparse" | "sv-010" => Ok(ScenarioId::Sparse),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}
