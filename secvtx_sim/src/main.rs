//! Secondary-vertexing simulator CLI
//!
//! Run the iterative vertex finder over deterministic synthetic events.

use clap::Parser;
use secvtx_core::FinderConfig;
use secvtx_sim::scenarios::ScenarioId;
use secvtx_sim::{load_finder_config, ScenarioResult, ScenarioRunner, SimError};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Secondary-vertexing simulation CLI
#[derive(Parser, Debug)]
#[command(name = "secvtx-sim")]
#[command(about = "Run deterministic vertexing scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (kshort_gun, lambda_gun, conversions, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of random seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Events per scenario
    #[arg(short, long, default_value = "20")]
    events: usize,

    /// Finder configuration file (JSON, missing keys keep their defaults)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export events, seeds and vertices to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for the --json summary
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("SecVtx Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    }
}

/// Runs everything `args` asks for; `Ok(false)` when a scenario failed.
fn run(args: &Args) -> Result<bool, SimError> {
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse()?]
    };

    let base_config = match &args.config {
        Some(path) => load_finder_config(path)?,
        None => FinderConfig::default(),
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            error!("--export only supports a single scenario, not 'all'");
            return Ok(false);
        }

        info!("Running with export to: {}", export_path);
        let runner = ScenarioRunner::new(base_seed)
            .with_events(args.events)
            .with_base_config(base_config);
        let (result, export) = runner.run_with_export(scenarios[0])?;
        export.write_to_file(export_path)?;

        if result.passed {
            info!(
                "✓ {} (seed={}) PASSED - exported {} events to {}",
                scenarios[0].name(),
                base_seed,
                export.events.len(),
                export_path
            );
        } else {
            error!(
                "✗ {} FAILED: {}",
                scenarios[0].name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        return Ok(result.passed);
    }

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_events(args.events)
            .with_base_config(base_config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario)?;

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED: efficiency {}",
                        scenario.name(),
                        seed,
                        result
                            .metrics
                            .efficiency()
                            .map_or("n/a".to_string(), |e| format!("{:.2}", e))
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        // JSON output for CI parsing
        let summary = json_summary(&all_results);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(failed_count == 0)
}

/// CI summary of every scenario run.
fn json_summary(results: &[ScenarioResult]) -> serde_json::Value {
    let failed = results.iter().filter(|r| !r.passed).count();
    serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results.iter().map(|r| {
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "events": r.events,
                "vertices_found": r.metrics.vertices_found,
                "truth_findable": r.metrics.truth_findable,
                "truth_matched": r.metrics.truth_matched,
                "fakes": r.metrics.fakes,
                "efficiency": r.metrics.efficiency(),
                "failure_reason": r.failure_reason,
            })
        }).collect::<Vec<_>>(),
    })
}
