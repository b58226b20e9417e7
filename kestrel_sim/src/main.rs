// kestrel_sim/src/main.rs

//! Scenario runner binary.
//!
//! Runs one scenario through the full pipeline and prints the mission
//! summary as JSON. To run:
//! `cargo run -p kestrel_sim -- --scenario assets/scenarios/nominal.toml`

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kestrel_sim::cli::Cli;
use kestrel_sim::flight_log;
use kestrel_sim::runner;
use kestrel_sim::scenario::ScenarioConfig;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --- 1. Logging ---
    // (set RUST_LOG to override the -v flags, e.g. RUST_LOG=kestrel_core=debug)
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // --- 2. Load the Scenario ---
    let mut scenario = ScenarioConfig::load(&cli.scenario)?;
    if let Some(duration) = cli.duration {
        scenario.duration_s = duration;
    }

    // --- 3. Run It ---
    let (summary, recorder) = if cli.realtime {
        runner::run_realtime(&scenario)?
    } else {
        runner::run_deterministic(&scenario)
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // --- 4. Export the Flight Record ---
    if let Some(path) = &cli.output {
        flight_log::export_csv(recorder.records(), path)?;
        println!("Flight record written to {}", path.display());
    }

    Ok(())
}
