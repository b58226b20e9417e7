// kestrel_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Kestrel: a flight-computer simulation harness.
///
/// Runs a scenario TOML through the full estimation pipeline and reports
/// the mission summary as JSON.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(short, long, default_value = "assets/scenarios/nominal.toml")]
    pub scenario: PathBuf,

    /// Write the flight record to this CSV file after the run.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Run against the wall clock on separate threads instead of the
    /// deterministic virtual clock.
    #[arg(long, default_value_t = false)]
    pub realtime: bool,

    /// Override the scenario's duration cap, in seconds.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
