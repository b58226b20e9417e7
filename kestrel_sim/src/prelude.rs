// kestrel_sim/src/prelude.rs

// Re-export the entire kestrel_core prelude so the pure flight types are
// one import away.
pub use kestrel_core::prelude::*;

// --- Scenario & Truth ---
pub use crate::profile::{FlightProfile, ProfileConfig, TruthSample};
pub use crate::scenario::{LinkConfig, ScenarioConfig, ScenarioError};

// --- Simulated Hardware ---
pub use crate::devices::{
    FaultKind, FaultWindow, SimBaroConfig, SimBarometer, SimImu, SimImuConfig,
};

// --- Task Plumbing ---
pub use crate::board::SampleBoard;
pub use crate::link::{GroundStation, TelemetryFrame, VehicleLink};
pub use crate::scheduler::{Cadence, DeadlineTicker, TaskSet};

// --- Runners ---
pub use crate::runner::{run_deterministic, run_realtime, RunSummary};
