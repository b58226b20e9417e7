// kestrel_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::recorder::Recorder;
pub use crate::sensors::{BaroChannel, Barometer, InertialUnit, SensorError};
pub use crate::types::{SensorId, SensorKind, Tick};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::messages::{
    BaroSample, Command, ImuSample, MagSample, SampleSnapshot, StateEstimate, TrustEvent,
};
pub use crate::phase::{DeploymentIntent, FlightPhase, PhaseTransition};
pub use crate::queue::RingQueue;
pub use crate::recorder::{FlightRecord, MemoryRecorder, RecordData};

// --- Flight Logic (Export the whole stack for convenience) ---
pub use crate::calibration::{CalibrationData, GyroBiasSession, MagCalSession};
pub use crate::elimination::{EliminationPolicy, Trust, TrustMask};
pub use crate::estimation::{EstimationError, FilterState, VerticalKalman};
pub use crate::phase::FlightPhaseFsm;
pub use crate::pipeline::{CycleOutput, FlightPipeline, PipelineConfig};
pub use crate::sensors::{BaroSampler, ImuScale};
