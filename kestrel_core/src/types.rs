// kestrel_core/src/types.rs

use serde::{Deserialize, Serialize};

// --- Core Type Aliases ---

/// Monotonic scheduler time in milliseconds since boot.
pub type Tick = u64;

/// Index of one sensor instance within its redundancy group.
pub type SensorId = usize;

// --- Physical Constants ---

/// Standard gravity in m/s^2.
pub const GRAVITY: f64 = 9.81;

/// ISA sea-level standard pressure in Pa.
pub const SEA_LEVEL_PRESSURE: f64 = 101_325.0;

// --- Core Identifiers ---

/// Which redundancy group a sensor instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Barometer,
    Imu,
}

/// Converts a pressure reading into ISA barometric altitude above sea level.
///
/// `reference_pressure` is the pressure the altitude is measured against,
/// normally the sea-level standard but any fixed reference works for
/// relative altitude.
pub fn pressure_to_altitude(pressure_pa: f64, reference_pressure: f64) -> f64 {
    44_330.0 * (1.0 - (pressure_pa / reference_pressure).powf(0.190_3))
}
