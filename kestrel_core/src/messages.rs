// kestrel_core/src/messages.rs

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::types::{SensorId, Tick};

// =========================================================================
// == Converted Sensor Samples ==
// =========================================================================

/// One barometer readout converted to SI units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaroSample {
    /// Static pressure in Pa.
    pub pressure_pa: f64,
    /// Die temperature in deg C, used for conversion sanity checks.
    pub temperature_c: f64,
    /// Acquisition tick of the pressure readout.
    pub tick: Tick,
}

/// One IMU readout converted to SI units, body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Specific force in m/s^2.
    pub accel: Vector3<f64>,
    /// Angular rate in rad/s.
    pub gyro: Vector3<f64>,
    pub tick: Tick,
}

/// One magnetometer readout in Gauss, body frame. Consumed by calibration
/// only; the estimator does not fuse the field vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagSample {
    pub field: Vector3<f64>,
    pub tick: Tick,
}

/// The latest reading from every sensor instance, captured as one coherent
/// snapshot. Instances that have not produced data yet are `None`.
///
/// The acquisition task publishes a whole snapshot at once and the
/// estimation task copies it out in one step, so a consumer never observes
/// half of an update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleSnapshot {
    pub baros: Vec<Option<BaroSample>>,
    pub imus: Vec<Option<ImuSample>>,
    pub mag: Option<MagSample>,
    /// Tick at which the snapshot was published.
    pub tick: Tick,
}

impl SampleSnapshot {
    pub fn new(n_baro: usize, n_imu: usize) -> Self {
        Self {
            baros: vec![None; n_baro],
            imus: vec![None; n_imu],
            mag: None,
            tick: 0,
        }
    }

    /// True once every instance has delivered at least one sample.
    pub fn all_sources_reporting(&self) -> bool {
        self.baros.iter().all(Option::is_some) && self.imus.iter().all(Option::is_some)
    }
}

// =========================================================================
// == Estimator Output ==
// =========================================================================

/// The primary output of the estimator, produced once per control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateEstimate {
    /// Altitude above the launch pad in m.
    pub altitude_agl: f64,
    /// Vertical velocity in m/s, positive up.
    pub vertical_velocity: f64,
    /// Tilt-compensated vertical acceleration in m/s^2, gravity removed.
    pub vertical_accel: f64,
    /// Cosine of the angle between the dominant body axis and gravity,
    /// fixed by calibration.
    pub tilt: f64,
    pub tick: Tick,
    /// False after a failed update step, until an explicit re-init.
    pub valid: bool,
}

impl StateEstimate {
    pub fn invalid_at(tick: Tick) -> Self {
        Self {
            altitude_agl: 0.0,
            vertical_velocity: 0.0,
            vertical_accel: 0.0,
            tilt: 1.0,
            tick,
            valid: false,
        }
    }
}

// =========================================================================
// == Commands ==
// =========================================================================

/// Ground-to-vehicle commands carried over the uplink queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Begin calibration and, once complete, arm the vehicle.
    Arm,
    /// Abort the mission; suppresses all further deployment intents.
    Abort,
    /// Discard calibration progress and start over. Ignored in flight.
    Recalibrate,
}

/// An observed change of one sensor instance's trust state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvent {
    pub kind: crate::types::SensorKind,
    pub id: SensorId,
    pub eliminated: bool,
    pub tick: Tick,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_samples_survive_json() {
        let mut snapshot = SampleSnapshot::new(1, 1);
        snapshot.baros[0] = Some(BaroSample {
            pressure_pa: 101_325.0,
            temperature_c: 21.5,
            tick: 35,
        });
        snapshot.imus[0] = Some(ImuSample {
            accel: Vector3::new(0.1, -0.2, 9.81),
            gyro: Vector3::new(0.01, 0.0, -0.02),
            tick: 40,
        });
        snapshot.mag = Some(MagSample {
            field: Vector3::new(0.2, -0.1, 0.43),
            tick: 40,
        });
        snapshot.tick = 45;
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SampleSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
