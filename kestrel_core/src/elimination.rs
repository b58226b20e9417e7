// kestrel_core/src/elimination.rs

//! Sensor-fault policy: decides per estimation cycle which sensor
//! instances may contribute to the Kalman update.
//!
//! A sensor is eliminated after a debounced run of implausible or
//! out-of-innovation samples and restored only after an equally long run
//! of clean ones, so a noisy instance hovering at the gate cannot flap in
//! and out of the fusion.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::messages::TrustEvent;
use crate::types::{SensorKind, Tick};

// =========================================================================
// == Trust Mask ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trust {
    Trusted,
    Eliminated,
}

impl Trust {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Trust::Trusted)
    }
}

/// Per-cycle trust state of every sensor instance, consumed by the
/// estimator to pick the update variant and by the phase logic as a
/// degraded-estimate signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustMask {
    pub baros: Vec<Trust>,
    pub imus: Vec<Trust>,
}

impl TrustMask {
    pub fn all_trusted(n_baro: usize, n_imu: usize) -> Self {
        Self {
            baros: vec![Trust::Trusted; n_baro],
            imus: vec![Trust::Trusted; n_imu],
        }
    }

    pub fn trusted_baros(&self) -> usize {
        self.baros.iter().filter(|t| **t == Trust::Trusted).count()
    }

    pub fn trusted_imus(&self) -> usize {
        self.imus.iter().filter(|t| **t == Trust::Trusted).count()
    }

    pub fn any_eliminated(&self) -> bool {
        self.baros.contains(&Trust::Eliminated) || self.imus.contains(&Trust::Eliminated)
    }
}

// =========================================================================
// == Policy ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EliminationConfig {
    /// Innovation gate as a multiple of the expected noise std.
    pub sigma_gate: f64,
    /// Consecutive bad cycles before elimination, and consecutive clean
    /// cycles before restoration.
    pub debounce: u32,
    /// Expected altitude noise std per barometer, in m.
    pub baro_noise_std: f64,
    /// Expected vertical-acceleration noise std per IMU, in m/s^2.
    pub accel_noise_std: f64,
    /// Plausible static-pressure window, in Pa.
    pub pressure_bounds: [f64; 2],
    /// Plausible per-axis specific-force magnitude, in m/s^2.
    pub accel_limit: f64,
}

impl Default for EliminationConfig {
    fn default() -> Self {
        Self {
            sigma_gate: 5.0,
            debounce: 5,
            baro_noise_std: 1.5,
            accel_noise_std: 0.8,
            pressure_bounds: [1_000.0, 120_000.0],
            accel_limit: 300.0,
        }
    }
}

/// One barometer instance as seen by the policy this cycle.
#[derive(Debug, Clone, Copy)]
pub struct BaroObservation {
    pub pressure_pa: f64,
    /// Converted altitude above the pad, in m.
    pub altitude: f64,
}

/// One IMU instance as seen by the policy this cycle.
#[derive(Debug, Clone, Copy)]
pub struct ImuObservation {
    pub accel: Vector3<f64>,
    /// Tilt-compensated vertical acceleration, in m/s^2.
    pub vertical_accel: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    trust_lost: bool,
    strikes: u32,
    clean: u32,
}

/// Debounce bookkeeping for every sensor instance. No I/O; the only state
/// is the per-channel counters.
#[derive(Debug, Clone)]
pub struct EliminationPolicy {
    config: EliminationConfig,
    baros: Vec<Channel>,
    imus: Vec<Channel>,
}

impl EliminationPolicy {
    pub fn new(config: EliminationConfig, n_baro: usize, n_imu: usize) -> Self {
        Self {
            config,
            baros: vec![Channel::default(); n_baro],
            imus: vec![Channel::default(); n_imu],
        }
    }

    /// Runs the policy for one cycle against the estimator's current
    /// predicted measurements. A missing observation counts as a strike:
    /// a stale instance is as unusable as an implausible one.
    ///
    /// Returns the trust transitions that fired this cycle.
    pub fn update(
        &mut self,
        tick: Tick,
        baros: &[Option<BaroObservation>],
        imus: &[Option<ImuObservation>],
        predicted_altitude: f64,
        predicted_accel: f64,
    ) -> Vec<TrustEvent> {
        let mut events = Vec::new();
        let config = self.config;

        for (id, (channel, obs)) in self.baros.iter_mut().zip(baros).enumerate() {
            let good = obs.is_some_and(|o| {
                let plausible = o.pressure_pa >= config.pressure_bounds[0]
                    && o.pressure_pa <= config.pressure_bounds[1];
                let innovation = (o.altitude - predicted_altitude).abs();
                plausible && innovation <= config.sigma_gate * config.baro_noise_std
            });
            if let Some(change) =
                channel.advance(good, config.debounce, SensorKind::Barometer, id, tick)
            {
                events.push(change);
            }
        }

        for (id, (channel, obs)) in self.imus.iter_mut().zip(imus).enumerate() {
            let good = obs.is_some_and(|o| {
                let plausible = o.accel.abs().max() <= config.accel_limit;
                let innovation = (o.vertical_accel - predicted_accel).abs();
                plausible && innovation <= config.sigma_gate * config.accel_noise_std
            });
            if let Some(change) = channel.advance(good, config.debounce, SensorKind::Imu, id, tick)
            {
                events.push(change);
            }
        }

        events
    }

    /// The current mask, rebuilt from the channel states.
    pub fn mask(&self) -> TrustMask {
        TrustMask {
            baros: self.baros.iter().map(Channel::trust).collect(),
            imus: self.imus.iter().map(Channel::trust).collect(),
        }
    }

    /// Forgets all debounce history, restoring every instance to trusted.
    pub fn reset(&mut self) {
        for channel in self.baros.iter_mut().chain(self.imus.iter_mut()) {
            *channel = Channel::default();
        }
    }
}

impl Channel {
    fn trust(&self) -> Trust {
        if self.trust_lost {
            Trust::Eliminated
        } else {
            Trust::Trusted
        }
    }

    fn advance(
        &mut self,
        good: bool,
        debounce: u32,
        kind: SensorKind,
        id: usize,
        tick: Tick,
    ) -> Option<TrustEvent> {
        if self.trust_lost {
            if good {
                self.clean += 1;
                if self.clean >= debounce {
                    self.trust_lost = false;
                    self.strikes = 0;
                    self.clean = 0;
                    info!(?kind, id, tick, "sensor restored");
                    return Some(TrustEvent {
                        kind,
                        id,
                        eliminated: false,
                        tick,
                    });
                }
            } else {
                self.clean = 0;
            }
        } else if good {
            self.strikes = 0;
        } else {
            self.strikes += 1;
            if self.strikes >= debounce {
                self.trust_lost = true;
                self.clean = 0;
                warn!(?kind, id, tick, "sensor eliminated");
                return Some(TrustEvent {
                    kind,
                    id,
                    eliminated: true,
                    tick,
                });
            }
        }
        None
    }
}
