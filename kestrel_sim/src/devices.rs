// kestrel_sim/src/devices.rs

//! Simulated sensor hardware.
//!
//! Each device implements the `kestrel_core` hardware traits, so the
//! acquisition path in the runner is the same code a real board would
//! run. The harness pushes the current truth into a device before every
//! acquisition cycle; the device adds bias, seeded Gaussian noise, and
//! any scripted fault, then answers the trait calls.

use kestrel_core::sensors::{BaroChannel, Barometer, ImuScale, InertialUnit, SensorError};
use kestrel_core::types::GRAVITY;
use nalgebra::Vector3;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

// =========================================================================
// == Fault Scripting ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The reading freezes at `value`.
    Stuck,
    /// `value` is added to the true reading.
    Offset,
    /// The device stops answering the bus.
    Dropout,
}

/// One scripted fault, active on the half-open window `[start_s, stop_s)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultWindow {
    pub kind: FaultKind,
    pub start_s: f64,
    pub stop_s: f64,
    #[serde(default)]
    pub value: f64,
}

impl FaultWindow {
    fn active(&self, t: f64) -> bool {
        t >= self.start_s && t < self.stop_s
    }
}

// =========================================================================
// == Barometer ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimBaroConfig {
    /// 1-sigma pressure noise, in Pa.
    #[serde(default = "default_baro_noise")]
    pub noise_std_pa: f64,
    /// Static pressure offset, in Pa.
    #[serde(default)]
    pub bias_pa: f64,
    #[serde(default)]
    pub faults: Vec<FaultWindow>,
}

fn default_baro_noise() -> f64 {
    6.0
}

impl Default for SimBaroConfig {
    fn default() -> Self {
        Self {
            noise_std_pa: default_baro_noise(),
            bias_pa: 0.0,
            faults: Vec::new(),
        }
    }
}

pub struct SimBarometer {
    config: SimBaroConfig,
    noise: Normal<f64>,
    rng: ChaCha8Rng,
    sim_time_s: f64,
    true_pressure_pa: f64,
    true_temperature_c: f64,
    pending: Option<BaroChannel>,
    latched_pressure: Option<f64>,
    latched_temperature: Option<f64>,
}

impl SimBarometer {
    pub fn new(config: SimBaroConfig, rng: ChaCha8Rng) -> Self {
        let noise = Normal::new(0.0, config.noise_std_pa).unwrap();
        Self {
            config,
            noise,
            rng,
            sim_time_s: 0.0,
            true_pressure_pa: 0.0,
            true_temperature_c: 0.0,
            pending: None,
            latched_pressure: None,
            latched_temperature: None,
        }
    }

    /// Pushes the current truth into the device. Called by the harness
    /// before each acquisition cycle.
    pub fn set_environment(&mut self, t: f64, pressure_pa: f64, temperature_c: f64) {
        self.sim_time_s = t;
        self.true_pressure_pa = pressure_pa;
        self.true_temperature_c = temperature_c;
    }

    fn faulted(&self, pressure_pa: f64) -> Result<f64, SensorError> {
        for fault in &self.config.faults {
            if fault.active(self.sim_time_s) {
                return match fault.kind {
                    FaultKind::Stuck => Ok(fault.value),
                    FaultKind::Offset => Ok(pressure_pa + fault.value),
                    FaultKind::Dropout => Err(SensorError::NotResponding),
                };
            }
        }
        Ok(pressure_pa)
    }
}

impl Barometer for SimBarometer {
    fn prepare(&mut self, channel: BaroChannel) -> Result<(), SensorError> {
        self.pending = Some(channel);
        Ok(())
    }

    fn read(&mut self) -> Result<(), SensorError> {
        let Some(channel) = self.pending.take() else {
            return Err(SensorError::NotReady);
        };
        match channel {
            BaroChannel::Pressure => {
                let noisy =
                    self.true_pressure_pa + self.config.bias_pa + self.noise.sample(&mut self.rng);
                self.latched_pressure = Some(self.faulted(noisy)?);
            }
            BaroChannel::Temperature => {
                // Dropout takes the whole bus down, not just one channel.
                self.faulted(0.0)?;
                self.latched_temperature = Some(self.true_temperature_c);
            }
        }
        Ok(())
    }

    fn get_measurement(&mut self) -> Result<(f64, f64), SensorError> {
        match (self.latched_pressure, self.latched_temperature) {
            (Some(pressure), Some(temperature)) => Ok((pressure, temperature)),
            _ => Err(SensorError::NotReady),
        }
    }
}

// =========================================================================
// == IMU ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimImuConfig {
    /// 1-sigma accelerometer noise per axis, in m/s^2.
    #[serde(default = "default_accel_noise")]
    pub accel_noise_std: f64,
    /// 1-sigma gyroscope noise per axis, in rad/s.
    #[serde(default = "default_gyro_noise")]
    pub gyro_noise_std: f64,
    /// Static accelerometer bias, in m/s^2.
    #[serde(default)]
    pub accel_bias: [f64; 3],
    /// Static gyroscope bias, in rad/s.
    #[serde(default)]
    pub gyro_bias: [f64; 3],
    #[serde(default)]
    pub scale: ImuScale,
    /// Faults act on the accelerometer: `Stuck` pins all axes to `value`
    /// m/s^2, `Offset` shifts the vertical axis.
    #[serde(default)]
    pub faults: Vec<FaultWindow>,
}

fn default_accel_noise() -> f64 {
    0.05
}

fn default_gyro_noise() -> f64 {
    0.002
}

impl Default for SimImuConfig {
    fn default() -> Self {
        Self {
            accel_noise_std: default_accel_noise(),
            gyro_noise_std: default_gyro_noise(),
            accel_bias: [0.0; 3],
            gyro_bias: [0.0; 3],
            scale: ImuScale::default(),
            faults: Vec::new(),
        }
    }
}

pub struct SimImu {
    config: SimImuConfig,
    accel_noise: Normal<f64>,
    gyro_noise: Normal<f64>,
    rng: ChaCha8Rng,
    sim_time_s: f64,
    specific_force: Vector3<f64>,
    angular_rate: Vector3<f64>,
}

impl SimImu {
    pub fn new(config: SimImuConfig, rng: ChaCha8Rng) -> Self {
        let accel_noise = Normal::new(0.0, config.accel_noise_std).unwrap();
        let gyro_noise = Normal::new(0.0, config.gyro_noise_std).unwrap();
        Self {
            config,
            accel_noise,
            gyro_noise,
            rng,
            sim_time_s: 0.0,
            specific_force: Vector3::new(0.0, 0.0, GRAVITY),
            angular_rate: Vector3::zeros(),
        }
    }

    pub fn scale(&self) -> ImuScale {
        self.config.scale
    }

    /// Pushes the current truth into the device. The specific force is
    /// what the proof mass feels: coordinate acceleration minus gravity,
    /// so a resting body reads +g up.
    pub fn set_motion(&mut self, t: f64, specific_force: Vector3<f64>, angular_rate: Vector3<f64>) {
        self.sim_time_s = t;
        self.specific_force = specific_force;
        self.angular_rate = angular_rate;
    }

    fn accel_counts(&self, value_si: f64) -> i16 {
        let counts = value_si / GRAVITY * self.config.scale.accel_lsb_per_g;
        counts
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }

    fn gyro_counts(&self, value_si: f64) -> i16 {
        let counts = value_si.to_degrees() * self.config.scale.gyro_lsb_per_dps;
        counts
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

impl InertialUnit for SimImu {
    fn read_accel_raw(&mut self) -> Result<[i16; 3], SensorError> {
        let mut accel = self.specific_force;
        for fault in &self.config.faults {
            if fault.active(self.sim_time_s) {
                match fault.kind {
                    FaultKind::Stuck => accel = Vector3::from_element(fault.value),
                    FaultKind::Offset => accel.z += fault.value,
                    FaultKind::Dropout => return Err(SensorError::NotResponding),
                }
            }
        }
        let noisy = [
            accel.x + self.config.accel_bias[0] + self.accel_noise.sample(&mut self.rng),
            accel.y + self.config.accel_bias[1] + self.accel_noise.sample(&mut self.rng),
            accel.z + self.config.accel_bias[2] + self.accel_noise.sample(&mut self.rng),
        ];
        Ok(noisy.map(|v| self.accel_counts(v)))
    }

    fn read_gyro_raw(&mut self) -> Result<[i16; 3], SensorError> {
        let noisy = [
            self.angular_rate.x + self.config.gyro_bias[0] + self.gyro_noise.sample(&mut self.rng),
            self.angular_rate.y + self.config.gyro_bias[1] + self.gyro_noise.sample(&mut self.rng),
            self.angular_rate.z + self.config.gyro_bias[2] + self.gyro_noise.sample(&mut self.rng),
        ];
        Ok(noisy.map(|v| self.gyro_counts(v)))
    }
}
