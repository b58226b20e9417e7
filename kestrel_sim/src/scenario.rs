// kestrel_sim/src/scenario.rs

//! Scenario configuration.
//!
//! A scenario TOML describes one run end to end: the truth trajectory,
//! every simulated device with its noise and faults, the full flight
//! pipeline configuration, and the ground-link script. Everything has a
//! default, so a minimal file is just a `name`.

use std::path::Path;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use kestrel_core::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::{SimBaroConfig, SimImuConfig};
use crate::profile::ProfileConfig;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to load scenario: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid scenario: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Queue capacity per direction, in bytes.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Estimation cycles between telemetry frames.
    #[serde(default = "default_telemetry_every")]
    pub telemetry_every_cycles: u32,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_telemetry_every() -> u32 {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            telemetry_every_cycles: default_telemetry_every(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    pub name: String,
    /// Seed for every device RNG stream.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Wall-clock cap on the run, in s.
    #[serde(default = "default_duration")]
    pub duration_s: f64,
    /// True static pressure at the pad, in Pa.
    #[serde(default = "default_pad_pressure")]
    pub pad_pressure_pa: f64,
    /// True air temperature at the pad, in deg C.
    #[serde(default = "default_pad_temperature")]
    pub pad_temperature_c: f64,
    /// When the ground station uplinks `Arm`, in s.
    #[serde(default = "default_arm_time")]
    pub arm_time_s: f64,
    /// When the ground station uplinks `Abort`, if at all, in s.
    #[serde(default)]
    pub abort_time_s: Option<f64>,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default = "default_barometers")]
    pub barometers: Vec<SimBaroConfig>,
    #[serde(default = "default_imus")]
    pub imus: Vec<SimImuConfig>,
}

fn default_seed() -> u64 {
    7
}

fn default_duration() -> f64 {
    120.0
}

fn default_pad_pressure() -> f64 {
    95_000.0
}

fn default_pad_temperature() -> f64 {
    20.0
}

fn default_arm_time() -> f64 {
    1.0
}

fn default_barometers() -> Vec<SimBaroConfig> {
    vec![SimBaroConfig::default(); 3]
}

fn default_imus() -> Vec<SimImuConfig> {
    vec![SimImuConfig::default(); 2]
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let mut config: ScenarioConfig = Figment::new().merge(Toml::file(path)).extract()?;
        config.finalize()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ScenarioError> {
        let mut config: ScenarioConfig =
            toml::from_str(raw).map_err(|e| ScenarioError::Invalid(e.to_string()))?;
        config.finalize()?;
        Ok(config)
    }

    /// Cross-field checks, and the device arrays drive the pipeline
    /// instance counts so the two can never disagree.
    fn finalize(&mut self) -> Result<(), ScenarioError> {
        if self.barometers.is_empty() || self.imus.is_empty() {
            return Err(ScenarioError::Invalid(
                "a scenario needs at least one barometer and one IMU".into(),
            ));
        }
        if self.duration_s <= 0.0 {
            return Err(ScenarioError::Invalid("duration_s must be positive".into()));
        }
        if self.barometers.iter().any(|b| b.noise_std_pa < 0.0)
            || self
                .imus
                .iter()
                .any(|i| i.accel_noise_std < 0.0 || i.gyro_noise_std < 0.0)
        {
            return Err(ScenarioError::Invalid(
                "noise standard deviations must be non-negative".into(),
            ));
        }
        if self.profile.main_opening_s <= 0.0 {
            return Err(ScenarioError::Invalid(
                "profile.main_opening_s must be positive".into(),
            ));
        }
        if self.profile.main_rate <= 0.0 || self.profile.drogue_rate <= self.profile.main_rate {
            return Err(ScenarioError::Invalid(
                "profile descent rates must satisfy drogue_rate > main_rate > 0".into(),
            ));
        }
        self.pipeline.n_baro = self.barometers.len();
        self.pipeline.n_imu = self.imus.len();
        Ok(())
    }
}
