// kestrel_core/src/sensors.rs

//! Hardware boundary.
//!
//! The pipeline talks to sensors only through these traits, so the same
//! acquisition and estimation code runs against real drivers and against
//! the simulated devices in `kestrel_sim`.
//!
//! Barometric parts deliver pressure and temperature as two separate
//! conversions with a non-trivial settling time, so [`BaroSampler`]
//! interleaves them: each acquisition cycle advances one conversion and a
//! complete sample costs two cycles. Inertial parts read in one shot and
//! return raw counts; [`ImuScale`] maps counts to SI units.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{BaroSample, ImuSample};
use crate::types::{Tick, GRAVITY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("device not responding")]
    NotResponding,
    #[error("conversion not finished")]
    NotReady,
}

/// Which conversion a barometer should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaroChannel {
    Pressure,
    Temperature,
}

pub trait Barometer {
    /// Starts a conversion on the given channel.
    fn prepare(&mut self, channel: BaroChannel) -> Result<(), SensorError>;
    /// Latches the finished conversion into the device's ADC registers.
    fn read(&mut self) -> Result<(), SensorError>;
    /// Compensates the latched readings, returning pressure in Pa and
    /// temperature in deg C. Valid once both channels have been read
    /// since power-up.
    fn get_measurement(&mut self) -> Result<(f64, f64), SensorError>;
}

pub trait InertialUnit {
    /// Raw accelerometer counts for x, y, z.
    fn read_accel_raw(&mut self) -> Result<[i16; 3], SensorError>;
    /// Raw gyroscope counts for x, y, z.
    fn read_gyro_raw(&mut self) -> Result<[i16; 3], SensorError>;
}

// --- Barometer acquisition ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaroStep {
    Temperature,
    Pressure,
}

/// Drives one barometer through its conversion interleave. `advance` is
/// called once per acquisition cycle and yields a full sample on every
/// second call.
#[derive(Debug, Clone)]
pub struct BaroSampler {
    step: BaroStep,
}

impl Default for BaroSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl BaroSampler {
    pub fn new() -> Self {
        Self {
            step: BaroStep::Temperature,
        }
    }

    pub fn advance<B: Barometer>(
        &mut self,
        device: &mut B,
        tick: Tick,
    ) -> Result<Option<BaroSample>, SensorError> {
        match self.step {
            BaroStep::Temperature => {
                device.prepare(BaroChannel::Temperature)?;
                device.read()?;
                self.step = BaroStep::Pressure;
                Ok(None)
            }
            BaroStep::Pressure => {
                device.prepare(BaroChannel::Pressure)?;
                device.read()?;
                let (pressure_pa, temperature_c) = device.get_measurement()?;
                self.step = BaroStep::Temperature;
                Ok(Some(BaroSample {
                    pressure_pa,
                    temperature_c,
                    tick,
                }))
            }
        }
    }
}

// --- Inertial acquisition ---

/// Count-to-SI scale factors. Defaults match a +/-32 g, +/-2000 deg/s
/// part (1024 LSB/g, 16.4 LSB/(deg/s)).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImuScale {
    /// Accelerometer sensitivity in LSB per g.
    #[serde(default = "default_accel_sensitivity")]
    pub accel_lsb_per_g: f64,
    /// Gyroscope sensitivity in LSB per deg/s.
    #[serde(default = "default_gyro_sensitivity")]
    pub gyro_lsb_per_dps: f64,
}

fn default_accel_sensitivity() -> f64 {
    1024.0
}

fn default_gyro_sensitivity() -> f64 {
    16.4
}

impl Default for ImuScale {
    fn default() -> Self {
        Self {
            accel_lsb_per_g: default_accel_sensitivity(),
            gyro_lsb_per_dps: default_gyro_sensitivity(),
        }
    }
}

impl ImuScale {
    /// Accelerometer counts to m/s^2.
    pub fn accel_to_si(&self, raw: [i16; 3]) -> Vector3<f64> {
        Vector3::new(
            f64::from(raw[0]) / self.accel_lsb_per_g * GRAVITY,
            f64::from(raw[1]) / self.accel_lsb_per_g * GRAVITY,
            f64::from(raw[2]) / self.accel_lsb_per_g * GRAVITY,
        )
    }

    /// Gyroscope counts to rad/s.
    pub fn gyro_to_si(&self, raw: [i16; 3]) -> Vector3<f64> {
        let scale = std::f64::consts::PI / 180.0 / self.gyro_lsb_per_dps;
        Vector3::new(
            f64::from(raw[0]) * scale,
            f64::from(raw[1]) * scale,
            f64::from(raw[2]) * scale,
        )
    }

    /// Reads both raw channels and converts to an SI sample.
    pub fn sample<I: InertialUnit>(
        &self,
        device: &mut I,
        tick: Tick,
    ) -> Result<ImuSample, SensorError> {
        let accel = device.read_accel_raw()?;
        let gyro = device.read_gyro_raw()?;
        Ok(ImuSample {
            accel: self.accel_to_si(accel),
            gyro: self.gyro_to_si(gyro),
            tick,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct ScriptedBaro {
        prepared: Vec<BaroChannel>,
        reads: usize,
        pressure_pa: f64,
        temperature_c: f64,
        fail_read: bool,
    }

    impl ScriptedBaro {
        fn new(pressure_pa: f64, temperature_c: f64) -> Self {
            Self {
                prepared: Vec::new(),
                reads: 0,
                pressure_pa,
                temperature_c,
                fail_read: false,
            }
        }
    }

    impl Barometer for ScriptedBaro {
        fn prepare(&mut self, channel: BaroChannel) -> Result<(), SensorError> {
            self.prepared.push(channel);
            Ok(())
        }

        fn read(&mut self) -> Result<(), SensorError> {
            if self.fail_read {
                return Err(SensorError::NotResponding);
            }
            self.reads += 1;
            Ok(())
        }

        fn get_measurement(&mut self) -> Result<(f64, f64), SensorError> {
            if self.reads < 2 {
                return Err(SensorError::NotReady);
            }
            Ok((self.pressure_pa, self.temperature_c))
        }
    }

    struct FixedImu {
        accel: [i16; 3],
        gyro: [i16; 3],
    }

    impl InertialUnit for FixedImu {
        fn read_accel_raw(&mut self) -> Result<[i16; 3], SensorError> {
            Ok(self.accel)
        }

        fn read_gyro_raw(&mut self) -> Result<[i16; 3], SensorError> {
            Ok(self.gyro)
        }
    }

    #[test]
    fn test_baro_sampler_yields_every_second_cycle() {
        let mut device = ScriptedBaro::new(95_000.0, 21.5);
        let mut sampler = BaroSampler::new();

        assert_eq!(sampler.advance(&mut device, 0).unwrap(), None);
        let sample = sampler.advance(&mut device, 5).unwrap().unwrap();
        assert_eq!(sample.pressure_pa, 95_000.0);
        assert_eq!(sample.temperature_c, 21.5);
        assert_eq!(sample.tick, 5);
        // Channels alternate temperature then pressure.
        assert_eq!(
            device.prepared,
            vec![BaroChannel::Temperature, BaroChannel::Pressure]
        );

        assert_eq!(sampler.advance(&mut device, 10).unwrap(), None);
        assert!(sampler.advance(&mut device, 15).unwrap().is_some());
    }

    #[test]
    fn test_baro_sampler_propagates_device_errors() {
        let mut device = ScriptedBaro::new(95_000.0, 21.5);
        device.fail_read = true;
        let mut sampler = BaroSampler::new();
        assert_eq!(
            sampler.advance(&mut device, 0),
            Err(SensorError::NotResponding)
        );
    }

    #[test]
    fn test_imu_scale_converts_counts_to_si() {
        let scale = ImuScale::default();
        let mut device = FixedImu {
            accel: [0, 0, 1024],
            gyro: [164, 0, -164],
        };
        let sample = scale.sample(&mut device, 42).unwrap();
        // 1024 LSB is exactly one g.
        assert_abs_diff_eq!(sample.accel.z, GRAVITY, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.accel.x, 0.0, epsilon = 1e-12);
        // 164 LSB is 10 deg/s.
        assert_abs_diff_eq!(
            sample.gyro.x,
            10.0 * std::f64::consts::PI / 180.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(sample.gyro.z, -sample.gyro.x, epsilon = 1e-12);
        assert_eq!(sample.tick, 42);
    }
}
