// kestrel_core/src/calibration.rs

//! Pre-flight calibration: mounting orientation from a rest sample, gyro
//! bias from a debounced convergence run, magnetometer hard-iron offset
//! from a batch sphere fit.
//!
//! Every routine keeps its accumulator state in an explicit session object
//! owned by the caller, so repeated attempts and test harnesses run
//! independently.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::GRAVITY;

/// Floor on the magnitude of the mounting-angle cosine. Below this the
/// vehicle is mounted at an unsafely shallow angle, but calibration still
/// completes with the clamped value to keep later divisions well away from
/// zero.
pub const MIN_TILT_COSINE: f64 = 0.3;

// =========================================================================
// == Calibration Output ==
// =========================================================================

/// Per-vehicle correction parameters produced before flight and shared
/// read-only with the estimator afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Index of the body axis closest to the gravity vector at rest.
    pub axis: usize,
    /// Cosine of the angle between that axis and gravity, magnitude
    /// clamped to [`MIN_TILT_COSINE`].
    pub angle: f64,
    /// Gyroscope zero-rate offset in rad/s.
    pub gyro_bias: Vector3<f64>,
    /// Magnetometer hard-iron offset in Gauss.
    pub mag_bias: Vector3<f64>,
    /// Fitted field-sphere radius in Gauss.
    pub mag_radius: f64,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self {
            axis: 2,
            angle: 1.0,
            gyro_bias: Vector3::zeros(),
            mag_bias: Vector3::zeros(),
            mag_radius: 0.0,
        }
    }
}

impl CalibrationData {
    /// Fixes the mounting axis and angle from one averaged rest
    /// accelerometer sample.
    ///
    /// The axis with the largest magnitude is taken as the up axis; its
    /// normalized component is the cosine of the mounting angle. Ties
    /// resolve toward the lower axis index. Single pass, cannot fail; a
    /// clamped angle only means the mount is judged shallow.
    pub fn calibrate_orientation(&mut self, rest_accel: &Vector3<f64>) {
        self.axis = dominant_axis(rest_accel);
        let mut angle = rest_accel[self.axis] / GRAVITY;
        if angle.abs() < MIN_TILT_COSINE {
            angle = MIN_TILT_COSINE.copysign(angle);
        }
        self.angle = angle;
        info!(
            axis = self.axis,
            angle = self.angle,
            "orientation calibration complete"
        );
    }

    /// Removes the calibrated zero-rate offset from a gyro sample.
    pub fn apply_gyro(&self, gyro: &Vector3<f64>) -> Vector3<f64> {
        gyro - self.gyro_bias
    }

    /// Removes the hard-iron offset from a magnetometer sample.
    pub fn apply_mag(&self, field: &Vector3<f64>) -> Vector3<f64> {
        field - self.mag_bias
    }

    /// Projects an accelerometer sample onto the vertical axis and removes
    /// gravity: the specific-force input of the estimator.
    pub fn vertical_accel(&self, accel: &Vector3<f64>) -> f64 {
        accel[self.axis] / self.angle - GRAVITY
    }
}

fn dominant_axis(v: &Vector3<f64>) -> usize {
    if v.x.abs() >= v.y.abs() {
        if v.x.abs() >= v.z.abs() {
            0
        } else {
            2
        }
    } else if v.y.abs() >= v.z.abs() {
        1
    } else {
        2
    }
}

// =========================================================================
// == Gyro Bias Session ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroBiasConfig {
    /// Per-axis deviation from the reference sample that still counts as
    /// "at rest", in rad/s.
    pub tolerance: f64,
    /// Number of consecutive stable samples averaged into the bias.
    pub window: u32,
}

impl Default for GyroBiasConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            window: 200,
        }
    }
}

/// Streaming convergence detector for the gyro zero-rate offset.
///
/// Each sample is compared per-axis against a reference; a stable sample
/// extends the streak and is averaged in, any outlier restarts the streak
/// with itself as the new reference. Motion during calibration therefore
/// delays completion indefinitely instead of corrupting the bias.
#[derive(Debug, Clone)]
pub struct GyroBiasSession {
    config: GyroBiasConfig,
    reference: Vector3<f64>,
    average: Vector3<f64>,
    streak: u32,
    done: bool,
}

impl GyroBiasSession {
    pub fn new(config: GyroBiasConfig) -> Self {
        Self {
            config,
            reference: Vector3::zeros(),
            average: Vector3::zeros(),
            streak: 0,
            done: false,
        }
    }

    /// Feeds one gyro sample. Returns true once the session has converged;
    /// samples fed after completion are ignored.
    pub fn feed(&mut self, gyro: &Vector3<f64>) -> bool {
        if self.done {
            return true;
        }
        let error = (self.reference - gyro).abs();
        if error.x < self.config.tolerance
            && error.y < self.config.tolerance
            && error.z < self.config.tolerance
        {
            self.streak += 1;
            if self.streak > self.config.window {
                self.done = true;
                info!(bias = ?self.average, "gyro bias calibration complete");
                return true;
            }
            self.average += gyro / f64::from(self.config.window);
        } else {
            debug!(streak = self.streak, "gyro calibration restarted");
            self.streak = 0;
            self.average = Vector3::zeros();
            self.reference = *gyro;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// The converged bias, available once [`Self::is_complete`] holds.
    pub fn bias(&self) -> Option<Vector3<f64>> {
        self.done.then_some(self.average)
    }

    /// Discards all progress, keeping the configuration.
    pub fn reset(&mut self) {
        self.reference = Vector3::zeros();
        self.average = Vector3::zeros();
        self.streak = 0;
        self.done = false;
    }
}

// =========================================================================
// == Magnetometer Session ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagCalConfig {
    /// Candidate hard-iron offsets span this range per axis, in Gauss.
    pub bias_min: f64,
    pub bias_max: f64,
    /// Candidate sphere radii span this range, in Gauss.
    pub radius_min: f64,
    pub radius_max: f64,
    /// Grid points per dimension.
    pub steps: usize,
    /// Samples to collect before the fit is attempted.
    pub min_samples: usize,
}

impl Default for MagCalConfig {
    fn default() -> Self {
        Self {
            bias_min: -1.0,
            bias_max: 1.0,
            radius_min: 0.2,
            radius_max: 0.8,
            steps: 10,
            min_samples: 32,
        }
    }
}

/// Batch sphere fit for the magnetometer hard-iron offset.
///
/// Samples taken at varied orientations all lie on one sphere around the
/// offset; the session accumulates the squared algebraic residual
/// `radius^2 - |sample - bias|^2` over the whole batch and grid-searches
/// the (bias, radius) tuple minimizing it.
#[derive(Debug, Clone)]
pub struct MagCalSession {
    config: MagCalConfig,
    samples: Vec<Vector3<f64>>,
}

impl MagCalSession {
    pub fn new(config: MagCalConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, field: &Vector3<f64>) {
        self.samples.push(*field);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// True once enough varied-orientation samples are in to attempt a fit.
    pub fn ready(&self) -> bool {
        self.samples.len() >= self.config.min_samples
    }

    /// Grid-searches the (bias, radius) tuple with the smallest summed
    /// squared sphere residual over the collected batch. `None` until at
    /// least one sample is in.
    pub fn fit(&self) -> Option<(Vector3<f64>, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        let c = &self.config;
        let mut best = (Vector3::zeros(), 0.0);
        let mut best_residual = f64::INFINITY;
        for ri in 0..c.steps {
            let radius = grid_value(c.radius_min, c.radius_max, c.steps, ri);
            let radius_sq = radius * radius;
            for xi in 0..c.steps {
                let bx = grid_value(c.bias_min, c.bias_max, c.steps, xi);
                for yi in 0..c.steps {
                    let by = grid_value(c.bias_min, c.bias_max, c.steps, yi);
                    for zi in 0..c.steps {
                        let bz = grid_value(c.bias_min, c.bias_max, c.steps, zi);
                        let bias = Vector3::new(bx, by, bz);
                        let residual: f64 = self
                            .samples
                            .iter()
                            .map(|s| {
                                let r = radius_sq - (s - bias).norm_squared();
                                r * r
                            })
                            .sum();
                        if residual < best_residual {
                            best_residual = residual;
                            best = (bias, radius);
                        }
                    }
                }
            }
        }
        Some(best)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

fn grid_value(min: f64, max: f64, steps: usize, index: usize) -> f64 {
    if steps < 2 {
        return min;
    }
    min + (max - min) * index as f64 / (steps - 1) as f64
}
