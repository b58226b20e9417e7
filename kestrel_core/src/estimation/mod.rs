// kestrel_core/src/estimation/mod.rs

//! Recursive vertical-state estimation.

pub mod kalman;

pub use kalman::{KalmanConfig, VerticalKalman};

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::types::Tick;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EstimationError {
    /// The innovation covariance has no inverse to numerical precision.
    /// The update was rejected and the prior state kept.
    #[error("innovation covariance is singular to numerical precision")]
    SingularInnovation,
    /// The measurement slice does not cover every barometer instance.
    #[error("expected {expected} measurement rows, got {got}")]
    MeasurementDim { expected: usize, got: usize },
}

/// The filter's internal state (x, P, t).
///
/// `vector` is `[altitude_agl, vertical_velocity, accel_bias]`; its length
/// is fixed when the filter is constructed. `valid` goes false on a failed
/// update and only an explicit re-initialization brings it back.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub vector: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub last_update_tick: Tick,
    pub valid: bool,
}

impl FilterState {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}
