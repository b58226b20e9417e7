// kestrel_core/src/estimation/kalman.rs

//! Fixed-timestep linear Kalman filter for the vertical channel.
//!
//! State is `[altitude_agl, vertical_velocity, accel_bias]`, driven by the
//! tilt-compensated vertical specific force and corrected by one altitude
//! row per trusted barometer. The mounting tilt from calibration is the
//! orientation component of the model: it scales the raw axis reading into
//! the vertical before the input reaches the filter.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::elimination::{Trust, TrustMask};
use crate::estimation::{EstimationError, FilterState};
use crate::messages::StateEstimate;
use crate::types::Tick;

const STATE_DIM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Control period in s.
    pub dt: f64,
    /// Std of unmodeled vertical acceleration, in m/s^2. Drives the
    /// process noise of altitude and velocity.
    pub sigma_accel: f64,
    /// Random-walk std of the accelerometer bias, in m/s^2 per sqrt(s).
    pub sigma_bias: f64,
    /// Altitude measurement noise std per barometer, in m.
    pub baro_noise_std: f64,
    /// Initial covariance diagonal for `[altitude, velocity, bias]`.
    pub initial_variance: [f64; 3],
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            sigma_accel: 0.6,
            sigma_bias: 0.02,
            baro_noise_std: 1.5,
            initial_variance: [1.0, 1.0, 0.25],
        }
    }
}

/// A concrete vertical-channel Kalman filter with a per-barometer
/// measurement row.
pub struct VerticalKalman {
    /// The current state of the filter (x, P, t).
    state: FilterState,
    /// State transition A for the fixed timestep.
    a_mat: DMatrix<f64>,
    /// Input vector B mapping the specific-force input into the state.
    b_mat: DVector<f64>,
    /// The process noise covariance matrix Q.
    process_noise_q: DMatrix<f64>,
    /// Per-instance measurement noise variances, one per barometer row.
    r_diag: Vec<f64>,
    config: KalmanConfig,
    /// Calibration tilt cosine, reported with every estimate.
    tilt: f64,
    /// Last specific-force input, carried over when no trusted IMU
    /// delivers a fresh one.
    last_input: f64,
}

impl VerticalKalman {
    pub fn new(config: KalmanConfig, n_baro: usize) -> Self {
        let (a_mat, b_mat, process_noise_q) = Self::build_matrices(&config);
        Self {
            state: FilterState {
                vector: DVector::zeros(STATE_DIM),
                covariance: DMatrix::from_diagonal(&DVector::from_row_slice(
                    &config.initial_variance,
                )),
                last_update_tick: 0,
                valid: true,
            },
            a_mat,
            b_mat,
            process_noise_q,
            r_diag: vec![config.baro_noise_std * config.baro_noise_std; n_baro],
            config,
            tilt: 1.0,
            last_input: 0.0,
        }
    }

    /// Builds the constant A, B, and Q for the configured timestep.
    fn build_matrices(config: &KalmanConfig) -> (DMatrix<f64>, DVector<f64>, DMatrix<f64>) {
        let dt = config.dt;
        #[rustfmt::skip]
        let a_mat = DMatrix::from_row_slice(STATE_DIM, STATE_DIM, &[
            1.0, dt,  -dt * dt / 2.0,
            0.0, 1.0, -dt,
            0.0, 0.0, 1.0,
        ]);
        let b_mat = DVector::from_row_slice(&[dt * dt / 2.0, dt, 0.0]);

        // Input noise mapped through B, plus the bias random walk. Both
        // terms are symmetric by construction.
        let sigma_a_sq = config.sigma_accel * config.sigma_accel;
        let mut process_noise_q = &b_mat * b_mat.transpose() * sigma_a_sq;
        process_noise_q[(2, 2)] += config.sigma_bias * config.sigma_bias * dt;
        (a_mat, b_mat, process_noise_q)
    }

    /// Fixes the calibration tilt reported alongside the estimate.
    pub fn set_tilt(&mut self, tilt: f64) {
        self.tilt = tilt;
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// The altitude the filter expects the barometers to read now.
    pub fn predicted_altitude(&self) -> f64 {
        self.state.vector[0]
    }

    /// The vertical acceleration the filter currently believes, input
    /// minus the estimated bias.
    pub fn predicted_accel(&self) -> f64 {
        self.last_input - self.state.vector[2]
    }

    /// Advances the state one fixed timestep using the specific-force
    /// input. Runs every cycle, whatever the trust mask says.
    pub fn predict(&mut self, input: Option<f64>) {
        if let Some(u) = input {
            self.last_input = u;
        }
        let u = self.last_input;

        // 1. Propagate the state: x = A x + B u.
        let x_pred = &self.a_mat * &self.state.vector + &self.b_mat * u;

        // 2. Propagate the covariance: P = A P A^T + Q.
        let p_pred =
            &self.a_mat * &self.state.covariance * self.a_mat.transpose() + &self.process_noise_q;

        self.state.vector = x_pred;
        self.state.covariance = symmetrized(p_pred);
    }

    /// Folds every barometer row into one correction. The caller promises
    /// all instances are trusted and fresh.
    pub fn update_full(&mut self, altitudes: &[f64]) -> Result<(), EstimationError> {
        if altitudes.len() != self.r_diag.len() {
            return Err(EstimationError::MeasurementDim {
                expected: self.r_diag.len(),
                got: altitudes.len(),
            });
        }
        let rows: Vec<usize> = (0..self.r_diag.len()).collect();
        self.correct(altitudes, &rows)
    }

    /// Folds only the trusted, fresh barometer rows into the correction.
    /// Eliminated rows are dropped from the measurement model entirely so
    /// their innovations cannot leak back in through near-singular noise
    /// terms. With no usable row the cycle stays predict-only.
    pub fn update_eliminated(
        &mut self,
        altitudes: &[Option<f64>],
        mask: &TrustMask,
    ) -> Result<(), EstimationError> {
        if altitudes.len() != self.r_diag.len() {
            return Err(EstimationError::MeasurementDim {
                expected: self.r_diag.len(),
                got: altitudes.len(),
            });
        }
        if mask.baros.len() != self.r_diag.len() {
            return Err(EstimationError::MeasurementDim {
                expected: self.r_diag.len(),
                got: mask.baros.len(),
            });
        }
        let mut rows = Vec::new();
        let mut z = Vec::new();
        for (i, altitude) in altitudes.iter().enumerate() {
            if mask.baros[i] == Trust::Trusted {
                if let Some(h) = altitude {
                    rows.push(i);
                    z.push(*h);
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }
        self.correct(&z, &rows)
    }

    /// One whole estimation transition: predict, then the update variant
    /// selected by the trust mask.
    pub fn step(
        &mut self,
        tick: Tick,
        input: Option<f64>,
        altitudes: &[Option<f64>],
        mask: &TrustMask,
    ) -> Result<(), EstimationError> {
        self.predict(input);
        self.state.last_update_tick = tick;

        let all_fresh = altitudes.iter().all(Option::is_some);
        let result = if mask.trusted_baros() == self.r_diag.len() && all_fresh {
            let z: Vec<f64> = altitudes.iter().map(|a| a.unwrap_or_default()).collect();
            self.update_full(&z)
        } else {
            self.update_eliminated(altitudes, mask)
        };
        if let Err(e) = &result {
            warn!(tick, error = %e, "kalman update rejected");
        }
        result
    }

    /// The shared correction step over the selected measurement rows,
    /// in Joseph form so the covariance stays symmetric non-negative
    /// under repeated cycles.
    fn correct(&mut self, z: &[f64], rows: &[usize]) -> Result<(), EstimationError> {
        let m = rows.len();

        // 1. Build H and R for the selected rows. Every row observes the
        //    altitude component directly.
        let mut h_mat = DMatrix::zeros(m, STATE_DIM);
        let mut r_mat = DMatrix::zeros(m, m);
        for (row, &instance) in rows.iter().enumerate() {
            h_mat[(row, 0)] = 1.0;
            r_mat[(row, row)] = self.r_diag[instance];
        }

        // 2. Innovation and its covariance: y = z - H x, S = H P H^T + R.
        let z_vec = DVector::from_row_slice(z);
        let y = &z_vec - &h_mat * &self.state.vector;
        let s = &h_mat * &self.state.covariance * h_mat.transpose() + &r_mat;

        // 3. A singular S rejects the whole update; the prior state and
        //    covariance stay untouched and validity drops until re-init.
        let Some(s_inv) = s.try_inverse() else {
            self.state.valid = false;
            return Err(EstimationError::SingularInnovation);
        };

        // 4. Gain, state, and Joseph-form covariance.
        let k_gain = &self.state.covariance * h_mat.transpose() * s_inv;
        let i_kh = DMatrix::identity(STATE_DIM, STATE_DIM) - &k_gain * &h_mat;
        let p_new = &i_kh * &self.state.covariance * i_kh.transpose()
            + &k_gain * &r_mat * k_gain.transpose();

        self.state.vector += &k_gain * y;
        self.state.covariance = symmetrized(p_new);
        Ok(())
    }

    /// Discards the filter state and starts over with the configured
    /// initial covariance. The only way back to a valid estimate after a
    /// failed update; never called automatically.
    pub fn reinit(&mut self) {
        let (a_mat, b_mat, process_noise_q) = Self::build_matrices(&self.config);
        self.a_mat = a_mat;
        self.b_mat = b_mat;
        self.process_noise_q = process_noise_q;
        self.state.vector = DVector::zeros(STATE_DIM);
        self.state.covariance =
            DMatrix::from_diagonal(&DVector::from_row_slice(&self.config.initial_variance));
        self.state.valid = true;
        self.last_input = 0.0;
    }

    /// The public estimate for the current tick.
    pub fn estimate(&self) -> StateEstimate {
        StateEstimate {
            altitude_agl: self.state.vector[0],
            vertical_velocity: self.state.vector[1],
            vertical_accel: self.predicted_accel(),
            tilt: self.tilt,
            tick: self.state.last_update_tick,
            valid: self.state.valid,
        }
    }
}

/// Forces exact symmetry after a round of products that are symmetric only
/// up to rounding.
fn symmetrized(p: DMatrix<f64>) -> DMatrix<f64> {
    (&p + p.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const F64_EPSILON: f64 = 1e-9;

    fn assert_covariance_well_formed(filter: &VerticalKalman) {
        let p = &filter.state().covariance;
        for i in 0..STATE_DIM {
            assert!(
                p[(i, i)] >= 0.0,
                "negative variance at ({i},{i}): {}",
                p[(i, i)]
            );
            for j in 0..STATE_DIM {
                assert_abs_diff_eq!(p[(i, j)], p[(j, i)], epsilon = F64_EPSILON);
            }
        }
    }

    #[test]
    fn test_predict_integrates_input() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 2);
        // One second of 10 m/s^2 with no corrections.
        for _ in 0..100 {
            filter.predict(Some(10.0));
        }
        let est = filter.estimate();
        assert_abs_diff_eq!(est.vertical_velocity, 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(est.altitude_agl, 5.0, epsilon = 1e-3);
    }

    #[test]
    fn test_update_pulls_altitude_toward_measurements() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 2);
        let mask = TrustMask::all_trusted(2, 1);
        for tick in 0..200 {
            filter
                .step(tick, Some(0.0), &[Some(5.0), Some(5.0)], &mask)
                .unwrap();
        }
        let est = filter.estimate();
        assert_abs_diff_eq!(est.altitude_agl, 5.0, epsilon = 0.1);
        assert_abs_diff_eq!(est.vertical_velocity, 0.0, epsilon = 0.1);
        assert!(est.valid);
    }

    #[test]
    fn test_covariance_stays_well_formed_under_every_mask() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 3);
        let full = TrustMask::all_trusted(3, 2);
        let mut one_out = TrustMask::all_trusted(3, 2);
        one_out.baros[1] = Trust::Eliminated;
        let mut all_out = TrustMask::all_trusted(3, 2);
        for t in all_out.baros.iter_mut() {
            *t = Trust::Eliminated;
        }

        let alts = [Some(10.0), Some(11.0), Some(9.5)];
        for cycle in 0..150 {
            let mask = match cycle % 3 {
                0 => &full,
                1 => &one_out,
                _ => &all_out,
            };
            filter.step(cycle, Some(1.0), &alts, mask).unwrap();
            assert_covariance_well_formed(&filter);
        }
    }

    #[test]
    fn test_all_rows_dropped_equals_predict_only() {
        let config = KalmanConfig::default();
        let mut fused = VerticalKalman::new(config, 2);
        let mut coasting = VerticalKalman::new(config, 2);
        let mut mask = TrustMask::all_trusted(2, 1);
        for t in mask.baros.iter_mut() {
            *t = Trust::Eliminated;
        }
        for tick in 0..50 {
            fused
                .step(tick, Some(3.0), &[Some(100.0), Some(101.0)], &mask)
                .unwrap();
            coasting.predict(Some(3.0));
        }
        assert_abs_diff_eq!(
            fused.state().vector[0],
            coasting.state().vector[0],
            epsilon = F64_EPSILON
        );
        assert_abs_diff_eq!(
            fused.state().vector[1],
            coasting.state().vector[1],
            epsilon = F64_EPSILON
        );
    }

    #[test]
    fn test_stale_row_is_dropped_not_zeroed() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 2);
        let mask = TrustMask::all_trusted(2, 1);
        for tick in 0..200 {
            // The second instance never reports; the first carries the fix.
            filter.step(tick, Some(0.0), &[Some(8.0), None], &mask).unwrap();
        }
        assert_abs_diff_eq!(filter.estimate().altitude_agl, 8.0, epsilon = 0.1);
    }

    #[test]
    fn test_singular_innovation_rejects_update_and_preserves_state() {
        let config = KalmanConfig {
            sigma_accel: 0.0,
            sigma_bias: 0.0,
            baro_noise_std: 0.0,
            initial_variance: [0.0, 0.0, 0.0],
            ..KalmanConfig::default()
        };
        let mut filter = VerticalKalman::new(config, 2);
        filter.predict(Some(0.0));
        let before = filter.state().clone();

        let err = filter.update_full(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err, EstimationError::SingularInnovation);
        assert!(!filter.state().valid);
        assert_eq!(filter.state().vector, before.vector);
        assert_eq!(filter.state().covariance, before.covariance);

        // Only the explicit re-init restores validity.
        filter.reinit();
        assert!(filter.state().valid);
    }

    #[test]
    fn test_measurement_dim_mismatch_is_reported() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 3);
        let err = filter.update_full(&[1.0]).unwrap_err();
        assert_eq!(
            err,
            EstimationError::MeasurementDim {
                expected: 3,
                got: 1
            }
        );
    }

    #[test]
    fn test_missing_input_carries_last_value() {
        let mut filter = VerticalKalman::new(KalmanConfig::default(), 1);
        filter.predict(Some(4.0));
        filter.predict(None);
        assert_abs_diff_eq!(filter.predicted_accel(), 4.0, epsilon = F64_EPSILON);
        let dt = KalmanConfig::default().dt;
        assert_abs_diff_eq!(
            filter.state().vector[1],
            2.0 * 4.0 * dt,
            epsilon = F64_EPSILON
        );
    }
}
