// kestrel_core/src/pipeline.rs

//! Per-cycle orchestration.
//!
//! [`FlightPipeline`] owns every piece of flight logic and runs them in a
//! fixed order once per estimation cycle:
//!
//! 1. stale filtering and unit conversion of the snapshot,
//! 2. trust policy against the estimator's current prediction,
//! 3. Kalman predict plus the update variant the mask selects,
//! 4. phase machine evaluation,
//! 5. recording, one record per data class per cycle.
//!
//! The caller owns the cadence and the snapshot hand-off; the pipeline
//! never blocks and never touches hardware.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::{
    CalibrationData, GyroBiasConfig, GyroBiasSession, MagCalConfig, MagCalSession,
};
use crate::elimination::{BaroObservation, EliminationConfig, EliminationPolicy, ImuObservation};
use crate::estimation::{KalmanConfig, VerticalKalman};
use crate::messages::{BaroSample, Command, ImuSample, SampleSnapshot, StateEstimate, TrustEvent};
use crate::phase::{FlightPhase, FlightPhaseFsm, FsmInput, PhaseConfig, PhaseTransition};
use crate::recorder::{FlightRecord, RecordData, Recorder};
use crate::types::{pressure_to_altitude, Tick};

// =========================================================================
// == Configuration ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Barometer instances wired to the board.
    #[serde(default = "default_n_baro")]
    pub n_baro: usize,
    /// IMU instances wired to the board.
    #[serde(default = "default_n_imu")]
    pub n_imu: usize,
    /// A sample older than this many ms counts as missing.
    #[serde(default = "default_stale_after")]
    pub stale_after: Tick,
    /// Trusted pad pressure samples required before arming completes.
    #[serde(default = "default_pad_samples")]
    pub pad_reference_min_samples: u32,
    #[serde(default)]
    pub kalman: KalmanConfig,
    #[serde(default)]
    pub elimination: EliminationConfig,
    #[serde(default)]
    pub phase: PhaseConfig,
    #[serde(default)]
    pub gyro: GyroBiasConfig,
    #[serde(default)]
    pub mag: MagCalConfig,
}

fn default_n_baro() -> usize {
    3
}

fn default_n_imu() -> usize {
    2
}

fn default_stale_after() -> Tick {
    50
}

fn default_pad_samples() -> u32 {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_baro: default_n_baro(),
            n_imu: default_n_imu(),
            stale_after: default_stale_after(),
            pad_reference_min_samples: default_pad_samples(),
            kalman: KalmanConfig::default(),
            elimination: EliminationConfig::default(),
            phase: PhaseConfig::default(),
            gyro: GyroBiasConfig::default(),
            mag: MagCalConfig::default(),
        }
    }
}

/// What one cycle produced, beyond the records already sunk.
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub estimate: StateEstimate,
    pub transition: Option<PhaseTransition>,
    pub trust_events: Vec<TrustEvent>,
}

// =========================================================================
// == Pipeline ==
// =========================================================================

pub struct FlightPipeline {
    config: PipelineConfig,
    calibration: CalibrationData,
    gyro_session: GyroBiasSession,
    mag_session: MagCalSession,
    elimination: EliminationPolicy,
    filter: VerticalKalman,
    fsm: FlightPhaseFsm,
    /// Working conversion reference in Pa. Bootstrapped from the first
    /// pressure sample, replaced by the averaged pad pressure on arming.
    reference_pressure: Option<f64>,
    pad_pressure_sum: f64,
    pad_samples: u32,
    rest_accel_sum: Vector3<f64>,
    rest_samples: u32,
    orientation_done: bool,
    last_baro_recorded: Vec<Option<Tick>>,
    last_imu_recorded: Vec<Option<Tick>>,
}

impl FlightPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let filter = VerticalKalman::new(config.kalman, config.n_baro);
        let elimination = EliminationPolicy::new(config.elimination, config.n_baro, config.n_imu);
        let fsm = FlightPhaseFsm::new(config.phase);
        let gyro_session = GyroBiasSession::new(config.gyro);
        let mag_session = MagCalSession::new(config.mag);
        Self {
            last_baro_recorded: vec![None; config.n_baro],
            last_imu_recorded: vec![None; config.n_imu],
            config,
            calibration: CalibrationData::default(),
            gyro_session,
            mag_session,
            elimination,
            filter,
            fsm,
            reference_pressure: None,
            pad_pressure_sum: 0.0,
            pad_samples: 0,
            rest_accel_sum: Vector3::zeros(),
            rest_samples: 0,
            orientation_done: false,
        }
    }

    pub fn phase(&self) -> FlightPhase {
        self.fsm.phase()
    }

    pub fn calibration(&self) -> &CalibrationData {
        &self.calibration
    }

    pub fn mask(&self) -> crate::elimination::TrustMask {
        self.elimination.mask()
    }

    pub fn reference_pressure(&self) -> Option<f64> {
        self.reference_pressure
    }

    pub fn estimate(&self) -> StateEstimate {
        self.filter.estimate()
    }

    /// Runs one estimation cycle over an already-captured snapshot.
    pub fn cycle<R: Recorder>(
        &mut self,
        snapshot: &SampleSnapshot,
        command: Option<Command>,
        recorder: &mut R,
    ) -> CycleOutput {
        let tick = snapshot.tick;

        // 1. Drop stale instances and lock the conversion reference to the
        //    first pressure ever seen, so pre-arm altitudes start near zero.
        let baros: Vec<Option<BaroSample>> = snapshot
            .baros
            .iter()
            .map(|s| s.filter(|s| self.fresh(tick, s.tick)))
            .collect();
        let imus: Vec<Option<ImuSample>> = snapshot
            .imus
            .iter()
            .map(|s| s.filter(|s| self.fresh(tick, s.tick)))
            .collect();
        if self.reference_pressure.is_none() {
            if let Some(first) = baros.iter().flatten().next() {
                info!(pressure_pa = first.pressure_pa, "bootstrap pressure reference");
                self.reference_pressure = Some(first.pressure_pa);
            }
        }

        // 2. Convert to the quantities the policy and the filter consume.
        let reference = self
            .reference_pressure
            .unwrap_or(crate::types::SEA_LEVEL_PRESSURE);
        let baro_obs: Vec<Option<BaroObservation>> = baros
            .iter()
            .map(|s| {
                s.map(|s| BaroObservation {
                    pressure_pa: s.pressure_pa,
                    altitude: pressure_to_altitude(s.pressure_pa, reference),
                })
            })
            .collect();
        let imu_obs: Vec<Option<ImuObservation>> = imus
            .iter()
            .map(|s| {
                s.map(|s| ImuObservation {
                    accel: s.accel,
                    vertical_accel: self.calibration.vertical_accel(&s.accel),
                })
            })
            .collect();

        // 3. Trust policy against the current prediction, then the mask
        //    everything downstream sees this cycle.
        let trust_events = self.elimination.update(
            tick,
            &baro_obs,
            &imu_obs,
            self.filter.predicted_altitude(),
            self.filter.predicted_accel(),
        );
        let mask = self.elimination.mask();

        // 4. Kalman step. A rejected update already dropped validity and
        //    logged; the cycle carries on and the phase machine's abort
        //    timeout deals with persistent failure.
        let input = {
            let trusted: Vec<f64> = imu_obs
                .iter()
                .zip(mask.imus.iter())
                .filter(|(_, t)| t.is_trusted())
                .filter_map(|(o, _)| o.map(|o| o.vertical_accel))
                .collect();
            (!trusted.is_empty()).then(|| trusted.iter().sum::<f64>() / trusted.len() as f64)
        };
        let altitudes: Vec<Option<f64>> = baro_obs.iter().map(|o| o.map(|o| o.altitude)).collect();
        let _ = self.filter.step(tick, input, &altitudes, &mask);

        // 5. Calibration sessions only run while the machine says so.
        if self.fsm.phase() == FlightPhase::Calibrating {
            if command == Some(Command::Recalibrate) {
                info!(tick, "recalibrate commanded, discarding progress");
                self.restart_calibration();
            }
            self.feed_calibration(snapshot, &imus, &baros, &mask, tick);
        }
        let calibration_complete =
            self.orientation_done && self.pad_samples >= self.config.pad_reference_min_samples;

        // 6. Phase machine.
        let estimate = self.filter.estimate();
        let fsm_command = match command {
            Some(Command::Arm) | Some(Command::Abort) => command,
            _ => None,
        };
        let transition = self.fsm.update(
            tick,
            &FsmInput {
                estimate,
                command: fsm_command,
                sensors_ready: snapshot.all_sources_reporting(),
                calibration_complete,
                degraded: mask.any_eliminated(),
            },
        );
        match transition.map(|t| t.to) {
            Some(FlightPhase::Calibrating) => self.restart_calibration(),
            Some(FlightPhase::Armed) => self.finish_arming(),
            _ => {}
        }

        // 7. Records, at most one per data class per instance per cycle.
        for (id, sample) in baros.iter().enumerate() {
            if let Some(sample) = *sample {
                if self.last_baro_recorded[id] != Some(sample.tick) {
                    self.last_baro_recorded[id] = Some(sample.tick);
                    recorder.record(FlightRecord {
                        tick,
                        data: RecordData::Baro { id, sample },
                    });
                }
            }
        }
        for (id, sample) in imus.iter().enumerate() {
            if let Some(sample) = *sample {
                if self.last_imu_recorded[id] != Some(sample.tick) {
                    self.last_imu_recorded[id] = Some(sample.tick);
                    recorder.record(FlightRecord {
                        tick,
                        data: RecordData::Imu { id, sample },
                    });
                }
            }
        }
        recorder.record(FlightRecord {
            tick,
            data: RecordData::Estimate(estimate),
        });
        if let Some(t) = transition {
            recorder.record(FlightRecord {
                tick,
                data: RecordData::Phase(t),
            });
        }
        for event in &trust_events {
            recorder.record(FlightRecord {
                tick,
                data: RecordData::Trust(*event),
            });
        }

        CycleOutput {
            estimate,
            transition,
            trust_events,
        }
    }

    fn fresh(&self, cycle_tick: Tick, sample_tick: Tick) -> bool {
        cycle_tick.saturating_sub(sample_tick) <= self.config.stale_after
    }

    /// Accumulates pad pressure and rest attitude, and advances the gyro
    /// and magnetometer sessions. Trusted instances only; a faulty sensor
    /// must not poison the reference.
    fn feed_calibration(
        &mut self,
        snapshot: &SampleSnapshot,
        imus: &[Option<ImuSample>],
        baros: &[Option<BaroSample>],
        mask: &crate::elimination::TrustMask,
        tick: Tick,
    ) {
        for (sample, trust) in baros.iter().zip(mask.baros.iter()) {
            if let Some(sample) = sample {
                if trust.is_trusted() {
                    self.pad_pressure_sum += sample.pressure_pa;
                    self.pad_samples += 1;
                }
            }
        }

        let trusted_imus: Vec<&ImuSample> = imus
            .iter()
            .zip(mask.imus.iter())
            .filter(|(_, t)| t.is_trusted())
            .filter_map(|(s, _)| s.as_ref())
            .collect();
        if !trusted_imus.is_empty() {
            let n = trusted_imus.len() as f64;
            let mean_accel: Vector3<f64> =
                trusted_imus.iter().map(|s| s.accel).sum::<Vector3<f64>>() / n;
            let mean_gyro: Vector3<f64> =
                trusted_imus.iter().map(|s| s.gyro).sum::<Vector3<f64>>() / n;
            self.rest_accel_sum += mean_accel;
            self.rest_samples += 1;
            self.gyro_session.feed(&mean_gyro);
        }

        if let Some(mag) = &snapshot.mag {
            if self.fresh(tick, mag.tick) {
                self.mag_session.add_sample(&mag.field);
            }
        }

        if self.gyro_session.is_complete() && !self.orientation_done && self.rest_samples > 0 {
            let rest = self.rest_accel_sum / f64::from(self.rest_samples);
            self.calibration.calibrate_orientation(&rest);
            if let Some(bias) = self.gyro_session.bias() {
                self.calibration.gyro_bias = bias;
            }
            self.filter.set_tilt(self.calibration.angle);
            self.orientation_done = true;
        }
    }

    fn restart_calibration(&mut self) {
        self.gyro_session.reset();
        self.mag_session.reset();
        self.orientation_done = false;
        self.pad_pressure_sum = 0.0;
        self.pad_samples = 0;
        self.rest_accel_sum = Vector3::zeros();
        self.rest_samples = 0;
    }

    /// Locks the averaged pad pressure in as the AGL reference and starts
    /// the filter over from the pad, so the armed estimate reads zero.
    fn finish_arming(&mut self) {
        if self.pad_samples > 0 {
            let reference = self.pad_pressure_sum / f64::from(self.pad_samples);
            info!(reference_pa = reference, "pad reference locked");
            self.reference_pressure = Some(reference);
        }
        if self.mag_session.ready() {
            if let Some((bias, radius)) = self.mag_session.fit() {
                self.calibration.mag_bias = bias;
                self.calibration.mag_radius = radius;
            }
        }
        self.filter.reinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elimination::Trust;
    use crate::phase::DeploymentIntent;
    use crate::recorder::MemoryRecorder;
    use crate::types::GRAVITY;
    use approx::assert_abs_diff_eq;

    const PAD_PRESSURE: f64 = 95_000.0;
    const DT: f64 = 0.01;

    fn pressure_at(altitude: f64) -> f64 {
        PAD_PRESSURE * (1.0 - altitude / 44_330.0).powf(1.0 / 0.190_3)
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            pad_reference_min_samples: 10,
            gyro: GyroBiasConfig {
                window: 20,
                ..GyroBiasConfig::default()
            },
            phase: PhaseConfig {
                liftoff_debounce: 3,
                min_powered_cycles: 20,
                main_altitude: 60.0,
                landing_debounce: 20,
                invalid_abort_cycles: 50,
                ..PhaseConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    /// Truth-in-the-loop bed: integrates a vertical trajectory and feeds
    /// the pipeline consistent pressure and specific-force samples.
    struct FlightBed {
        pipeline: FlightPipeline,
        recorder: MemoryRecorder,
        n_baro: usize,
        n_imu: usize,
        tick: Tick,
        altitude: f64,
        velocity: f64,
        transitions: Vec<PhaseTransition>,
    }

    impl FlightBed {
        fn new(config: PipelineConfig) -> Self {
            Self {
                n_baro: config.n_baro,
                n_imu: config.n_imu,
                pipeline: FlightPipeline::new(config),
                recorder: MemoryRecorder::new(),
                tick: 0,
                altitude: 0.0,
                velocity: 0.0,
                transitions: Vec::new(),
            }
        }

        fn snapshot(&self, accel_z: f64) -> SampleSnapshot {
            let mut snap = SampleSnapshot::new(self.n_baro, self.n_imu);
            snap.tick = self.tick;
            for slot in &mut snap.baros {
                *slot = Some(BaroSample {
                    pressure_pa: pressure_at(self.altitude),
                    temperature_c: 20.0,
                    tick: self.tick,
                });
            }
            for slot in &mut snap.imus {
                *slot = Some(ImuSample {
                    accel: Vector3::new(0.0, 0.0, accel_z),
                    gyro: Vector3::zeros(),
                    tick: self.tick,
                });
            }
            snap
        }

        fn step(&mut self, accel_true: f64, command: Option<Command>) -> CycleOutput {
            self.tick += 10;
            self.velocity += accel_true * DT;
            self.altitude += self.velocity * DT;
            if self.altitude < 0.0 {
                self.altitude = 0.0;
                self.velocity = self.velocity.max(0.0);
            }
            // A resting or thrusting body measures true accel plus gravity.
            let snap = self.snapshot(accel_true + GRAVITY);
            let out = self.pipeline.cycle(&snap, command, &mut self.recorder);
            if let Some(t) = out.transition {
                self.transitions.push(t);
            }
            out
        }

        fn run(&mut self, cycles: usize, accel_true: f64) {
            for _ in 0..cycles {
                self.step(accel_true, None);
            }
        }

        fn run_until(
            &mut self,
            accel_true: f64,
            cap: usize,
            done: impl Fn(&FlightBed) -> bool,
        ) -> bool {
            for _ in 0..cap {
                self.step(accel_true, None);
                if done(self) {
                    return true;
                }
            }
            false
        }
    }

    fn arm(bed: &mut FlightBed) {
        bed.run(5, 0.0);
        bed.step(0.0, Some(Command::Arm));
        assert!(bed.run_until(0.0, 200, |b| b.pipeline.phase() == FlightPhase::Armed));
    }

    #[test]
    fn test_startup_calibrates_and_arms_at_zero_altitude() {
        let mut bed = FlightBed::new(test_config());
        arm(&mut bed);

        assert_abs_diff_eq!(
            bed.pipeline.reference_pressure().unwrap(),
            PAD_PRESSURE,
            epsilon = 1.0
        );
        // Armed re-init puts the state back on the pad.
        let est = bed.pipeline.estimate();
        assert!(est.valid);
        assert_abs_diff_eq!(est.altitude_agl, 0.0, epsilon = 0.5);
        // Level mount: dominant axis z with full gravity projection.
        assert_eq!(bed.pipeline.calibration().axis, 2);
        assert_abs_diff_eq!(bed.pipeline.calibration().angle, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_full_flight_walks_phases_and_deploys_once_each() {
        let mut bed = FlightBed::new(test_config());
        arm(&mut bed);

        // Boost 1.5 s at 40 m/s^2, coast past apogee, then chute segments.
        // Every descent-rate change is a finite braking segment the
        // simulated accelerometer measures.
        bed.run(150, 40.0);
        assert!(bed.run_until(-GRAVITY, 2_000, |b| b.velocity <= -10.0));
        bed.run(100, -15.0);
        assert!(bed.run_until(0.0, 3_000, |b| b.altitude <= 55.0));
        bed.run(100, 19.0);
        assert!(bed.run_until(0.0, 3_000, |b| b.altitude <= 3.0));
        bed.run(20, 30.0);
        bed.run(200, 0.0);

        let phases: Vec<FlightPhase> = bed.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                FlightPhase::Calibrating,
                FlightPhase::Armed,
                FlightPhase::PoweredAscent,
                FlightPhase::CoastAscent,
                FlightPhase::Apogee,
                FlightPhase::DrogueDescent,
                FlightPhase::MainDescent,
                FlightPhase::Landed,
            ]
        );
        let intents: Vec<DeploymentIntent> =
            bed.transitions.iter().filter_map(|t| t.intent).collect();
        assert_eq!(
            intents,
            vec![DeploymentIntent::DeployDrogue, DeploymentIntent::DeployMain]
        );
        // Every cycle produced exactly one estimate record, every
        // transition exactly one phase record.
        assert_eq!(
            bed.recorder.count_of("estimate") as u64,
            bed.tick / 10
        );
        assert_eq!(bed.recorder.count_of("phase"), bed.transitions.len());
        assert_eq!(bed.recorder.count_of("trust"), 0);
    }

    #[test]
    fn test_faulty_baro_is_eliminated_and_estimate_survives() {
        let mut bed = FlightBed::new(test_config());
        // Let the covariance settle on clean pad samples first, so the
        // corrupted readings meet flight-representative gains.
        bed.run(200, 0.0);

        let mut events = Vec::new();
        for _ in 0..60 {
            bed.tick += 10;
            let mut snap = bed.snapshot(GRAVITY);
            // Instance 2 reads 800 Pa high, roughly 70 m below the pad.
            if let Some(sample) = &mut snap.baros[2] {
                sample.pressure_pa += 800.0;
            }
            let out = bed.pipeline.cycle(&snap, None, &mut bed.recorder);
            events.extend(out.trust_events);
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 2);
        assert!(events[0].eliminated);
        assert_eq!(bed.pipeline.mask().baros[2], Trust::Eliminated);
        assert_eq!(bed.pipeline.mask().baros[0], Trust::Trusted);

        let est = bed.pipeline.estimate();
        assert!(est.valid);
        assert_abs_diff_eq!(est.altitude_agl, 0.0, epsilon = 2.0);
        assert_eq!(bed.recorder.count_of("trust"), 1);
    }

    #[test]
    fn test_recalibrate_discards_session_progress() {
        let mut bed = FlightBed::new(test_config());
        bed.run(5, 0.0);
        bed.step(0.0, Some(Command::Arm));
        assert_eq!(bed.pipeline.phase(), FlightPhase::Calibrating);

        bed.run(10, 0.0);
        bed.step(0.0, Some(Command::Recalibrate));
        // Progress was discarded; the full window must elapse again.
        for _ in 0..15 {
            bed.step(0.0, None);
            assert_eq!(bed.pipeline.phase(), FlightPhase::Calibrating);
        }
        assert!(bed.run_until(0.0, 200, |b| b.pipeline.phase() == FlightPhase::Armed));
    }

    #[test]
    fn test_unchanged_samples_are_recorded_once() {
        let config = test_config();
        let n_baro = config.n_baro;
        let n_imu = config.n_imu;
        let mut pipeline = FlightPipeline::new(config);
        let mut recorder = MemoryRecorder::new();

        let mut snap = SampleSnapshot::new(n_baro, n_imu);
        snap.tick = 10;
        for slot in &mut snap.baros {
            *slot = Some(BaroSample {
                pressure_pa: PAD_PRESSURE,
                temperature_c: 20.0,
                tick: 10,
            });
        }
        for slot in &mut snap.imus {
            *slot = Some(ImuSample {
                accel: Vector3::new(0.0, 0.0, GRAVITY),
                gyro: Vector3::zeros(),
                tick: 10,
            });
        }

        pipeline.cycle(&snap, None, &mut recorder);
        // Acquisition stalled: next cycle sees the same sample ticks.
        snap.tick = 20;
        pipeline.cycle(&snap, None, &mut recorder);

        assert_eq!(recorder.count_of("baro"), n_baro);
        assert_eq!(recorder.count_of("imu"), n_imu);
        assert_eq!(recorder.count_of("estimate"), 2);
    }

    #[test]
    fn test_abort_command_silences_later_intents() {
        let mut bed = FlightBed::new(test_config());
        arm(&mut bed);
        bed.run(150, 40.0);
        assert_eq!(bed.pipeline.phase(), FlightPhase::PoweredAscent);

        bed.step(-GRAVITY, Some(Command::Abort));
        assert_eq!(bed.pipeline.phase(), FlightPhase::Abort);

        // Fly the rest of the profile; nothing may deploy.
        assert!(bed.run_until(-GRAVITY, 2_000, |b| b.velocity <= -10.0));
        bed.run(100, -15.0);
        assert!(bed.run_until(0.0, 3_000, |b| b.altitude <= 0.1));
        assert!(bed.transitions.iter().all(|t| t.intent.is_none()));
        assert_eq!(bed.pipeline.phase(), FlightPhase::Abort);
    }
}
