// kestrel_sim/src/runner.rs

//! Scenario execution.
//!
//! Both runners wire the same parts the same way: an acquisition task
//! samples the devices and publishes snapshots to the [`SampleBoard`],
//! an estimation task runs the [`FlightPipeline`] over the latest
//! snapshot, and a scripted ground station drives the uplink. The
//! deterministic runner interleaves both tasks on a virtual clock and is
//! reproducible per seed; the realtime runner puts each task on its own
//! thread against the wall clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_core::messages::{Command, SampleSnapshot};
use kestrel_core::phase::{FlightPhase, PhaseTransition};
use kestrel_core::pipeline::FlightPipeline;
use kestrel_core::recorder::MemoryRecorder;
use kestrel_core::sensors::BaroSampler;
use kestrel_core::types::{Tick, GRAVITY};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::board::SampleBoard;
use crate::devices::{SimBarometer, SimImu};
use crate::link::{self, GroundStation, TelemetryFrame, VehicleLink};
use crate::profile::{pressure_at_altitude, FlightProfile, TruthSample};
use crate::scenario::ScenarioConfig;
use crate::scheduler::{Cadence, DeadlineTicker, TaskMetadata, TaskSet, TaskStats};

/// Acquisition period in ms (200 Hz).
pub const ACQUISITION_PERIOD: Tick = 5;
/// Estimation period in ms (100 Hz). Must match the filter timestep.
pub const ESTIMATION_PERIOD: Tick = 10;
/// How long a run keeps going after the phase machine goes terminal.
const TERMINAL_HOLD: Tick = 2_000;

/// IMU RNG streams sit far from the barometer streams so adding
/// instances of one kind never reshuffles the other.
const IMU_SEED_OFFSET: u64 = 1_000;

// =========================================================================
// == Run Summary ==
// =========================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: &'static str,
    pub period_ms: Tick,
    pub stats: TaskStats,
}

/// What one run amounted to, printable as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub cycles: u64,
    pub sim_time_s: f64,
    pub final_phase: FlightPhase,
    pub estimated_apogee_m: f64,
    pub truth_apogee_m: f64,
    pub transitions: Vec<PhaseTransition>,
    pub trust_events: usize,
    pub telemetry_frames: u64,
    pub dropped_uplink_frames: u32,
    pub dropped_downlink_frames: u32,
    pub tasks: Vec<TaskReport>,
}

fn task_reports(tasks: &TaskSet) -> Vec<TaskReport> {
    tasks
        .iter()
        .map(|(metadata, stats)| TaskReport {
            name: metadata.name,
            period_ms: metadata.period,
            stats: *stats,
        })
        .collect()
}

// =========================================================================
// == Tasks ==
// =========================================================================

fn acquisition_metadata() -> TaskMetadata {
    TaskMetadata {
        name: "acquisition",
        period: ACQUISITION_PERIOD,
        budget_us: 2_000,
    }
}

fn estimation_metadata() -> TaskMetadata {
    TaskMetadata {
        name: "estimation",
        period: ESTIMATION_PERIOD,
        budget_us: 5_000,
    }
}

/// The sensor side: simulated devices, their samplers, and the working
/// snapshot the latest readouts accumulate into.
struct AcquisitionTask {
    baros: Vec<(SimBarometer, BaroSampler)>,
    imus: Vec<SimImu>,
    working: SampleSnapshot,
    pad_pressure_pa: f64,
    pad_temperature_c: f64,
}

impl AcquisitionTask {
    fn new(scenario: &ScenarioConfig) -> Self {
        let baros = scenario
            .barometers
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let rng = ChaCha8Rng::seed_from_u64(scenario.seed + i as u64);
                (SimBarometer::new(config.clone(), rng), BaroSampler::new())
            })
            .collect::<Vec<_>>();
        let imus = scenario
            .imus
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let rng = ChaCha8Rng::seed_from_u64(scenario.seed + IMU_SEED_OFFSET + i as u64);
                SimImu::new(config.clone(), rng)
            })
            .collect::<Vec<_>>();
        Self {
            working: SampleSnapshot::new(baros.len(), imus.len()),
            baros,
            imus,
            pad_pressure_pa: scenario.pad_pressure_pa,
            pad_temperature_c: scenario.pad_temperature_c,
        }
    }

    /// Pushes the truth into every device and runs one acquisition cycle.
    /// A failing device leaves its slot on the previous sample; staleness
    /// is the estimation side's problem.
    fn acquire(&mut self, t: f64, truth: TruthSample, tick: Tick) {
        let pressure = pressure_at_altitude(truth.altitude, self.pad_pressure_pa);
        // A resting or thrusting body measures true accel plus gravity.
        let specific_force = Vector3::new(0.0, 0.0, truth.accel + GRAVITY);

        for (i, (device, sampler)) in self.baros.iter_mut().enumerate() {
            device.set_environment(t, pressure, self.pad_temperature_c);
            if let Ok(Some(sample)) = sampler.advance(device, tick) {
                self.working.baros[i] = Some(sample);
            }
        }
        for (i, device) in self.imus.iter_mut().enumerate() {
            device.set_motion(t, specific_force, Vector3::zeros());
            let scale = device.scale();
            if let Ok(sample) = scale.sample(device, tick) {
                self.working.imus[i] = Some(sample);
            }
        }
        self.working.tick = tick;
    }
}

/// The vehicle side: the pipeline plus the fallback snapshot used when
/// the board is contended, and the run counters the summary reports.
struct EstimationTask {
    pipeline: FlightPipeline,
    last_snapshot: SampleSnapshot,
    telemetry_every: u32,
    cycles: u64,
    last_tick: Tick,
    telemetry_frames: u64,
    trust_events: usize,
    transitions: Vec<PhaseTransition>,
    estimated_apogee: f64,
}

impl EstimationTask {
    fn new(scenario: &ScenarioConfig) -> Self {
        let config = scenario.pipeline.clone();
        Self {
            last_snapshot: SampleSnapshot::new(config.n_baro, config.n_imu),
            pipeline: FlightPipeline::new(config),
            telemetry_every: scenario.link.telemetry_every_cycles.max(1),
            cycles: 0,
            last_tick: 0,
            telemetry_frames: 0,
            trust_events: 0,
            transitions: Vec::new(),
            estimated_apogee: 0.0,
        }
    }

    fn cycle(
        &mut self,
        board: &SampleBoard,
        vehicle: &mut VehicleLink,
        recorder: &mut MemoryRecorder,
        tick: Tick,
    ) {
        // A contended board just means this cycle reuses the previous
        // snapshot; the samples inside keep their own acquisition ticks.
        if let Some(snapshot) = board.snapshot() {
            self.last_snapshot = snapshot;
        }
        self.last_snapshot.tick = tick;

        let command = vehicle.poll_command();
        let out = self
            .pipeline
            .cycle(&self.last_snapshot, command, recorder);

        self.cycles += 1;
        self.last_tick = tick;
        self.trust_events += out.trust_events.len();
        self.transitions.extend(out.transition);
        if out.estimate.valid {
            self.estimated_apogee = self.estimated_apogee.max(out.estimate.altitude_agl);
        }

        if self.cycles % u64::from(self.telemetry_every) == 0 {
            let mask = self.pipeline.mask();
            let frame = TelemetryFrame {
                tick,
                phase: self.pipeline.phase(),
                estimate: out.estimate,
                trusted_baros: mask.trusted_baros(),
                trusted_imus: mask.trusted_imus(),
            };
            if vehicle.send_telemetry(&frame) {
                self.telemetry_frames += 1;
            }
        }
    }

    fn phase(&self) -> FlightPhase {
        self.pipeline.phase()
    }

    fn into_summary(
        self,
        scenario: &ScenarioConfig,
        truth_apogee_m: f64,
        sim_time_s: f64,
        dropped_uplink_frames: u32,
        dropped_downlink_frames: u32,
        tasks: Vec<TaskReport>,
    ) -> RunSummary {
        RunSummary {
            scenario: scenario.name.clone(),
            cycles: self.cycles,
            sim_time_s,
            final_phase: self.pipeline.phase(),
            estimated_apogee_m: self.estimated_apogee,
            truth_apogee_m,
            transitions: self.transitions,
            trust_events: self.trust_events,
            telemetry_frames: self.telemetry_frames,
            dropped_uplink_frames,
            dropped_downlink_frames,
            tasks,
        }
    }
}

/// The scripted ground operator: each command fires once, at its
/// scenario time.
struct GroundScript {
    arm_at: Option<f64>,
    abort_at: Option<f64>,
}

impl GroundScript {
    fn new(scenario: &ScenarioConfig) -> Self {
        Self {
            arm_at: Some(scenario.arm_time_s),
            abort_at: scenario.abort_time_s,
        }
    }

    fn poll(&mut self, t: f64) -> Option<Command> {
        if self.arm_at.is_some_and(|at| t >= at) {
            self.arm_at = None;
            return Some(Command::Arm);
        }
        if self.abort_at.is_some_and(|at| t >= at) {
            self.abort_at = None;
            return Some(Command::Abort);
        }
        None
    }
}

fn uplink_or_warn(ground: &mut GroundStation, command: Command) {
    if !ground.send(&command) {
        warn!(?command, "uplink full, command dropped");
    }
}

// =========================================================================
// == Deterministic Runner ==
// =========================================================================

/// Runs the whole scenario on a virtual clock, single-threaded.
/// Identical scenarios produce identical records.
pub fn run_deterministic(scenario: &ScenarioConfig) -> (RunSummary, MemoryRecorder) {
    let profile = FlightProfile::new(scenario.profile);
    let (_, truth_apogee) = profile.apogee();
    info!(
        scenario = %scenario.name,
        seed = scenario.seed,
        truth_apogee_m = truth_apogee,
        "deterministic run"
    );

    let board = SampleBoard::new(scenario.pipeline.n_baro, scenario.pipeline.n_imu);
    let (mut ground, mut vehicle) = link::pair(scenario.link.queue_capacity);
    let mut acquisition = AcquisitionTask::new(scenario);
    let mut estimation = EstimationTask::new(scenario);
    let mut script = GroundScript::new(scenario);
    let mut recorder = MemoryRecorder::new();

    let mut tasks = TaskSet::new();
    let acq_id = tasks.register(acquisition_metadata());
    let est_id = tasks.register(estimation_metadata());
    let mut acq_cadence = Cadence::new(ACQUISITION_PERIOD);
    let mut est_cadence = Cadence::new(ESTIMATION_PERIOD);

    let duration_ticks = (scenario.duration_s * 1_000.0) as Tick;
    let mut terminal_since: Option<Tick> = None;

    let mut tick: Tick = 0;
    while tick <= duration_ticks {
        let t = tick as f64 / 1_000.0;

        if acq_cadence.due(tick) {
            let started = Instant::now();
            if let Some(command) = script.poll(t) {
                uplink_or_warn(&mut ground, command);
            }
            acquisition.acquire(t, profile.sample(t), tick);
            board.publish(&acquisition.working);
            tasks.record(acq_id, started.elapsed());
        }

        if est_cadence.due(tick) {
            let started = Instant::now();
            estimation.cycle(&board, &mut vehicle, &mut recorder, tick);
            // The ground station keeps the downlink drained.
            while ground.poll_telemetry().is_some() {}
            tasks.record(est_id, started.elapsed());
        }

        if terminal_since.is_none() && estimation.phase().is_terminal() {
            terminal_since = Some(tick);
        }
        if terminal_since.is_some_and(|since| tick - since >= TERMINAL_HOLD) {
            break;
        }
        tick += ACQUISITION_PERIOD;
    }

    let sim_time_s = tick.min(duration_ticks) as f64 / 1_000.0;
    info!(
        final_phase = estimation.phase().label(),
        sim_time_s, "run finished"
    );
    let dropped_uplink = ground.dropped();
    let dropped_downlink = vehicle.dropped();
    let summary = estimation.into_summary(
        scenario,
        truth_apogee,
        sim_time_s,
        dropped_uplink,
        dropped_downlink,
        task_reports(&tasks),
    );
    (summary, recorder)
}

// =========================================================================
// == Realtime Runner ==
// =========================================================================

/// Runs the scenario against the wall clock with the acquisition and
/// estimation tasks on their own threads, talking only through the
/// board and the link queues. The main thread plays ground station.
pub fn run_realtime(scenario: &ScenarioConfig) -> std::io::Result<(RunSummary, MemoryRecorder)> {
    let profile = FlightProfile::new(scenario.profile);
    let (_, truth_apogee) = profile.apogee();
    info!(
        scenario = %scenario.name,
        seed = scenario.seed,
        "realtime run"
    );

    let board = Arc::new(SampleBoard::new(
        scenario.pipeline.n_baro,
        scenario.pipeline.n_imu,
    ));
    let stop = Arc::new(AtomicBool::new(false));
    let (mut ground, mut vehicle) = link::pair(scenario.link.queue_capacity);
    let t0 = Instant::now();

    let mut acquisition = AcquisitionTask::new(scenario);
    let acq_board = Arc::clone(&board);
    let acq_stop = Arc::clone(&stop);
    let acq_profile = profile.clone();
    let acquisition_handle = std::thread::Builder::new()
        .name("acquisition".into())
        .spawn(move || {
            let mut ticker = DeadlineTicker::new(Duration::from_millis(ACQUISITION_PERIOD));
            let mut tasks = TaskSet::new();
            let id = tasks.register(acquisition_metadata());
            while !acq_stop.load(Ordering::Relaxed) {
                ticker.wait();
                let started = Instant::now();
                let tick = t0.elapsed().as_millis() as Tick;
                let t = tick as f64 / 1_000.0;
                acquisition.acquire(t, acq_profile.sample(t), tick);
                acq_board.publish(&acquisition.working);
                tasks.record(id, started.elapsed());
            }
            tasks
        })?;

    let mut estimation = EstimationTask::new(scenario);
    let est_board = Arc::clone(&board);
    let est_stop = Arc::clone(&stop);
    let estimation_handle = std::thread::Builder::new()
        .name("estimation".into())
        .spawn(move || {
            let mut ticker = DeadlineTicker::new(Duration::from_millis(ESTIMATION_PERIOD));
            let mut tasks = TaskSet::new();
            let id = tasks.register(estimation_metadata());
            let mut recorder = MemoryRecorder::new();
            while !est_stop.load(Ordering::Relaxed) {
                let missed = ticker.wait();
                if missed > 0 {
                    warn!(missed, "estimation deadlines missed");
                }
                let started = Instant::now();
                let tick = t0.elapsed().as_millis() as Tick;
                estimation.cycle(&est_board, &mut vehicle, &mut recorder, tick);
                tasks.record(id, started.elapsed());
            }
            (estimation, vehicle, recorder, tasks)
        })?;

    // The main thread is the ground station: it scripts the uplink and
    // watches the downlink for a terminal phase.
    let mut script = GroundScript::new(scenario);
    let mut last_phase = FlightPhase::Idle;
    let mut terminal_since: Option<Instant> = None;
    loop {
        std::thread::sleep(Duration::from_millis(ESTIMATION_PERIOD));
        let t = t0.elapsed().as_secs_f64();
        if let Some(command) = script.poll(t) {
            uplink_or_warn(&mut ground, command);
        }
        while let Some(frame) = ground.poll_telemetry() {
            last_phase = frame.phase;
        }
        if terminal_since.is_none() && last_phase.is_terminal() {
            terminal_since = Some(Instant::now());
        }
        let held_out = terminal_since
            .is_some_and(|since| since.elapsed() >= Duration::from_millis(TERMINAL_HOLD));
        if t >= scenario.duration_s || held_out {
            break;
        }
    }
    stop.store(true, Ordering::Relaxed);

    let acq_tasks = match acquisition_handle.join() {
        Ok(tasks) => tasks,
        Err(panic) => std::panic::resume_unwind(panic),
    };
    let (estimation, vehicle, recorder, est_tasks) = match estimation_handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    };

    let sim_time_s = t0.elapsed().as_secs_f64();
    info!(
        final_phase = estimation.phase().label(),
        sim_time_s, "run finished"
    );
    let mut tasks = task_reports(&acq_tasks);
    tasks.extend(task_reports(&est_tasks));
    let dropped_uplink = ground.dropped();
    let dropped_downlink = vehicle.dropped();
    let summary = estimation.into_summary(
        scenario,
        truth_apogee,
        sim_time_s,
        dropped_uplink,
        dropped_downlink,
        tasks,
    );
    Ok((summary, recorder))
}
