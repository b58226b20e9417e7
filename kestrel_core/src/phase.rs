// kestrel_core/src/phase.rs

//! Flight phase state machine.
//!
//! Phases advance one way through the mission profile; the only branch is
//! `Abort`, reachable from every non-terminal phase. Each transition is a
//! pure function of the latest estimate, the degraded-mask signal, and any
//! pending command, evaluated once per estimation cycle strictly after the
//! estimator has run.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::messages::{Command, StateEstimate};
use crate::types::Tick;

// =========================================================================
// == Phases and Transitions ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightPhase {
    Idle,
    Calibrating,
    Armed,
    PoweredAscent,
    CoastAscent,
    Apogee,
    DrogueDescent,
    MainDescent,
    Landed,
    Abort,
}

impl FlightPhase {
    pub fn label(&self) -> &'static str {
        match self {
            FlightPhase::Idle => "IDLE",
            FlightPhase::Calibrating => "CALIBRATING",
            FlightPhase::Armed => "ARMED",
            FlightPhase::PoweredAscent => "POWERED_ASCENT",
            FlightPhase::CoastAscent => "COAST_ASCENT",
            FlightPhase::Apogee => "APOGEE",
            FlightPhase::DrogueDescent => "DROGUE_DESCENT",
            FlightPhase::MainDescent => "MAIN_DESCENT",
            FlightPhase::Landed => "LANDED",
            FlightPhase::Abort => "ABORT",
        }
    }

    /// Terminal phases accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlightPhase::Landed | FlightPhase::Abort)
    }
}

/// Recovery actions a transition may request. Emitted at most once per
/// transition; staying in a phase emits nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentIntent {
    DeployDrogue,
    DeployMain,
}

impl DeploymentIntent {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentIntent::DeployDrogue => "DEPLOY_DROGUE",
            DeploymentIntent::DeployMain => "DEPLOY_MAIN",
        }
    }
}

/// One phase change, stamped with the cycle tick that fired it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: FlightPhase,
    pub to: FlightPhase,
    pub tick: Tick,
    pub intent: Option<DeploymentIntent>,
}

// =========================================================================
// == Configuration ==
// =========================================================================

/// Thresholds are a deployment configuration concern; these defaults fit a
/// mid-power vehicle and the simulation scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Vertical acceleration above this detects motor burn, in m/s^2.
    pub liftoff_accel: f64,
    /// Consecutive cycles above the liftoff threshold before launch is
    /// accepted.
    pub liftoff_debounce: u32,
    /// Vertical acceleration below this ends the burn, in m/s^2.
    pub burnout_accel: f64,
    /// Cycles to stay in powered ascent before the burnout check runs,
    /// riding out ignition transients.
    pub min_powered_cycles: u32,
    /// Descent speed confirming the apogee zero-crossing, in m/s. This is
    /// the hysteresis band keeping barometric noise from faking apogee.
    pub apogee_fall_velocity: f64,
    /// Main-parachute deployment altitude above the pad, in m.
    pub main_altitude: f64,
    /// Velocity magnitude treated as standing still, in m/s.
    pub landing_velocity: f64,
    /// Acceleration magnitude treated as standing still, in m/s^2.
    pub landing_accel: f64,
    /// Consecutive still cycles before touchdown is accepted.
    pub landing_debounce: u32,
    /// Consecutive invalid-estimate cycles tolerated before aborting.
    pub invalid_abort_cycles: u32,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            liftoff_accel: 20.0,
            liftoff_debounce: 5,
            burnout_accel: 2.0,
            min_powered_cycles: 50,
            apogee_fall_velocity: 1.0,
            main_altitude: 300.0,
            landing_velocity: 0.5,
            landing_accel: 1.0,
            landing_debounce: 200,
            invalid_abort_cycles: 100,
        }
    }
}

/// Everything one FSM evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct FsmInput {
    pub estimate: StateEstimate,
    /// Command received since the previous cycle, if any.
    pub command: Option<Command>,
    /// True once every sensor instance has delivered data.
    pub sensors_ready: bool,
    /// True once all pre-flight calibration sessions report complete.
    pub calibration_complete: bool,
    /// True while the trust mask has at least one eliminated instance.
    pub degraded: bool,
}

// =========================================================================
// == State Machine ==
// =========================================================================

#[derive(Debug, Clone)]
pub struct FlightPhaseFsm {
    config: PhaseConfig,
    phase: FlightPhase,
    phase_entry_tick: Tick,
    cycles_in_phase: u32,
    liftoff_streak: u32,
    landing_streak: u32,
    invalid_streak: u32,
}

impl FlightPhaseFsm {
    pub fn new(config: PhaseConfig) -> Self {
        Self {
            config,
            phase: FlightPhase::Idle,
            phase_entry_tick: 0,
            cycles_in_phase: 0,
            liftoff_streak: 0,
            landing_streak: 0,
            invalid_streak: 0,
        }
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    pub fn phase_entry_tick(&self) -> Tick {
        self.phase_entry_tick
    }

    /// Evaluates the triggers for the current phase. Returns the
    /// transition that fired, if any; deployment intents only ever ride on
    /// a returned transition, so each fires at most once.
    pub fn update(&mut self, tick: Tick, input: &FsmInput) -> Option<PhaseTransition> {
        if self.phase.is_terminal() {
            return None;
        }
        self.cycles_in_phase = self.cycles_in_phase.saturating_add(1);

        // Abort triggers outrank everything below.
        if input.command == Some(Command::Abort) {
            warn!(tick, "abort commanded");
            return Some(self.transition_to(FlightPhase::Abort, tick, None));
        }
        if input.estimate.valid {
            self.invalid_streak = 0;
        } else {
            self.invalid_streak += 1;
            if self.invalid_streak > self.config.invalid_abort_cycles {
                warn!(tick, "estimate invalid past timeout, aborting");
                return Some(self.transition_to(FlightPhase::Abort, tick, None));
            }
        }

        let est = &input.estimate;
        match self.phase {
            FlightPhase::Idle => {
                if input.command == Some(Command::Arm) && input.sensors_ready {
                    return Some(self.transition_to(FlightPhase::Calibrating, tick, None));
                }
            }
            FlightPhase::Calibrating => {
                if input.calibration_complete && !input.degraded {
                    return Some(self.transition_to(FlightPhase::Armed, tick, None));
                }
            }
            FlightPhase::Armed => {
                if est.vertical_accel > self.config.liftoff_accel {
                    self.liftoff_streak += 1;
                    if self.liftoff_streak >= self.config.liftoff_debounce {
                        return Some(self.transition_to(FlightPhase::PoweredAscent, tick, None));
                    }
                } else {
                    self.liftoff_streak = 0;
                }
            }
            FlightPhase::PoweredAscent => {
                if self.cycles_in_phase >= self.config.min_powered_cycles
                    && est.vertical_accel < self.config.burnout_accel
                {
                    return Some(self.transition_to(FlightPhase::CoastAscent, tick, None));
                }
            }
            FlightPhase::CoastAscent => {
                // Zero-crossing with hysteresis: only a confirmed descent
                // rate counts.
                if est.vertical_velocity < -self.config.apogee_fall_velocity {
                    return Some(self.transition_to(FlightPhase::Apogee, tick, None));
                }
            }
            FlightPhase::Apogee => {
                return Some(self.transition_to(
                    FlightPhase::DrogueDescent,
                    tick,
                    Some(DeploymentIntent::DeployDrogue),
                ));
            }
            FlightPhase::DrogueDescent => {
                if est.altitude_agl < self.config.main_altitude && est.vertical_velocity < 0.0 {
                    return Some(self.transition_to(
                        FlightPhase::MainDescent,
                        tick,
                        Some(DeploymentIntent::DeployMain),
                    ));
                }
            }
            FlightPhase::MainDescent => {
                if est.vertical_velocity.abs() < self.config.landing_velocity
                    && est.vertical_accel.abs() < self.config.landing_accel
                {
                    self.landing_streak += 1;
                    if self.landing_streak >= self.config.landing_debounce {
                        return Some(self.transition_to(FlightPhase::Landed, tick, None));
                    }
                } else {
                    self.landing_streak = 0;
                }
            }
            FlightPhase::Landed | FlightPhase::Abort => unreachable!("terminal handled above"),
        }
        None
    }

    /// Returns to `Idle` for a new attempt, forgetting all debounce
    /// history. The only way out of a terminal phase.
    pub fn reset(&mut self, tick: Tick) {
        self.phase = FlightPhase::Idle;
        self.phase_entry_tick = tick;
        self.cycles_in_phase = 0;
        self.liftoff_streak = 0;
        self.landing_streak = 0;
        self.invalid_streak = 0;
    }

    fn transition_to(
        &mut self,
        to: FlightPhase,
        tick: Tick,
        intent: Option<DeploymentIntent>,
    ) -> PhaseTransition {
        let from = self.phase;
        self.phase = to;
        self.phase_entry_tick = tick;
        self.cycles_in_phase = 0;
        self.liftoff_streak = 0;
        self.landing_streak = 0;
        info!(from = from.label(), to = to.label(), tick, "phase transition");
        PhaseTransition {
            from,
            to,
            tick,
            intent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(altitude: f64, velocity: f64, accel: f64) -> StateEstimate {
        StateEstimate {
            altitude_agl: altitude,
            vertical_velocity: velocity,
            vertical_accel: accel,
            tilt: 1.0,
            tick: 0,
            valid: true,
        }
    }

    fn input(est: StateEstimate) -> FsmInput {
        FsmInput {
            estimate: est,
            command: None,
            sensors_ready: true,
            calibration_complete: true,
            degraded: false,
        }
    }

    fn config() -> PhaseConfig {
        PhaseConfig {
            liftoff_debounce: 3,
            min_powered_cycles: 5,
            landing_debounce: 4,
            invalid_abort_cycles: 10,
            ..PhaseConfig::default()
        }
    }

    fn arm_and_calibrate(fsm: &mut FlightPhaseFsm, tick: &mut Tick) {
        let mut arm = input(estimate(0.0, 0.0, 0.0));
        arm.command = Some(Command::Arm);
        assert_eq!(
            fsm.update(next(tick), &arm).unwrap().to,
            FlightPhase::Calibrating
        );
        assert_eq!(
            fsm.update(next(tick), &input(estimate(0.0, 0.0, 0.0)))
                .unwrap()
                .to,
            FlightPhase::Armed
        );
    }

    fn next(tick: &mut Tick) -> Tick {
        *tick += 10;
        *tick
    }

    #[test]
    fn test_nominal_flight_walks_every_phase_once() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        let mut transitions = Vec::new();
        let mut drive = |fsm: &mut FlightPhaseFsm,
                         tick: &mut Tick,
                         transitions: &mut Vec<PhaseTransition>,
                         est: StateEstimate,
                         cycles: u32| {
            for _ in 0..cycles {
                if let Some(t) = fsm.update(next(tick), &input(est)) {
                    transitions.push(t);
                }
            }
        };

        arm_and_calibrate(&mut fsm, &mut tick);
        // Boost, burnout, fall through apogee, under main altitude, still.
        drive(&mut fsm, &mut tick, &mut transitions, estimate(10.0, 30.0, 60.0), 10);
        drive(&mut fsm, &mut tick, &mut transitions, estimate(400.0, 80.0, -8.0), 10);
        drive(&mut fsm, &mut tick, &mut transitions, estimate(900.0, -3.0, -9.8), 3);
        drive(&mut fsm, &mut tick, &mut transitions, estimate(250.0, -20.0, -2.0), 3);
        drive(&mut fsm, &mut tick, &mut transitions, estimate(0.0, 0.0, 0.0), 10);

        let phases: Vec<FlightPhase> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                FlightPhase::PoweredAscent,
                FlightPhase::CoastAscent,
                FlightPhase::Apogee,
                FlightPhase::DrogueDescent,
                FlightPhase::MainDescent,
                FlightPhase::Landed,
            ]
        );
        let intents: Vec<DeploymentIntent> =
            transitions.iter().filter_map(|t| t.intent).collect();
        assert_eq!(
            intents,
            vec![DeploymentIntent::DeployDrogue, DeploymentIntent::DeployMain]
        );
        assert_eq!(fsm.phase(), FlightPhase::Landed);
        // Terminal: further estimates change nothing.
        assert!(fsm
            .update(next(&mut tick), &input(estimate(0.0, 0.0, 50.0)))
            .is_none());
    }

    #[test]
    fn test_liftoff_needs_debounce_and_fires_once() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        arm_and_calibrate(&mut fsm, &mut tick);

        let boost = estimate(0.0, 0.0, 60.0);
        assert!(fsm.update(next(&mut tick), &input(boost)).is_none());
        assert!(fsm.update(next(&mut tick), &input(boost)).is_none());
        // A dip resets the streak.
        assert!(fsm
            .update(next(&mut tick), &input(estimate(0.0, 0.0, 1.0)))
            .is_none());
        assert!(fsm.update(next(&mut tick), &input(boost)).is_none());
        assert!(fsm.update(next(&mut tick), &input(boost)).is_none());
        let t = fsm.update(next(&mut tick), &input(boost)).unwrap();
        assert_eq!(t.to, FlightPhase::PoweredAscent);
        assert!(t.intent.is_none());
        // Entry is stamped with the tick of the cycle that fired.
        assert_eq!(fsm.phase_entry_tick(), t.tick);
        // Staying above threshold does not re-trigger.
        assert!(fsm.update(next(&mut tick), &input(boost)).is_none());
        assert_eq!(fsm.phase_entry_tick(), t.tick);
    }

    #[test]
    fn test_burnout_waits_for_min_powered_cycles() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        arm_and_calibrate(&mut fsm, &mut tick);
        for _ in 0..3 {
            fsm.update(next(&mut tick), &input(estimate(0.0, 0.0, 60.0)));
        }
        assert_eq!(fsm.phase(), FlightPhase::PoweredAscent);
        // Accel already low, but the guard window is still open.
        for _ in 0..4 {
            assert!(fsm
                .update(next(&mut tick), &input(estimate(50.0, 40.0, 0.0)))
                .is_none());
        }
        let t = fsm
            .update(next(&mut tick), &input(estimate(60.0, 40.0, 0.0)))
            .unwrap();
        assert_eq!(t.to, FlightPhase::CoastAscent);
    }

    #[test]
    fn test_apogee_hysteresis_rejects_slow_sink() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        arm_and_calibrate(&mut fsm, &mut tick);
        for _ in 0..3 {
            fsm.update(next(&mut tick), &input(estimate(0.0, 0.0, 60.0)));
        }
        for _ in 0..6 {
            fsm.update(next(&mut tick), &input(estimate(400.0, 60.0, -8.0)));
        }
        assert_eq!(fsm.phase(), FlightPhase::CoastAscent);
        // Hovering around zero is not yet apogee.
        assert!(fsm
            .update(next(&mut tick), &input(estimate(900.0, 0.4, -9.8)))
            .is_none());
        assert!(fsm
            .update(next(&mut tick), &input(estimate(900.0, -0.6, -9.8)))
            .is_none());
        let t = fsm
            .update(next(&mut tick), &input(estimate(899.0, -1.5, -9.8)))
            .unwrap();
        assert_eq!(t.to, FlightPhase::Apogee);
    }

    #[test]
    fn test_invalid_estimates_past_timeout_abort_and_silence_intents() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        arm_and_calibrate(&mut fsm, &mut tick);
        for _ in 0..3 {
            fsm.update(next(&mut tick), &input(estimate(0.0, 0.0, 60.0)));
        }
        assert_eq!(fsm.phase(), FlightPhase::PoweredAscent);

        let mut bad = estimate(100.0, 50.0, 20.0);
        bad.valid = false;
        let mut aborted = None;
        for _ in 0..12 {
            if let Some(t) = fsm.update(next(&mut tick), &input(bad)) {
                aborted = Some(t);
            }
        }
        let aborted = aborted.expect("abort fired");
        assert_eq!(aborted.to, FlightPhase::Abort);
        assert!(aborted.intent.is_none());

        // Even a textbook apogee sequence is ignored after abort.
        for est in [
            estimate(900.0, -5.0, -9.8),
            estimate(200.0, -25.0, -2.0),
            estimate(0.0, 0.0, 0.0),
        ] {
            assert!(fsm.update(next(&mut tick), &input(est)).is_none());
        }
        assert_eq!(fsm.phase(), FlightPhase::Abort);
    }

    #[test]
    fn test_abort_command_works_from_idle() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut inp = input(estimate(0.0, 0.0, 0.0));
        inp.command = Some(Command::Abort);
        let t = fsm.update(10, &inp).unwrap();
        assert_eq!(t.from, FlightPhase::Idle);
        assert_eq!(t.to, FlightPhase::Abort);
    }

    #[test]
    fn test_arming_blocked_until_sensors_ready() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut inp = input(estimate(0.0, 0.0, 0.0));
        inp.command = Some(Command::Arm);
        inp.sensors_ready = false;
        assert!(fsm.update(10, &inp).is_none());
        inp.sensors_ready = true;
        assert_eq!(fsm.update(20, &inp).unwrap().to, FlightPhase::Calibrating);
    }

    #[test]
    fn test_degraded_mask_blocks_arming() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut tick = 0;
        let mut arm = input(estimate(0.0, 0.0, 0.0));
        arm.command = Some(Command::Arm);
        fsm.update(next(&mut tick), &arm);

        let mut degraded = input(estimate(0.0, 0.0, 0.0));
        degraded.degraded = true;
        assert!(fsm.update(next(&mut tick), &degraded).is_none());
        assert_eq!(fsm.phase(), FlightPhase::Calibrating);
        let t = fsm
            .update(next(&mut tick), &input(estimate(0.0, 0.0, 0.0)))
            .unwrap();
        assert_eq!(t.to, FlightPhase::Armed);
    }

    #[test]
    fn test_reset_returns_to_idle_from_terminal() {
        let mut fsm = FlightPhaseFsm::new(config());
        let mut inp = input(estimate(0.0, 0.0, 0.0));
        inp.command = Some(Command::Abort);
        fsm.update(10, &inp).unwrap();
        assert_eq!(fsm.phase(), FlightPhase::Abort);
        fsm.reset(20);
        assert_eq!(fsm.phase(), FlightPhase::Idle);
        assert_eq!(fsm.phase_entry_tick(), 20);
    }
}
