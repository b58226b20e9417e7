// kestrel_sim/src/profile.rs

//! Closed-form vertical truth trajectory.
//!
//! The profile is piecewise analytic: pad rest, constant-acceleration
//! boost, ballistic arc over apogee, a constant-rate drogue descent, a
//! constant-deceleration main opening, and a constant-rate main descent.
//! `sample` is a pure function of time, so acquisition threads and the
//! deterministic loop read the same truth without sharing state.

use kestrel_core::types::GRAVITY;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    /// Ignition time from scenario start, in s.
    #[serde(default = "default_launch_time")]
    pub launch_time_s: f64,
    /// Net upward acceleration during the burn, in m/s^2.
    #[serde(default = "default_boost_accel")]
    pub boost_accel: f64,
    /// Burn duration, in s.
    #[serde(default = "default_boost_duration")]
    pub boost_duration_s: f64,
    /// Terminal descent rate under drogue, in m/s (positive down).
    #[serde(default = "default_drogue_rate")]
    pub drogue_rate: f64,
    /// Terminal descent rate under main, in m/s (positive down).
    #[serde(default = "default_main_rate")]
    pub main_rate: f64,
    /// Altitude at which the main canopy starts opening, in m.
    #[serde(default = "default_main_altitude")]
    pub main_altitude: f64,
    /// How long the main takes to brake the fall from the drogue rate to
    /// the main rate, in s. The deceleration shows up on the IMU.
    #[serde(default = "default_main_opening")]
    pub main_opening_s: f64,
}

fn default_launch_time() -> f64 {
    10.0
}

fn default_boost_accel() -> f64 {
    45.0
}

fn default_boost_duration() -> f64 {
    2.0
}

fn default_drogue_rate() -> f64 {
    22.0
}

fn default_main_rate() -> f64 {
    6.0
}

fn default_main_altitude() -> f64 {
    300.0
}

fn default_main_opening() -> f64 {
    2.0
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            launch_time_s: default_launch_time(),
            boost_accel: default_boost_accel(),
            boost_duration_s: default_boost_duration(),
            drogue_rate: default_drogue_rate(),
            main_rate: default_main_rate(),
            main_altitude: default_main_altitude(),
            main_opening_s: default_main_opening(),
        }
    }
}

/// Ground truth at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruthSample {
    /// Altitude above the pad, in m.
    pub altitude: f64,
    /// Vertical velocity, in m/s, positive up.
    pub velocity: f64,
    /// Vertical coordinate acceleration, in m/s^2. A resting body is 0;
    /// the specific force a device measures adds gravity on top.
    pub accel: f64,
}

impl TruthSample {
    fn at_rest() -> Self {
        Self {
            altitude: 0.0,
            velocity: 0.0,
            accel: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlightProfile {
    config: ProfileConfig,
    burnout_time: f64,
    burnout_alt: f64,
    burnout_vel: f64,
    apogee_time: f64,
    apogee_alt: f64,
    /// Time and altitude where the fall has reached the drogue rate.
    drogue_time: f64,
    drogue_alt: f64,
    /// When and where the main canopy starts opening.
    main_time: f64,
    main_start_alt: f64,
    /// Upward braking acceleration during the opening, in m/s^2.
    open_accel: f64,
    /// When and where the fall has settled onto the main rate.
    main_settle_time: f64,
    main_settle_alt: f64,
    touchdown_time: f64,
}

impl FlightProfile {
    /// Precomputes the segment boundaries for `config`.
    ///
    /// Scenario files are screened by `ScenarioConfig::finalize`; calling
    /// this directly with a degenerate profile panics.
    ///
    /// # Panics
    /// Panics unless `main_opening_s > 0` and the descent rates satisfy
    /// `drogue_rate > main_rate > 0`.
    pub fn new(config: ProfileConfig) -> Self {
        assert!(
            config.main_opening_s > 0.0,
            "main opening duration must be positive"
        );
        assert!(
            config.drogue_rate > config.main_rate && config.main_rate > 0.0,
            "descent rates must satisfy drogue > main > 0"
        );
        let burnout_time = config.launch_time_s + config.boost_duration_s;
        let burnout_vel = config.boost_accel * config.boost_duration_s;
        let burnout_alt = 0.5 * config.boost_accel * config.boost_duration_s.powi(2);
        let apogee_time = burnout_time + burnout_vel / GRAVITY;
        let apogee_alt = burnout_alt + burnout_vel * burnout_vel / (2.0 * GRAVITY);
        let drogue_time = apogee_time + config.drogue_rate / GRAVITY;
        let drogue_alt = apogee_alt - config.drogue_rate * config.drogue_rate / (2.0 * GRAVITY);
        let main_start_alt = config.main_altitude.min(drogue_alt);
        let main_time = drogue_time + (drogue_alt - main_start_alt) / config.drogue_rate;

        let open_accel = (config.drogue_rate - config.main_rate) / config.main_opening_s;
        let open_drop = 0.5 * (config.drogue_rate + config.main_rate) * config.main_opening_s;
        let (main_settle_time, main_settle_alt, touchdown_time) = if main_start_alt >= open_drop {
            let settle_alt = main_start_alt - open_drop;
            let settle_time = main_time + config.main_opening_s;
            (
                settle_time,
                settle_alt,
                settle_time + settle_alt / config.main_rate,
            )
        } else {
            // The main opened too low; the ground arrives mid-opening.
            let disc = config.drogue_rate * config.drogue_rate - 2.0 * open_accel * main_start_alt;
            let impact = main_time + (config.drogue_rate - disc.sqrt()) / open_accel;
            (impact, 0.0, impact)
        };
        Self {
            config,
            burnout_time,
            burnout_alt,
            burnout_vel,
            apogee_time,
            apogee_alt,
            drogue_time,
            drogue_alt,
            main_time,
            main_start_alt,
            open_accel,
            main_settle_time,
            main_settle_alt,
            touchdown_time,
        }
    }

    /// Apogee time and altitude of this trajectory.
    pub fn apogee(&self) -> (f64, f64) {
        (self.apogee_time, self.apogee_alt)
    }

    pub fn touchdown_time(&self) -> f64 {
        self.touchdown_time
    }

    pub fn sample(&self, t: f64) -> TruthSample {
        let c = &self.config;
        if t < c.launch_time_s || t >= self.touchdown_time {
            return TruthSample::at_rest();
        }
        if t < self.burnout_time {
            let dt = t - c.launch_time_s;
            return TruthSample {
                altitude: 0.5 * c.boost_accel * dt * dt,
                velocity: c.boost_accel * dt,
                accel: c.boost_accel,
            };
        }
        if t < self.drogue_time {
            // Ballistic arc: coast up through apogee and fall until the
            // drogue reaches its terminal rate.
            let dt = t - self.burnout_time;
            return TruthSample {
                altitude: self.burnout_alt + self.burnout_vel * dt - 0.5 * GRAVITY * dt * dt,
                velocity: self.burnout_vel - GRAVITY * dt,
                accel: -GRAVITY,
            };
        }
        if t < self.main_time {
            return TruthSample {
                altitude: self.drogue_alt - c.drogue_rate * (t - self.drogue_time),
                velocity: -c.drogue_rate,
                accel: 0.0,
            };
        }
        if t < self.main_settle_time {
            // The canopy brakes the fall at a constant rate while it fills.
            let dt = t - self.main_time;
            return TruthSample {
                altitude: (self.main_start_alt - c.drogue_rate * dt
                    + 0.5 * self.open_accel * dt * dt)
                    .max(0.0),
                velocity: -c.drogue_rate + self.open_accel * dt,
                accel: self.open_accel,
            };
        }
        TruthSample {
            altitude: (self.main_settle_alt - c.main_rate * (t - self.main_settle_time)).max(0.0),
            velocity: -c.main_rate,
            accel: 0.0,
        }
    }
}

/// Inverse of the estimator's barometric conversion: pressure observed at
/// `altitude` m above a pad sitting at `pad_pressure` Pa.
pub fn pressure_at_altitude(altitude: f64, pad_pressure: f64) -> f64 {
    pad_pressure * (1.0 - altitude / 44_330.0).powf(1.0 / 0.190_3)
}
