// kestrel_sim/src/lib.rs

// This file defines the public modules of your library.
pub mod board;
pub mod cli;
pub mod devices;
pub mod flight_log;
pub mod link;
pub mod prelude;
pub mod profile;
pub mod runner;
pub mod scenario;
pub mod scheduler;
