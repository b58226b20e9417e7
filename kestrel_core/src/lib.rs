// kestrel_core/src/lib.rs

// This file defines the public modules of your library.
pub mod calibration;
pub mod elimination;
pub mod estimation;
pub mod messages;
pub mod phase;
pub mod pipeline;
pub mod prelude;
pub mod queue;
pub mod recorder;
pub mod sensors;
pub mod types;
