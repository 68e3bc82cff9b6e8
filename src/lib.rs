//! Control core for an RF interference monitoring station built around a
//! swept-tuned spectrum analyzer.

pub mod band;
pub mod calibration;
pub mod config;
pub mod curve;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod positioner;
pub mod protocol;
pub mod rfi;
pub mod signal;
pub mod sim;
pub mod sink;
pub mod spectrum;
pub mod sweep;
pub mod time;

pub use error::StationError;
pub use orchestrator::{Hardware, Orchestrator, StationState};
pub use spectrum::{FrequencySample, Spectrum};
