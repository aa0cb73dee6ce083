//! Sensor conversion and per-probe state.

pub mod thermistor;
pub mod zone;
