//! Thermal control core library.
//!
//! Closed-loop temperature control for PCR thermal cyclers and
//! heater-shakers: message-driven control tasks, PID primitives,
//! thermistor conversion, and persisted calibration, all behind
//! hardware policy traits so the full loop runs on the host.

#![deny(unused_must_use)]

pub mod calibration;
pub mod config;
pub mod control;
pub mod error;
pub mod mailbox;
pub mod messages;
pub mod ports;
pub mod sensors;
pub mod tasks;
