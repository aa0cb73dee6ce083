//! Closed-loop control primitives.

pub mod pid;
pub mod plate;
