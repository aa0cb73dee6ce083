//! Runtime configuration parameters.
//!
//! All tunable parameters for the thermal control core. Values ship with
//! firmware defaults and can be overridden by the host at startup; tasks
//! take the config at construction and never reread it.

use serde::{Deserialize, Serialize};

/// Gains outside this band are refused outright.
pub const GAIN_LIMIT: f64 = 200.0;

/// Core thermal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfig {
    // --- Control loop timing ---
    /// Plate control period (milliseconds)
    pub plate_period_ms: u32,
    /// Heater pad control period (milliseconds)
    pub heater_period_ms: u32,
    /// Lid heater control period (milliseconds)
    pub lid_period_ms: u32,

    // --- Target limits ---
    /// Maximum heater pad target (Celsius)
    pub heater_max_target_c: f64,
    /// Maximum lid heater target (Celsius)
    pub lid_max_target_c: f64,
    /// Maximum plate target (Celsius)
    pub plate_max_target_c: f64,

    // --- Default PID gains ---
    pub heater_gains: PidGains,
    pub lid_gains: PidGains,
    pub peltier_gains: PidGains,
    pub fan_gains: PidGains,

    // --- Messaging ---
    /// How long a task will block handing a message to a sibling
    /// before giving up (milliseconds).
    pub sibling_send_timeout_ms: u64,
}

/// One controller's gain triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    /// True when every gain is inside the accepted band.
    pub fn in_range(&self) -> bool {
        self.kp.abs() <= GAIN_LIMIT && self.ki.abs() <= GAIN_LIMIT && self.kd.abs() <= GAIN_LIMIT
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            // Timing
            plate_period_ms: 50,   // 20 Hz — peltier pairs need the bandwidth
            heater_period_ms: 100, // 10 Hz
            lid_period_ms: 100,    // 10 Hz

            // Target limits
            heater_max_target_c: 100.0,
            lid_max_target_c: 105.0,
            plate_max_target_c: 105.0,

            // Gains (tuned on production hardware)
            heater_gains: PidGains { kp: 0.97, ki: 0.102, kd: 1.901 },
            lid_gains: PidGains { kp: 0.97, ki: 0.102, kd: 1.901 },
            peltier_gains: PidGains { kp: 0.3, ki: 0.05, kd: 0.3 },
            fan_gains: PidGains { kp: 0.2, ki: 0.01, kd: 0.05 },

            // Messaging
            sibling_send_timeout_ms: 10,
        }
    }
}

impl ThermalConfig {
    /// Reject configs a task cannot run with. Out-of-range values are an
    /// error, never silently clamped.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.plate_period_ms == 0 || self.heater_period_ms == 0 || self.lid_period_ms == 0 {
            return Err("control period must be non-zero");
        }
        if self.heater_max_target_c <= 0.0
            || self.lid_max_target_c <= 0.0
            || self.plate_max_target_c <= 0.0
        {
            return Err("target limit must be positive");
        }
        if !(self.heater_gains.in_range()
            && self.lid_gains.in_range()
            && self.peltier_gains.in_range()
            && self.fan_gains.in_range())
        {
            return Err("PID gain outside accepted band");
        }
        Ok(())
    }
}
