//! PID controller for thermal elements.
//!
//! Error-in, power-out form: callers compute `setpoint − measurement`
//! themselves so ramped and overshot targets stay the caller's business.
//! The integral term is clamped to the windup band every step, and the
//! final output is clamped to the same band.

/// One-shot integrator reset, armed when a new target is set.
///
/// Crossing the setpoint is the natural moment to dump accumulated
/// integral error: the trigger records which direction the crossing
/// will come from and fires exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ResetTrigger {
    #[default]
    None,
    /// Error starts ≤ 0; reset when it rises above zero.
    Rising,
    /// Error starts > 0; reset when it falls to zero or below.
    Falling,
}

/// PID controller.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    /// Seconds between compute calls.
    sampletime: f64,
    windup_high: f64,
    windup_low: f64,
    last_error: f64,
    last_iterm: f64,
    reset_trigger: ResetTrigger,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, sampletime: f64, windup_high: f64, windup_low: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            sampletime,
            windup_high,
            windup_low,
            last_error: 0.0,
            last_iterm: 0.0,
            reset_trigger: ResetTrigger::None,
        }
    }

    /// Clear accumulated state. Call before reusing the controller for a
    /// new target; does not disarm gains or limits.
    pub fn reset(&mut self) {
        self.last_error = 0.0;
        self.last_iterm = 0.0;
        self.reset_trigger = ResetTrigger::None;
    }

    /// Arm the one-shot integrator reset against the current error sign.
    pub fn arm_integrator_reset(&mut self, error: f64) {
        self.reset_trigger = if error <= 0.0 {
            ResetTrigger::Rising
        } else {
            ResetTrigger::Falling
        };
    }

    /// One control step. `error` is `setpoint − measurement`; the return
    /// value is clamped to the windup band.
    pub fn compute(&mut self, error: f64) -> f64 {
        let crossed = match self.reset_trigger {
            ResetTrigger::Falling => error <= 0.0,
            ResetTrigger::Rising => error > 0.0,
            ResetTrigger::None => false,
        };
        if crossed {
            self.last_iterm = 0.0;
            self.reset_trigger = ResetTrigger::None;
        }

        let iterm = (self.last_iterm + self.sampletime * self.ki * error)
            .clamp(self.windup_low, self.windup_high);
        let dterm = if self.sampletime > 0.0 {
            self.kd * (error - self.last_error) / self.sampletime
        } else {
            0.0
        };
        let pterm = self.kp * error;

        self.last_error = error;
        self.last_iterm = iterm;

        (pterm + iterm + dterm).clamp(self.windup_low, self.windup_high)
    }

    /// One control step with a measured interval, for callers driven by
    /// timestamped conversions rather than a fixed timer.
    pub fn compute_with_dt(&mut self, error: f64, dt: f64) -> f64 {
        self.sampletime = dt;
        self.compute(error)
    }

    /// Replace the gain triple. Callers must disable power output first;
    /// stale integral state under new gains can slam the output.
    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn ki(&self) -> f64 {
        self.ki
    }

    pub fn kd(&self) -> f64 {
        self.kd
    }
}
