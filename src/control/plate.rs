//! Three-zone plate coordinator.
//!
//! Owns the left/center/right peltier pairs and the heatsink fan, and
//! turns one commanded setpoint into per-zone drive each control cycle:
//!
//! ```text
//!             ┌──────────────────────────────┐
//!  setpoint ─▶│ ramp → overshoot → steady    │─▶ zone power ×3
//!  readings ─▶│ per-zone PID · fan policy    │─▶ fan power
//!             └──────────────────────────────┘
//! ```
//!
//! A fresh target runs through three phases: an initial heat/cool push
//! toward a volume-compensated overshoot target, a fixed settle window
//! once the plate average crosses the true setpoint, then steady-state
//! hold at the setpoint itself. The hold countdown only runs while the
//! plate is actually inside the tolerance band.

use log::info;

use crate::error::ErrorCode;
use crate::sensors::zone::{HeatsinkFan, Peltier};

/// Lab ambient. Initial-phase saturation and the cold-target fan rules
/// pivot on it.
pub const AMBIENT_C: f64 = 23.0;
/// The plate counts as "at temperature" inside this band.
pub const SETPOINT_TOLERANCE_C: f64 = 0.5;

/// Settle window between crossing the setpoint and steady-state.
const OVERSHOOT_SETTLE_S: f64 = 10.0;
/// Steady-state dwell before the zone-uniformity check arms.
const UNIFORMITY_DELAY_S: f64 = 2.0;
/// Moves smaller than this skip the overshoot target entirely.
const OVERSHOOT_MIN_MOVE_C: f64 = 5.0;
/// One zone this far from setpoint, while the others hold, is a fault.
const DRIFT_MAX_C: f64 = 4.0;

/// Overshoot sizing is linear in sample volume.
const DEFAULT_VOLUME_UL: f64 = 25.0;
const OVERSHOOT_M_C_PER_UL: f64 = 0.0105;
const OVERSHOOT_B_C: f64 = 1.0869;
const UNDERSHOOT_M_C_PER_UL: f64 = -0.0133;
const UNDERSHOOT_B_C: f64 = -0.4302;

// Heatsink fan policy.
const FAN_WARM_C: f64 = 68.0;
const FAN_DANGER_C: f64 = 75.0;
const FAN_DANGER_POWER: f64 = 0.8;
const FAN_COLD_RAMP_POWER: f64 = 0.7;
const FAN_COLD_HOLD_TARGET_C: f64 = 60.0;
const FAN_COOL_RAMP_POWER: f64 = 0.55;
const FAN_UNDER_TARGET_POWER: f64 = 0.15;
const FAN_HOT_SETPOINT_C: f64 = 70.0;
const FAN_TARGET_MARGIN_C: f64 = 2.0;

/// Control phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlateStatus {
    #[default]
    Idle,
    InitialHeat,
    InitialCool,
    Overshoot,
    Steady,
}

/// One cycle's actuator commands. Peltier power is signed (positive
/// heats); `fan` is `None` while a manual fan override is in effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateDrive {
    pub left: f64,
    pub center: f64,
    pub right: f64,
    pub fan: Option<f64>,
}

/// The coordinator.
pub struct PlateControl {
    pub left: Peltier,
    pub center: Peltier,
    pub right: Peltier,
    pub fan: HeatsinkFan,
    status: PlateStatus,
    /// True commanded setpoint.
    setpoint: f64,
    /// Working target with the overshoot offset applied.
    current_setpoint: f64,
    /// Slew-limited target the zones actually chase.
    ramp_target: f64,
    /// °C/s; `None` snaps.
    ramp_rate: Option<f64>,
    hold_time_initial_s: f64,
    hold_time_remaining_s: f64,
    overshoot_remaining_s: f64,
    uniformity_delay_s: f64,
}

impl PlateControl {
    pub fn new(left: Peltier, center: Peltier, right: Peltier, fan: HeatsinkFan) -> Self {
        Self {
            left,
            center,
            right,
            fan,
            status: PlateStatus::Idle,
            setpoint: 0.0,
            current_setpoint: 0.0,
            ramp_target: 0.0,
            ramp_rate: None,
            hold_time_initial_s: 0.0,
            hold_time_remaining_s: 0.0,
            overshoot_remaining_s: 0.0,
            uniformity_delay_s: 0.0,
        }
    }

    // ── Target management ─────────────────────────────────────

    /// Command a new setpoint. `hold_time_s` of 0 holds forever;
    /// `volume_ul` sizes the overshoot; `ramp_rate` of `None` snaps.
    pub fn set_new_target(
        &mut self,
        setpoint: f64,
        hold_time_s: f64,
        volume_ul: Option<f64>,
        ramp_rate: Option<f64>,
    ) {
        let plate_temp = self.plate_temp();
        let volume = volume_ul.unwrap_or(DEFAULT_VOLUME_UL);
        let distance = setpoint - plate_temp;

        self.setpoint = setpoint;
        self.ramp_rate = ramp_rate;
        self.ramp_target = plate_temp;
        self.hold_time_initial_s = hold_time_s;
        self.hold_time_remaining_s = hold_time_s;
        self.overshoot_remaining_s = 0.0;
        self.uniformity_delay_s = 0.0;

        self.status = if distance > 0.0 {
            PlateStatus::InitialHeat
        } else {
            PlateStatus::InitialCool
        };
        self.current_setpoint = if distance.abs() > OVERSHOOT_MIN_MOVE_C {
            if distance > 0.0 {
                setpoint + (volume * OVERSHOOT_M_C_PER_UL + OVERSHOOT_B_C)
            } else {
                setpoint + (volume * UNDERSHOOT_M_C_PER_UL + UNDERSHOOT_B_C)
            }
        } else {
            setpoint
        };

        for zone in [&mut self.left, &mut self.center, &mut self.right] {
            zone.temp_target = self.ramp_target;
            zone.pid.reset();
            zone.pid.arm_integrator_reset(self.current_setpoint - zone.current_temp());
        }
        self.fan.pid.reset();
        info!(
            "plate target {setpoint:.2}C (working {:.2}C), hold {hold_time_s:.0}s",
            self.current_setpoint
        );
    }

    /// Drop back to idle. Zone targets and phase state clear; the fan
    /// manual flag survives so host tuning sessions are not interrupted.
    pub fn deactivate(&mut self) {
        self.status = PlateStatus::Idle;
        self.setpoint = 0.0;
        self.current_setpoint = 0.0;
        self.ramp_target = 0.0;
        self.hold_time_initial_s = 0.0;
        self.hold_time_remaining_s = 0.0;
        for zone in [&mut self.left, &mut self.center, &mut self.right] {
            zone.temp_target = 0.0;
            zone.pid.reset();
        }
        self.fan.pid.reset();
    }

    // ── Control cycle ─────────────────────────────────────────

    /// One control step. `elapsed_s` is the measured interval since the
    /// previous step. Returns per-zone drive, or the drift code when a
    /// zone has wandered off while the rest of the plate holds.
    pub fn update_control(&mut self, elapsed_s: f64) -> Result<PlateDrive, ErrorCode> {
        if self.status == PlateStatus::Idle {
            return Ok(PlateDrive {
                left: 0.0,
                center: 0.0,
                right: 0.0,
                fan: self.fan_idle_power(),
            });
        }

        self.advance_phase(elapsed_s);
        self.update_ramp(elapsed_s);
        self.check_drift()?;

        let saturate = self.initial_phase_saturation();
        let drive = PlateDrive {
            left: Self::zone_power(&mut self.left, saturate, elapsed_s),
            center: Self::zone_power(&mut self.center, saturate, elapsed_s),
            right: Self::zone_power(&mut self.right, saturate, elapsed_s),
            fan: self.fan_active_power(elapsed_s),
        };
        Ok(drive)
    }

    fn advance_phase(&mut self, elapsed_s: f64) {
        let plate_temp = self.plate_temp();
        match self.status {
            PlateStatus::InitialHeat if plate_temp >= self.setpoint => self.enter_overshoot(),
            PlateStatus::InitialCool if plate_temp <= self.setpoint => self.enter_overshoot(),
            PlateStatus::Overshoot => {
                self.overshoot_remaining_s -= elapsed_s;
                if self.overshoot_remaining_s <= 0.0 {
                    self.enter_steady();
                }
            }
            PlateStatus::Steady => {
                if self.uniformity_delay_s > 0.0 {
                    self.uniformity_delay_s -= elapsed_s;
                }
                // Hold only counts down while actually at temperature;
                // an initial hold of zero means hold forever.
                if self.hold_time_initial_s > 0.0 && self.temp_within_setpoint() {
                    self.hold_time_remaining_s =
                        (self.hold_time_remaining_s - elapsed_s).max(0.0);
                }
            }
            _ => {}
        }
    }

    fn enter_overshoot(&mut self) {
        self.status = PlateStatus::Overshoot;
        self.overshoot_remaining_s = OVERSHOOT_SETTLE_S;
        info!("plate crossed setpoint, settling");
    }

    fn enter_steady(&mut self) {
        self.status = PlateStatus::Steady;
        self.current_setpoint = self.setpoint;
        self.ramp_target = self.setpoint;
        self.uniformity_delay_s = UNIFORMITY_DELAY_S;
        info!("plate steady at {:.2}C", self.setpoint);
    }

    fn update_ramp(&mut self, elapsed_s: f64) {
        match self.ramp_rate {
            Some(rate) if self.status != PlateStatus::Steady => {
                // Rate is a magnitude; the gap supplies the sign.
                let step = (rate * elapsed_s).abs();
                let gap = self.current_setpoint - self.ramp_target;
                self.ramp_target += gap.clamp(-step, step);
            }
            _ => self.ramp_target = self.current_setpoint,
        }
        for zone in [&mut self.left, &mut self.center, &mut self.right] {
            zone.temp_target = self.ramp_target;
        }
    }

    /// During the initial push away from ambient, anything outside the
    /// proportional band gets full drive instead of PID output.
    fn initial_phase_saturation(&self) -> bool {
        match self.status {
            PlateStatus::InitialHeat => self.setpoint > AMBIENT_C,
            PlateStatus::InitialCool => self.setpoint < AMBIENT_C,
            _ => false,
        }
    }

    fn zone_power(zone: &mut Peltier, saturate: bool, elapsed_s: f64) -> f64 {
        let error = zone.temp_target - zone.current_temp();
        let kp = zone.pid.kp();
        if saturate && kp != 0.0 && error.abs() > (1.0 / kp) {
            return if error > 0.0 { 1.0 } else { -1.0 };
        }
        zone.pid.compute_with_dt(error, elapsed_s)
    }

    // ── Drift supervision ─────────────────────────────────────

    /// One zone far off setpoint while every other zone sits inside the
    /// tolerance band points at that zone's hardware, not the load.
    fn check_drift(&self) -> Result<(), ErrorCode> {
        if self.status != PlateStatus::Steady || self.uniformity_delay_s > 0.0 {
            return Ok(());
        }
        let temps = [
            self.left.current_temp(),
            self.center.current_temp(),
            self.right.current_temp(),
        ];
        for (i, &temp) in temps.iter().enumerate() {
            let drifted = (temp - self.setpoint).abs() > DRIFT_MAX_C;
            let others_held = temps
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .all(|(_, &t)| (t - self.setpoint).abs() < SETPOINT_TOLERANCE_C);
            if drifted && others_held {
                return Err(ErrorCode::PlateDrift);
            }
        }
        Ok(())
    }

    // ── Fan policy ────────────────────────────────────────────

    /// Fan duty while the plate is idle. `None` leaves a manual
    /// override in place.
    pub fn fan_idle_power(&mut self) -> Option<f64> {
        let heatsink = self.fan.thermistor.temp_c;
        if heatsink > FAN_DANGER_C {
            self.fan.manual_control = false;
            return Some(FAN_DANGER_POWER);
        }
        if self.fan.manual_control {
            return None;
        }
        if heatsink < FAN_WARM_C {
            Some(0.0)
        } else {
            Some(heatsink * 0.01)
        }
    }

    fn fan_active_power(&mut self, elapsed_s: f64) -> Option<f64> {
        let heatsink = self.fan.thermistor.temp_c;
        if heatsink > FAN_DANGER_C {
            self.fan.manual_control = false;
            return Some(FAN_DANGER_POWER);
        }
        if self.fan.manual_control {
            if heatsink > FAN_WARM_C {
                self.fan.manual_control = false;
            } else {
                return None;
            }
        }

        let ramping_down = matches!(
            self.status,
            PlateStatus::InitialCool | PlateStatus::Overshoot
        ) && self.setpoint < self.plate_temp();

        if self.setpoint < AMBIENT_C {
            if self.status != PlateStatus::Steady {
                return Some(FAN_COLD_RAMP_POWER);
            }
            self.retarget_fan(FAN_COLD_HOLD_TARGET_C, heatsink);
            let out = self
                .fan
                .pid
                .compute_with_dt(heatsink - self.fan.temp_target, elapsed_s);
            return Some(out.clamp(0.35, FAN_COLD_RAMP_POWER));
        }

        if ramping_down {
            return Some(FAN_COOL_RAMP_POWER);
        }

        self.retarget_fan(
            (self.setpoint - FAN_TARGET_MARGIN_C).min(FAN_HOT_SETPOINT_C),
            heatsink,
        );
        if heatsink < self.fan.temp_target {
            return Some(FAN_UNDER_TARGET_POWER);
        }
        let floor = if self.setpoint < FAN_HOT_SETPOINT_C { 0.35 } else { 0.30 };
        let out = self
            .fan
            .pid
            .compute_with_dt(heatsink - self.fan.temp_target, elapsed_s);
        Some(out.clamp(floor, 0.55))
    }

    /// A new fan regulation target dumps the stale integral on the next
    /// error-sign crossing.
    fn retarget_fan(&mut self, target: f64, heatsink: f64) {
        if (self.fan.temp_target - target).abs() > f64::EPSILON {
            self.fan.temp_target = target;
            self.fan.pid.arm_integrator_reset(heatsink - target);
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn status(&self) -> PlateStatus {
        self.status
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Working target including any overshoot offset.
    pub fn current_setpoint(&self) -> f64 {
        self.current_setpoint
    }

    /// Average of all six plate probes.
    pub fn plate_temp(&self) -> f64 {
        let sum = self.left.front.temp_c
            + self.left.back.temp_c
            + self.center.front.temp_c
            + self.center.back.temp_c
            + self.right.front.temp_c
            + self.right.back.temp_c;
        sum / 6.0
    }

    pub fn temp_within_setpoint(&self) -> bool {
        (self.plate_temp() - self.setpoint).abs() < SETPOINT_TOLERANCE_C
    }

    /// `(initial, remaining)` hold seconds.
    pub fn hold_time(&self) -> (f64, f64) {
        (self.hold_time_initial_s, self.hold_time_remaining_s)
    }

    /// Any probe (plate or heatsink) currently faulted.
    pub fn has_sensor_error(&self) -> bool {
        self.left.has_sensor_error()
            || self.center.has_sensor_error()
            || self.right.has_sensor_error()
            || self.fan.thermistor.has_error()
    }
}
