//! Thermal plate control task.
//!
//! Seven probes (six plate, one heatsink), three peltier zones and the
//! heatsink fan, coordinated by [`PlateControl`]. Conversion messages
//! drive the loop exactly as in the heater task; the extra machinery
//! here is the drift latch and the fan override commands.
//!
//! A drift fault (one zone wandering while the others hold) disables
//! the peltier bank and latches: `SetTemperature` is refused with the
//! drift code until the host sends an explicit `Deactivate`.

use std::time::Duration;

use log::{error, info};

use crate::calibration::PlateOffsets;
use crate::config::{PidGains, ThermalConfig};
use crate::control::pid::Pid;
use crate::control::plate::{PlateControl, PlateDrive, PlateStatus, AMBIENT_C};
use crate::error::{ErrorCode, ThermistorChannel};
use crate::mailbox::{Mailbox, Sender};
use crate::messages::{
    CommsMessage, PeltierDirection, PeltierSelection, PidSelection, PlateActivity, PlateMessage,
    PlateReadings, RequestId, SystemMessage, TaskKind,
};
use crate::ports::{PeltierId, PlatePolicy, StoragePort};
use crate::sensors::thermistor::{RangePolarity, NTC_10K_B3984};
use crate::sensors::zone::{HeatsinkFan, Peltier, Thermistor};
use crate::tasks::{SystemStatus, TaskRegistry};

// ── Error bitmap layout (thermistors in reporting order) ──────
pub const FRONT_RIGHT_BIT: u16 = 1 << 0;
pub const FRONT_LEFT_BIT: u16 = 1 << 1;
pub const FRONT_CENTER_BIT: u16 = 1 << 2;
pub const BACK_RIGHT_BIT: u16 = 1 << 3;
pub const BACK_LEFT_BIT: u16 = 1 << 4;
pub const BACK_CENTER_BIT: u16 = 1 << 5;
pub const HEATSINK_BIT: u16 = 1 << 6;
pub const PELTIER_BIT: u16 = 1 << 7;
pub const FAN_BIT: u16 = 1 << 8;
pub const DRIFT_BIT: u16 = 1 << 9;

const RECOVERABLE_MASK: u16 = PELTIER_BIT | FAN_BIT | DRIFT_BIT;

const PLATE_OVERTEMP_LIMIT_C: f64 = 110.0;
const HEATSINK_OVERTEMP_LIMIT_C: f64 = 85.0;

/// Fixed drive for one zone during power test.
#[derive(Debug, Clone, Copy)]
struct PowerTestDrive {
    selection: PeltierSelection,
    power: f64,
    direction: PeltierDirection,
}

/// The thermal plate control task.
pub struct ThermalPlateTask<S: StoragePort> {
    mailbox: Mailbox<PlateMessage>,
    registry: Option<TaskRegistry>,
    storage: S,
    status: SystemStatus,
    error_bitmap: u16,
    plate: PlateControl,
    power_test: Option<PowerTestDrive>,
    last_timestamp_ms: Option<u32>,
    offsets: Option<PlateOffsets>,
    max_target_c: f64,
    period_s: f64,
    send_timeout: Duration,
}

impl<S: StoragePort> ThermalPlateTask<S> {
    pub fn new(config: &ThermalConfig, storage: S) -> Self {
        let period_s = f64::from(config.plate_period_ms) / 1000.0;
        let zone_pid = |g: PidGains| Pid::new(g.kp, g.ki, g.kd, period_s, 1.0, -1.0);
        let probe = |channel, bit| {
            Thermistor::new(
                channel,
                PLATE_OVERTEMP_LIMIT_C,
                bit,
                RangePolarity::LowIsDisconnected,
                &NTC_10K_B3984,
            )
        };
        let left = Peltier::new(
            PeltierId::Left,
            probe(ThermistorChannel::PlateFrontLeft, FRONT_LEFT_BIT),
            probe(ThermistorChannel::PlateBackLeft, BACK_LEFT_BIT),
            zone_pid(config.peltier_gains),
        );
        let center = Peltier::new(
            PeltierId::Center,
            probe(ThermistorChannel::PlateFrontCenter, FRONT_CENTER_BIT),
            probe(ThermistorChannel::PlateBackCenter, BACK_CENTER_BIT),
            zone_pid(config.peltier_gains),
        );
        let right = Peltier::new(
            PeltierId::Right,
            probe(ThermistorChannel::PlateFrontRight, FRONT_RIGHT_BIT),
            probe(ThermistorChannel::PlateBackRight, BACK_RIGHT_BIT),
            zone_pid(config.peltier_gains),
        );
        let fan = HeatsinkFan::new(
            Thermistor::new(
                ThermistorChannel::Heatsink,
                HEATSINK_OVERTEMP_LIMIT_C,
                HEATSINK_BIT,
                RangePolarity::LowIsDisconnected,
                &NTC_10K_B3984,
            ),
            zone_pid(config.fan_gains),
        );
        Self {
            mailbox: Mailbox::new(),
            registry: None,
            storage,
            status: SystemStatus::Idle,
            error_bitmap: 0,
            plate: PlateControl::new(left, center, right, fan),
            power_test: None,
            last_timestamp_ms: None,
            offsets: None,
            max_target_c: config.plate_max_target_c,
            period_s,
            send_timeout: Duration::from_millis(config.sibling_send_timeout_ms),
        }
    }

    pub fn sender(&self) -> Sender<PlateMessage> {
        self.mailbox.sender()
    }

    pub fn provide_registry(&mut self, registry: TaskRegistry) {
        self.registry = Some(registry);
    }

    // ── Task loop ─────────────────────────────────────────────

    pub fn run_once(&mut self, policy: &mut impl PlatePolicy) {
        let timeout = Duration::from_secs_f64(self.period_s);
        if let Some(msg) = self.mailbox.recv_timeout(timeout) {
            self.dispatch(msg, policy);
        }
    }

    /// Non-blocking single-message step for simulators and tests.
    pub fn poll(&mut self, policy: &mut impl PlatePolicy) -> bool {
        match self.mailbox.try_recv() {
            Some(msg) => {
                self.dispatch(msg, policy);
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, msg: PlateMessage, policy: &mut impl PlatePolicy) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        match msg {
            PlateMessage::TempReadComplete(readings) => {
                self.handle_conversion(readings, policy, &registry);
            }
            PlateMessage::SetTemperature {
                id,
                target_c,
                hold_time_s,
                volume_ul,
                ramp_rate,
            } => {
                self.cmd_set_temperature(
                    id, target_c, hold_time_s, volume_ul, ramp_rate, policy, &registry,
                );
            }
            PlateMessage::GetTemperature { id } => self.cmd_get_temperature(id, &registry),
            PlateMessage::Deactivate { id } => self.cmd_deactivate(id, policy, &registry),
            PlateMessage::SetPidConstants {
                id,
                selection,
                kp,
                ki,
                kd,
            } => self.cmd_set_pid(id, selection, kp, ki, kd, &registry),
            PlateMessage::SetPowerTest {
                id,
                selection,
                power,
                direction,
            } => self.cmd_power_test(id, selection, power, direction, policy, &registry),
            PlateMessage::SetFanManual { id, power } => {
                self.cmd_fan_manual(id, power, policy, &registry);
            }
            PlateMessage::SetFanAutomatic { id } => self.cmd_fan_automatic(id, &registry),
        }
    }

    // ── Conversion cycle ──────────────────────────────────────

    fn handle_conversion(
        &mut self,
        readings: PlateReadings,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        let offsets = *self
            .offsets
            .get_or_insert_with(|| PlateOffsets::load_or_default(&self.storage));
        let dt = self.elapsed_s(readings.timestamp_ms);
        let prev_bitmap = self.error_bitmap;

        self.plate.fan.thermistor.update(readings.heatsink, false);
        let heatsink_ok = !self.plate.fan.thermistor.has_error();
        let heatsink_c = self.plate.fan.thermistor.temp_c;

        self.plate.left.front.update(readings.front_left, false);
        self.plate.left.back.update(readings.back_left, false);
        self.plate.center.front.update(readings.front_center, false);
        self.plate.center.back.update(readings.back_center, false);
        self.plate.right.front.update(readings.front_right, false);
        self.plate.right.back.update(readings.back_right, false);

        // Calibration needs a trustworthy heatsink term and never
        // applies to a faulted read.
        if heatsink_ok {
            for zone in [&mut self.plate.left, &mut self.plate.center, &mut self.plate.right] {
                for probe in [&mut zone.front, &mut zone.back] {
                    if !probe.has_error() {
                        probe.temp_c = offsets.adjust(zone.id, probe.temp_c, heatsink_c);
                    }
                }
            }
        }

        let mut bitmap = self.error_bitmap;
        for probe in self.probes() {
            if probe.has_error() {
                if bitmap & probe.error_bit == 0 {
                    error!("plate sensor fault: {}", probe.error);
                    let _ = registry.comms.try_send(CommsMessage::Error { code: probe.error });
                }
                bitmap |= probe.error_bit;
            } else {
                bitmap &= !probe.error_bit;
            }
        }
        self.error_bitmap = bitmap;

        self.refresh_status(policy);

        match self.status {
            SystemStatus::Controlling => match self.plate.update_control(dt) {
                Ok(drive) => self.apply_drive(drive, policy, registry),
                Err(code) => {
                    // Zone drift: kill the peltier bank and latch until
                    // the host deactivates.
                    if self.error_bitmap & DRIFT_BIT == 0 {
                        error!("{code}");
                        let _ = registry.comms.try_send(CommsMessage::Error { code });
                    }
                    self.error_bitmap |= DRIFT_BIT;
                    self.enter_error(policy);
                }
            },
            SystemStatus::PowerTest => self.apply_power_test(policy, registry),
            SystemStatus::Idle | SystemStatus::Error => {
                self.disable_peltiers(policy);
                if let Some(power) = self.plate.fan_idle_power() {
                    self.set_fan_checked(power, policy, registry);
                }
            }
        }

        if self.error_bitmap != prev_bitmap {
            let _ = registry.system.try_send(SystemMessage::TaskError {
                task: TaskKind::Plate,
                bitmap: self.error_bitmap,
            });
        }
        let _ = registry.system.try_send(SystemMessage::UpdatePlateState {
            activity: self.activity(),
        });
    }

    fn elapsed_s(&mut self, timestamp_ms: u32) -> f64 {
        let dt = match self.last_timestamp_ms {
            Some(prev) => f64::from(timestamp_ms.wrapping_sub(prev)) / 1000.0,
            None => self.period_s,
        };
        self.last_timestamp_ms = Some(timestamp_ms);
        if dt > 0.0 { dt } else { self.period_s }
    }

    fn apply_drive(
        &mut self,
        drive: PlateDrive,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        let commands = [
            (PeltierId::Left, drive.left),
            (PeltierId::Center, drive.center),
            (PeltierId::Right, drive.right),
        ];
        for (id, power) in commands {
            let direction = if power >= 0.0 {
                PeltierDirection::Heating
            } else {
                PeltierDirection::Cooling
            };
            if !policy.set_peltier(id, power.abs().min(1.0), direction) {
                self.flag_actuator_fault(PELTIER_BIT, ErrorCode::PeltierFault, registry);
                self.enter_error(policy);
                return;
            }
        }
        if let Some(power) = drive.fan {
            self.set_fan_checked(power, policy, registry);
        }
    }

    fn apply_power_test(&mut self, policy: &mut impl PlatePolicy, registry: &TaskRegistry) {
        let Some(test) = self.power_test else {
            return;
        };
        for id in [PeltierId::Left, PeltierId::Center, PeltierId::Right] {
            let selected = matches!(
                (test.selection, id),
                (PeltierSelection::All, _)
                    | (PeltierSelection::Left, PeltierId::Left)
                    | (PeltierSelection::Center, PeltierId::Center)
                    | (PeltierSelection::Right, PeltierId::Right)
            );
            let (power, direction) = if selected {
                (test.power, test.direction)
            } else {
                (0.0, PeltierDirection::Heating)
            };
            if !policy.set_peltier(id, power, direction) {
                self.flag_actuator_fault(PELTIER_BIT, ErrorCode::PeltierFault, registry);
                self.enter_error(policy);
                return;
            }
        }
    }

    fn set_fan_checked(
        &mut self,
        power: f64,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        if !policy.set_fan(power.clamp(0.0, 1.0)) {
            self.flag_actuator_fault(FAN_BIT, ErrorCode::FanFault, registry);
        }
    }

    fn flag_actuator_fault(&mut self, bit: u16, code: ErrorCode, registry: &TaskRegistry) {
        if self.error_bitmap & bit == 0 {
            error!("{code}");
            let _ = registry.comms.try_send(CommsMessage::Error { code });
        }
        self.error_bitmap |= bit;
    }

    fn refresh_status(&mut self, policy: &mut impl PlatePolicy) {
        if self.status == SystemStatus::PowerTest {
            // Manufacturing mode tolerates missing probes, not
            // actuator or drift faults.
            if self.error_bitmap & RECOVERABLE_MASK != 0 {
                self.enter_error(policy);
            }
            return;
        }
        if self.error_bitmap != 0 {
            if self.status != SystemStatus::Error {
                self.enter_error(policy);
            }
        } else if self.status == SystemStatus::Error {
            self.status = SystemStatus::Idle;
            info!("plate faults cleared, returning to idle");
        }
    }

    fn enter_error(&mut self, policy: &mut impl PlatePolicy) {
        self.disable_peltiers(policy);
        self.plate.deactivate();
        self.power_test = None;
        if self.status != SystemStatus::Error {
            error!("plate entering error state, bitmap {:#06x}", self.error_bitmap);
        }
        self.status = SystemStatus::Error;
    }

    fn disable_peltiers(&mut self, policy: &mut impl PlatePolicy) {
        for id in [PeltierId::Left, PeltierId::Center, PeltierId::Right] {
            let _ = policy.set_peltier(id, 0.0, PeltierDirection::Heating);
        }
        policy.set_enabled(false);
    }

    // ── Commands ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn cmd_set_temperature(
        &mut self,
        id: RequestId,
        target_c: f64,
        hold_time_s: f64,
        volume_ul: Option<f64>,
        ramp_rate: Option<f64>,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        let code = if self.error_bitmap & DRIFT_BIT != 0 {
            // Drift latches until an explicit deactivate.
            ErrorCode::PlateDrift
        } else if self.error_bitmap != 0 {
            self.most_relevant_error()
        } else if target_c.is_nan()
            || target_c > self.max_target_c
            || hold_time_s.is_nan()
            || hold_time_s < 0.0
            || matches!(ramp_rate, Some(r) if r.is_nan() || r <= 0.0)
        {
            ErrorCode::TargetOutOfRange
        } else if target_c <= 0.0 {
            // A non-positive setpoint is a deactivation.
            self.plate.deactivate();
            self.disable_peltiers(policy);
            self.status = SystemStatus::Idle;
            ErrorCode::NoError
        } else {
            self.plate.set_new_target(target_c, hold_time_s, volume_ul, ramp_rate);
            policy.set_enabled(true);
            self.status = SystemStatus::Controlling;
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    fn cmd_get_temperature(&mut self, id: RequestId, registry: &TaskRegistry) {
        let reply = CommsMessage::PlateTemperature {
            responding_to_id: id,
            front_right_c: self.plate.right.front.temp_c,
            front_left_c: self.plate.left.front.temp_c,
            front_center_c: self.plate.center.front.temp_c,
            back_right_c: self.plate.right.back.temp_c,
            back_left_c: self.plate.left.back.temp_c,
            back_center_c: self.plate.center.back.temp_c,
            heatsink_c: self.plate.fan.thermistor.temp_c,
            target_c: self.plate.setpoint(),
        };
        let _ = registry.comms.send(reply, self.send_timeout);
    }

    fn cmd_deactivate(
        &mut self,
        id: RequestId,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        self.plate.deactivate();
        self.disable_peltiers(policy);
        self.power_test = None;
        self.error_bitmap &= !RECOVERABLE_MASK;
        let code = if self.error_bitmap != 0 {
            self.most_relevant_error()
        } else {
            self.status = SystemStatus::Idle;
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    fn cmd_set_pid(
        &mut self,
        id: RequestId,
        selection: PidSelection,
        kp: f64,
        ki: f64,
        kd: f64,
        registry: &TaskRegistry,
    ) {
        let gains = PidGains { kp, ki, kd };
        let code = if !gains.in_range() {
            ErrorCode::GainOutOfRange
        } else if self.error_bitmap != 0 {
            self.most_relevant_error()
        } else if matches!(self.status, SystemStatus::Controlling | SystemStatus::PowerTest) {
            // Gains only change while the plate is off.
            ErrorCode::Busy
        } else {
            match selection {
                PidSelection::Peltiers => {
                    for zone in [
                        &mut self.plate.left,
                        &mut self.plate.center,
                        &mut self.plate.right,
                    ] {
                        zone.pid.set_gains(kp, ki, kd);
                        zone.pid.reset();
                    }
                }
                PidSelection::Fans => {
                    self.plate.fan.pid.set_gains(kp, ki, kd);
                    self.plate.fan.pid.reset();
                }
            }
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    #[allow(clippy::too_many_arguments)]
    fn cmd_power_test(
        &mut self,
        id: RequestId,
        selection: PeltierSelection,
        power: f64,
        direction: PeltierDirection,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        let code = if self.error_bitmap & RECOVERABLE_MASK != 0 {
            self.most_relevant_error()
        } else {
            self.power_test = Some(PowerTestDrive {
                selection,
                power: power.clamp(0.0, 1.0),
                direction,
            });
            self.plate.deactivate();
            policy.set_enabled(true);
            self.status = SystemStatus::PowerTest;
            self.apply_power_test(policy, registry);
            if self.status == SystemStatus::Error {
                // The very first write tripped an actuator fault.
                self.most_relevant_error()
            } else {
                info!("plate power test at {power:.2}");
                ErrorCode::NoError
            }
        };
        self.ack(registry, id, code);
    }

    fn cmd_fan_manual(
        &mut self,
        id: RequestId,
        power: f64,
        policy: &mut impl PlatePolicy,
        registry: &TaskRegistry,
    ) {
        let code = if self.error_bitmap != 0 {
            self.most_relevant_error()
        } else {
            self.plate.fan.manual_control = true;
            self.set_fan_checked(power, policy, registry);
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    fn cmd_fan_automatic(&mut self, id: RequestId, registry: &TaskRegistry) {
        self.plate.fan.manual_control = false;
        self.ack(registry, id, ErrorCode::NoError);
    }

    fn ack(&self, registry: &TaskRegistry, id: RequestId, code: ErrorCode) {
        let _ = registry.comms.send(
            CommsMessage::Acknowledge {
                responding_to_id: id,
                with_error: code,
            },
            self.send_timeout,
        );
    }

    // ── Reporting ─────────────────────────────────────────────

    /// Probes in the protocol's reporting order.
    fn probes(&self) -> [&Thermistor; 7] {
        [
            &self.plate.right.front,
            &self.plate.left.front,
            &self.plate.center.front,
            &self.plate.right.back,
            &self.plate.left.back,
            &self.plate.center.back,
            &self.plate.fan.thermistor,
        ]
    }

    /// Highest-priority active fault. The ordering is part of the host
    /// protocol contract; do not reorder.
    pub fn most_relevant_error(&self) -> ErrorCode {
        if self.error_bitmap & PELTIER_BIT != 0 {
            return ErrorCode::PeltierFault;
        }
        if self.error_bitmap & FAN_BIT != 0 {
            return ErrorCode::FanFault;
        }
        for probe in self.probes() {
            if probe.has_error() {
                return probe.error;
            }
        }
        if self.error_bitmap & DRIFT_BIT != 0 {
            return ErrorCode::PlateDrift;
        }
        ErrorCode::NoError
    }

    fn activity(&self) -> PlateActivity {
        if self.error_bitmap != 0 {
            return PlateActivity::Error;
        }
        match self.plate.status() {
            PlateStatus::Idle => PlateActivity::Idle,
            PlateStatus::Steady => {
                if self.plate.setpoint() < AMBIENT_C {
                    PlateActivity::AtColdTemp
                } else {
                    PlateActivity::AtHotTemp
                }
            }
            _ => {
                if self.plate.setpoint() > self.plate.plate_temp() {
                    PlateActivity::Heating
                } else {
                    PlateActivity::Cooling
                }
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn status(&self) -> SystemStatus {
        self.status
    }

    pub fn error_bitmap(&self) -> u16 {
        self.error_bitmap
    }

    pub fn setpoint(&self) -> f64 {
        self.plate.setpoint()
    }

    pub fn plate_temp(&self) -> f64 {
        self.plate.plate_temp()
    }

    /// `(initial, remaining)` hold seconds.
    pub fn hold_time(&self) -> (f64, f64) {
        self.plate.hold_time()
    }
}
