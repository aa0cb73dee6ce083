//! Lid heater control task.
//!
//! A second instantiation of the heater pattern with a single probe:
//! one resistive element warms the lid to stop condensation, behind the
//! same style of hardware safety latch as the pads. The lid's sense
//! circuit pins a broken probe to the opposite rail from the pad
//! circuit, hence the flipped range polarity.

use std::time::Duration;

use log::{error, info};

use crate::calibration::{ElementOffsets, LID_KEY};
use crate::config::{PidGains, ThermalConfig};
use crate::control::pid::Pid;
use crate::error::{ErrorCode, HeatElement, ThermistorChannel};
use crate::mailbox::{Mailbox, Sender};
use crate::messages::{CommsMessage, LidMessage, LidReadings, RequestId, SystemMessage, TaskKind};
use crate::ports::{CircuitFault, HeaterPolicy, StoragePort};
use crate::sensors::thermistor::{RangePolarity, NTC_10K_B3984};
use crate::sensors::zone::Thermistor;
use crate::tasks::{SystemStatus, TaskRegistry};

// ── Error bitmap layout ───────────────────────────────────────
pub const LID_THERM_BIT: u16 = 1 << 0;
pub const POWER_GOOD_BIT: u16 = 1 << 1;
pub const CIRCUIT_SHORT_BIT: u16 = 1 << 2;
pub const CIRCUIT_OPEN_BIT: u16 = 1 << 3;
pub const OVERCURRENT_BIT: u16 = 1 << 4;

const RECOVERABLE_MASK: u16 =
    POWER_GOOD_BIT | CIRCUIT_SHORT_BIT | CIRCUIT_OPEN_BIT | OVERCURRENT_BIT;

const LID_OVERTEMP_LIMIT_C: f64 = 110.0;

/// The lid heater control task.
pub struct LidHeaterTask<S: StoragePort> {
    mailbox: Mailbox<LidMessage>,
    registry: Option<TaskRegistry>,
    storage: S,
    status: SystemStatus,
    error_bitmap: u16,
    lid: Thermistor,
    pid: Pid,
    setpoint: f64,
    power_test_power: f64,
    had_sensor_fault: bool,
    last_timestamp_ms: Option<u32>,
    offsets: Option<ElementOffsets>,
    max_target_c: f64,
    period_s: f64,
    send_timeout: Duration,
}

impl<S: StoragePort> LidHeaterTask<S> {
    pub fn new(config: &ThermalConfig, storage: S) -> Self {
        let PidGains { kp, ki, kd } = config.lid_gains;
        let period_s = f64::from(config.lid_period_ms) / 1000.0;
        Self {
            mailbox: Mailbox::new(),
            registry: None,
            storage,
            status: SystemStatus::Idle,
            error_bitmap: 0,
            lid: Thermistor::new(
                ThermistorChannel::Lid,
                LID_OVERTEMP_LIMIT_C,
                LID_THERM_BIT,
                RangePolarity::LowIsShort,
                &NTC_10K_B3984,
            ),
            pid: Pid::new(kp, ki, kd, period_s, 1.0, -1.0),
            setpoint: 0.0,
            power_test_power: 0.0,
            had_sensor_fault: false,
            last_timestamp_ms: None,
            offsets: None,
            max_target_c: config.lid_max_target_c,
            period_s,
            send_timeout: Duration::from_millis(config.sibling_send_timeout_ms),
        }
    }

    pub fn sender(&self) -> Sender<LidMessage> {
        self.mailbox.sender()
    }

    pub fn provide_registry(&mut self, registry: TaskRegistry) {
        self.registry = Some(registry);
    }

    // ── Task loop ─────────────────────────────────────────────

    pub fn run_once(&mut self, policy: &mut impl HeaterPolicy) {
        let timeout = Duration::from_secs_f64(self.period_s);
        if let Some(msg) = self.mailbox.recv_timeout(timeout) {
            self.dispatch(msg, policy);
        }
    }

    /// Non-blocking single-message step for simulators and tests.
    pub fn poll(&mut self, policy: &mut impl HeaterPolicy) -> bool {
        match self.mailbox.try_recv() {
            Some(msg) => {
                self.dispatch(msg, policy);
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, msg: LidMessage, policy: &mut impl HeaterPolicy) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        match msg {
            LidMessage::TempReadComplete(readings) => {
                self.handle_conversion(readings, policy, &registry);
            }
            LidMessage::SetTemperature { id, target_c } => {
                self.cmd_set_temperature(id, target_c, policy, &registry);
            }
            LidMessage::GetTemperature { id } => self.cmd_get_temperature(id, &registry),
            LidMessage::Deactivate { id } => self.cmd_deactivate(id, policy, &registry),
            LidMessage::SetPidConstants { id, kp, ki, kd } => {
                self.cmd_set_pid(id, kp, ki, kd, &registry);
            }
            LidMessage::SetPowerTest { id, power } => {
                self.cmd_power_test(id, power, policy, &registry);
            }
        }
    }

    // ── Conversion cycle ──────────────────────────────────────

    fn handle_conversion(
        &mut self,
        readings: LidReadings,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        let offsets = *self
            .offsets
            .get_or_insert_with(|| ElementOffsets::load_or_default(&self.storage, LID_KEY));
        let dt = self.elapsed_s(readings.timestamp_ms);
        let prev_bitmap = self.error_bitmap;
        let latch_down = !policy.power_good();

        self.lid.update(readings.lid, latch_down);
        if self.lid.has_error() {
            if self.error_bitmap & LID_THERM_BIT == 0 {
                error!("lid sensor fault: {}", self.lid.error);
                let _ = registry.comms.try_send(CommsMessage::Error { code: self.lid.error });
            }
            self.error_bitmap |= LID_THERM_BIT;
        } else {
            self.lid.temp_c = offsets.adjust(self.lid.temp_c);
            self.error_bitmap &= !LID_THERM_BIT;
        }

        let sensor_faults = self.error_bitmap & LID_THERM_BIT != 0;
        if policy.power_good() {
            self.error_bitmap &= !POWER_GOOD_BIT;
        } else if !sensor_faults && self.had_sensor_fault {
            if policy.try_reset_power_good() {
                self.error_bitmap &= !POWER_GOOD_BIT;
                info!("lid safety latch re-armed");
            } else {
                if self.error_bitmap & POWER_GOOD_BIT == 0 {
                    let code = ErrorCode::LatchFault(HeatElement::Lid);
                    error!("{code}");
                    let _ = registry.comms.try_send(CommsMessage::Error { code });
                }
                self.error_bitmap |= POWER_GOOD_BIT;
            }
        }
        self.had_sensor_fault = sensor_faults;

        self.refresh_status(policy);

        match self.status {
            SystemStatus::Controlling => {
                let err = self.setpoint - self.lid.temp_c;
                let power = self.pid.compute_with_dt(err, dt).max(0.0);
                self.apply_power(power, policy, registry);
            }
            SystemStatus::PowerTest => {
                let power = self.power_test_power;
                self.apply_power(power, policy, registry);
            }
            SystemStatus::Idle | SystemStatus::Error => policy.disable_power_output(),
        }

        if self.error_bitmap != prev_bitmap {
            let _ = registry.system.try_send(SystemMessage::TaskError {
                task: TaskKind::Lid,
                bitmap: self.error_bitmap,
            });
        }
    }

    fn elapsed_s(&mut self, timestamp_ms: u32) -> f64 {
        let dt = match self.last_timestamp_ms {
            Some(prev) => f64::from(timestamp_ms.wrapping_sub(prev)) / 1000.0,
            None => self.period_s,
        };
        self.last_timestamp_ms = Some(timestamp_ms);
        if dt > 0.0 { dt } else { self.period_s }
    }

    fn apply_power(
        &mut self,
        power: f64,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        let fault = policy.set_power_output(power.clamp(0.0, 1.0));
        let (bit, code) = match fault {
            CircuitFault::None => return,
            CircuitFault::Open => (CIRCUIT_OPEN_BIT, ErrorCode::CircuitOpen(HeatElement::Lid)),
            CircuitFault::Short => (CIRCUIT_SHORT_BIT, ErrorCode::CircuitShort(HeatElement::Lid)),
            CircuitFault::Overcurrent => (
                OVERCURRENT_BIT,
                ErrorCode::CircuitOvercurrent(HeatElement::Lid),
            ),
        };
        if self.error_bitmap & bit == 0 {
            error!("{code}");
            let _ = registry.comms.try_send(CommsMessage::Error { code });
        }
        self.error_bitmap |= bit;
        self.enter_error(policy);
    }

    fn refresh_status(&mut self, policy: &mut impl HeaterPolicy) {
        if self.status == SystemStatus::PowerTest {
            return;
        }
        if self.error_bitmap != 0 {
            if self.status != SystemStatus::Error {
                self.enter_error(policy);
            }
        } else if self.status == SystemStatus::Error {
            self.status = SystemStatus::Idle;
            info!("lid faults cleared, returning to idle");
        }
    }

    fn enter_error(&mut self, policy: &mut impl HeaterPolicy) {
        policy.disable_power_output();
        self.setpoint = 0.0;
        self.power_test_power = 0.0;
        if self.status != SystemStatus::Error {
            error!("lid entering error state, bitmap {:#06x}", self.error_bitmap);
        }
        self.status = SystemStatus::Error;
    }

    // ── Commands ──────────────────────────────────────────────

    fn cmd_set_temperature(
        &mut self,
        id: RequestId,
        target_c: f64,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        let code = if self.error_bitmap != 0 {
            self.most_relevant_error()
        } else if !(0.0..=self.max_target_c).contains(&target_c) {
            ErrorCode::TargetOutOfRange
        } else if !policy.power_good() && !policy.try_reset_power_good() {
            self.error_bitmap |= POWER_GOOD_BIT;
            ErrorCode::LatchFault(HeatElement::Lid)
        } else {
            self.setpoint = target_c;
            self.pid.reset();
            self.pid.arm_integrator_reset(target_c - self.lid.temp_c);
            self.status = SystemStatus::Controlling;
            info!("lid target {target_c:.2}C");
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    fn cmd_get_temperature(&mut self, id: RequestId, registry: &TaskRegistry) {
        let reply = CommsMessage::LidTemperature {
            responding_to_id: id,
            lid_c: self.lid.temp_c,
            target_c: self.setpoint,
        };
        let _ = registry.comms.send(reply, self.send_timeout);
    }

    fn cmd_deactivate(
        &mut self,
        id: RequestId,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        policy.disable_power_output();
        self.setpoint = 0.0;
        self.power_test_power = 0.0;
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
            // Gains only change while the element is off; deactivate
            // first.
            ErrorCode::Busy
        } else {
            self.pid.set_gains(kp, ki, kd);
            self.pid.reset();
            ErrorCode::NoError
        };
        self.ack(registry, id, code);
    }

    fn cmd_power_test(
        &mut self,
        id: RequestId,
        power: f64,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        let code = if self.error_bitmap & RECOVERABLE_MASK != 0 {
            self.most_relevant_error()
        } else if !policy.power_good() && !policy.try_reset_power_good() {
            self.error_bitmap |= POWER_GOOD_BIT;
            ErrorCode::LatchFault(HeatElement::Lid)
        } else {
            self.power_test_power = power.clamp(0.0, 1.0);
            self.status = SystemStatus::PowerTest;
            let p = self.power_test_power;
            self.apply_power(p, policy, registry);
            if self.status == SystemStatus::Error {
                // The very first write tripped a circuit fault.
                self.most_relevant_error()
            } else {
                ErrorCode::NoError
            }
        };
        self.ack(registry, id, code);
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

    // ── Reporting / queries ───────────────────────────────────

    /// Host protocol contract ordering; do not reorder.
    pub fn most_relevant_error(&self) -> ErrorCode {
        if self.error_bitmap & CIRCUIT_OPEN_BIT != 0 {
            return ErrorCode::CircuitOpen(HeatElement::Lid);
        }
        if self.error_bitmap & CIRCUIT_SHORT_BIT != 0 {
            return ErrorCode::CircuitShort(HeatElement::Lid);
        }
        if self.error_bitmap & OVERCURRENT_BIT != 0 {
            return ErrorCode::CircuitOvercurrent(HeatElement::Lid);
        }
        if self.lid.has_error() {
            return self.lid.error;
        }
        if self.error_bitmap & POWER_GOOD_BIT != 0 {
            return ErrorCode::LatchFault(HeatElement::Lid);
        }
        ErrorCode::NoError
    }

    pub fn lid_temp(&self) -> f64 {
        self.lid.temp_c
    }

    pub fn status(&self) -> SystemStatus {
        self.status
    }

    pub fn error_bitmap(&self) -> u16 {
        self.error_bitmap
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }
}
