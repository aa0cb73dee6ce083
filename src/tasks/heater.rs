//! Heater pad control task.
//!
//! Regulates two resistive pads (read as one averaged pair) behind a
//! hardware safety latch, with a board probe supervising the drive
//! electronics. The conversion callback drives the loop: every
//! `TempReadComplete` reclassifies all three probes, rebuilds the error
//! bitmap, reconciles the latch, and runs one PID step.
//!
//! After every conversion the task upholds one invariant: the status is
//! `Error` exactly when the bitmap is non-zero (power test excepted —
//! a manufacturing fixture may run with no probes fitted).

use std::time::Duration;

use log::{error, info};

use crate::calibration::{ElementOffsets, HEATER_KEY};
use crate::config::{PidGains, ThermalConfig};
use crate::control::pid::Pid;
use crate::error::{ErrorCode, HeatElement, ThermistorChannel};
use crate::mailbox::{Mailbox, Sender};
use crate::messages::{
    CommsMessage, HeaterMessage, HeaterReadings, LedColor, LedMode, RequestId, SystemMessage,
    TaskKind,
};
use crate::ports::{CircuitFault, HeaterPolicy, StoragePort};
use crate::sensors::thermistor::{RangePolarity, NTC_10K_B3984};
use crate::sensors::zone::Thermistor;
use crate::tasks::{SystemStatus, TaskRegistry};

// ── Error bitmap layout ───────────────────────────────────────
pub const PAD_A_BIT: u16 = 1 << 0;
pub const PAD_B_BIT: u16 = 1 << 1;
pub const BOARD_BIT: u16 = 1 << 2;
pub const POWER_GOOD_BIT: u16 = 1 << 3;
pub const CIRCUIT_SHORT_BIT: u16 = 1 << 4;
pub const CIRCUIT_OPEN_BIT: u16 = 1 << 5;
pub const OVERCURRENT_BIT: u16 = 1 << 6;

const SENSOR_MASK: u16 = PAD_A_BIT | PAD_B_BIT | BOARD_BIT;
const RECOVERABLE_MASK: u16 =
    POWER_GOOD_BIT | CIRCUIT_SHORT_BIT | CIRCUIT_OPEN_BIT | OVERCURRENT_BIT;

const PAD_OVERTEMP_LIMIT_C: f64 = 105.0;
const BOARD_OVERTEMP_LIMIT_C: f64 = 85.0;

/// Above this, the front panel warns that the module is hot to touch.
const HOT_TO_TOUCH_C: f64 = 48.9;
/// Within this band of setpoint the LED shows "holding".
const HOLDING_BAND_C: f64 = 2.5;

/// The heater pad control task.
pub struct HeaterTask<S: StoragePort> {
    mailbox: Mailbox<HeaterMessage>,
    registry: Option<TaskRegistry>,
    storage: S,
    status: SystemStatus,
    error_bitmap: u16,
    pad_a: Thermistor,
    pad_b: Thermistor,
    board: Thermistor,
    pid: Pid,
    setpoint: f64,
    power_test_power: f64,
    /// Sensor bits were set on the previous conversion; arms the
    /// one-shot latch reset when they clear.
    had_sensor_fault: bool,
    last_timestamp_ms: Option<u32>,
    offsets: Option<ElementOffsets>,
    led: (LedColor, LedMode),
    max_target_c: f64,
    period_s: f64,
    send_timeout: Duration,
}

impl<S: StoragePort> HeaterTask<S> {
    pub fn new(config: &ThermalConfig, storage: S) -> Self {
        let PidGains { kp, ki, kd } = config.heater_gains;
        let period_s = f64::from(config.heater_period_ms) / 1000.0;
        Self {
            mailbox: Mailbox::new(),
            registry: None,
            storage,
            status: SystemStatus::Idle,
            error_bitmap: 0,
            pad_a: Thermistor::new(
                ThermistorChannel::HeaterPadA,
                PAD_OVERTEMP_LIMIT_C,
                PAD_A_BIT,
                RangePolarity::LowIsDisconnected,
                &NTC_10K_B3984,
            ),
            pad_b: Thermistor::new(
                ThermistorChannel::HeaterPadB,
                PAD_OVERTEMP_LIMIT_C,
                PAD_B_BIT,
                RangePolarity::LowIsDisconnected,
                &NTC_10K_B3984,
            ),
            board: Thermistor::new(
                ThermistorChannel::HeaterBoard,
                BOARD_OVERTEMP_LIMIT_C,
                BOARD_BIT,
                RangePolarity::LowIsDisconnected,
                &NTC_10K_B3984,
            ),
            pid: Pid::new(kp, ki, kd, period_s, 1.0, -1.0),
            setpoint: 0.0,
            power_test_power: 0.0,
            had_sensor_fault: false,
            last_timestamp_ms: None,
            offsets: None,
            led: (LedColor::White, LedMode::Solid),
            max_target_c: config.heater_max_target_c,
            period_s,
            send_timeout: Duration::from_millis(config.sibling_send_timeout_ms),
        }
    }

    pub fn sender(&self) -> Sender<HeaterMessage> {
        self.mailbox.sender()
    }

    /// Hand over the completed registry. Messages received before this
    /// point are dropped.
    pub fn provide_registry(&mut self, registry: TaskRegistry) {
        self.registry = Some(registry);
    }

    // ── Task loop ─────────────────────────────────────────────

    /// Block for up to one control period and process a single message.
    pub fn run_once(&mut self, policy: &mut impl HeaterPolicy) {
        let timeout = Duration::from_secs_f64(self.period_s);
        if let Some(msg) = self.mailbox.recv_timeout(timeout) {
            self.dispatch(msg, policy);
        }
    }

    /// Process one pending message without blocking. `true` if a
    /// message was handled. Simulators and tests step the task this way.
    pub fn poll(&mut self, policy: &mut impl HeaterPolicy) -> bool {
        match self.mailbox.try_recv() {
            Some(msg) => {
                self.dispatch(msg, policy);
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, msg: HeaterMessage, policy: &mut impl HeaterPolicy) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        match msg {
            HeaterMessage::TempReadComplete(readings) => {
                self.handle_conversion(readings, policy, &registry);
            }
            HeaterMessage::SetTemperature { id, target_c } => {
                self.cmd_set_temperature(id, target_c, policy, &registry);
            }
            HeaterMessage::GetTemperature { id } => self.cmd_get_temperature(id, &registry),
            HeaterMessage::Deactivate { id } => self.cmd_deactivate(id, policy, &registry),
            HeaterMessage::SetPidConstants { id, kp, ki, kd } => {
                self.cmd_set_pid(id, kp, ki, kd, &registry);
            }
            HeaterMessage::SetPowerTest { id, power } => {
                self.cmd_power_test(id, power, policy, &registry);
            }
        }
    }

    // ── Conversion cycle ──────────────────────────────────────

    fn handle_conversion(
        &mut self,
        readings: HeaterReadings,
        policy: &mut impl HeaterPolicy,
        registry: &TaskRegistry,
    ) {
        let offsets = *self
            .offsets
            .get_or_insert_with(|| ElementOffsets::load_or_default(&self.storage, HEATER_KEY));
        let dt = self.elapsed_s(readings.timestamp_ms);
        let prev_bitmap = self.error_bitmap;
        let latch_down = !policy.power_good();

        self.pad_a.update(readings.pad_a, latch_down);
        self.pad_b.update(readings.pad_b, latch_down);
        self.board.update(readings.board, latch_down);
        // Calibration applies to the pads only, never to a faulted read.
        for pad in [&mut self.pad_a, &mut self.pad_b] {
            if !pad.has_error() {
                pad.temp_c = offsets.adjust(pad.temp_c);
            }
        }

        let mut bitmap = self.error_bitmap;
        for probe in [&self.pad_a, &self.pad_b, &self.board] {
            if probe.has_error() {
                if bitmap & probe.error_bit == 0 {
                    error!("heater sensor fault: {}", probe.error);
                    let _ = registry.comms.try_send(CommsMessage::Error { code: probe.error });
                }
                bitmap |= probe.error_bit;
            } else {
                bitmap &= !probe.error_bit;
            }
        }

        // Latch reconciliation: one reset attempt, armed by the
        // sensor faults clearing. A latch that refuses to re-arm is
        // its own hardware fault, not a sensor problem.
        let sensor_faults = bitmap & SENSOR_MASK != 0;
        if policy.power_good() {
            bitmap &= !POWER_GOOD_BIT;
        } else if !sensor_faults && self.had_sensor_fault {
            if policy.try_reset_power_good() {
                bitmap &= !POWER_GOOD_BIT;
                info!("heater safety latch re-armed");
            } else {
                if bitmap & POWER_GOOD_BIT == 0 {
                    let code = ErrorCode::LatchFault(HeatElement::Heater);
                    error!("{code}");
                    let _ = registry.comms.try_send(CommsMessage::Error { code });
                }
                bitmap |= POWER_GOOD_BIT;
            }
        }
        self.had_sensor_fault = sensor_faults;
        self.error_bitmap = bitmap;

        self.refresh_status(policy);

        match self.status {
            SystemStatus::Controlling => {
                let err = self.setpoint - self.pad_temp();
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
                task: TaskKind::Heater,
                bitmap: self.error_bitmap,
            });
        }
        self.update_led(registry);
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
            CircuitFault::Open => (CIRCUIT_OPEN_BIT, ErrorCode::CircuitOpen(HeatElement::Heater)),
            CircuitFault::Short => {
                (CIRCUIT_SHORT_BIT, ErrorCode::CircuitShort(HeatElement::Heater))
            }
            CircuitFault::Overcurrent => (
                OVERCURRENT_BIT,
                ErrorCode::CircuitOvercurrent(HeatElement::Heater),
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
            info!("heater faults cleared, returning to idle");
        }
    }

    fn enter_error(&mut self, policy: &mut impl HeaterPolicy) {
        policy.disable_power_output();
        self.setpoint = 0.0;
        self.power_test_power = 0.0;
        if self.status != SystemStatus::Error {
            error!("heater entering error state, bitmap {:#06x}", self.error_bitmap);
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
        let code = self.accept_target(target_c, policy);
        if code == ErrorCode::NoError {
            self.setpoint = target_c;
            self.pid.reset();
            self.pid.arm_integrator_reset(target_c - self.pad_temp());
            self.status = SystemStatus::Controlling;
            info!("heater target {target_c:.2}C");
        }
        self.ack(registry, id, code);
    }

    fn accept_target(&mut self, target_c: f64, policy: &mut impl HeaterPolicy) -> ErrorCode {
        if self.error_bitmap != 0 {
            return self.most_relevant_error();
        }
        if !(0.0..=self.max_target_c).contains(&target_c) {
            return ErrorCode::TargetOutOfRange;
        }
        // The latch may be down without any live fault (e.g. after a
        // brownout); disarm it before starting.
        if !policy.power_good() && !policy.try_reset_power_good() {
            self.error_bitmap |= POWER_GOOD_BIT;
            return ErrorCode::LatchFault(HeatElement::Heater);
        }
        ErrorCode::NoError
    }

    fn cmd_get_temperature(&mut self, id: RequestId, registry: &TaskRegistry) {
        let reply = CommsMessage::HeaterTemperature {
            responding_to_id: id,
            pad_a_c: self.pad_a.temp_c,
            pad_b_c: self.pad_b.temp_c,
            board_c: self.board.temp_c,
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
        // Latched circuit and latch faults clear here so the host can
        // retry; sensor faults only clear when the readings do.
        self.error_bitmap &= !RECOVERABLE_MASK;
        if self.status != SystemStatus::Error {
            self.status = SystemStatus::Idle;
        }
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
        // Sensor faults are tolerated (the fixture may have no probes),
        // but circuit and latch faults are not.
        let code = if self.error_bitmap & RECOVERABLE_MASK != 0 {
            self.most_relevant_error()
        } else if !policy.power_good() && !policy.try_reset_power_good() {
            self.error_bitmap |= POWER_GOOD_BIT;
            ErrorCode::LatchFault(HeatElement::Heater)
        } else {
            self.power_test_power = power.clamp(0.0, 1.0);
            self.status = SystemStatus::PowerTest;
            let p = self.power_test_power;
            self.apply_power(p, policy, registry);
            if self.status == SystemStatus::Error {
                // The very first write tripped a circuit fault.
                self.most_relevant_error()
            } else {
                info!("heater power test at {p:.2}");
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

    // ── Reporting ─────────────────────────────────────────────

    /// Highest-priority active fault. The ordering is part of the host
    /// protocol contract; do not reorder.
    pub fn most_relevant_error(&self) -> ErrorCode {
        if self.error_bitmap & CIRCUIT_OPEN_BIT != 0 {
            return ErrorCode::CircuitOpen(HeatElement::Heater);
        }
        if self.error_bitmap & CIRCUIT_SHORT_BIT != 0 {
            return ErrorCode::CircuitShort(HeatElement::Heater);
        }
        if self.error_bitmap & OVERCURRENT_BIT != 0 {
            return ErrorCode::CircuitOvercurrent(HeatElement::Heater);
        }
        if self.pad_a.has_error() {
            return self.pad_a.error;
        }
        if self.pad_b.has_error() {
            return self.pad_b.error;
        }
        if self.error_bitmap & POWER_GOOD_BIT != 0 {
            return ErrorCode::LatchFault(HeatElement::Heater);
        }
        if self.board.has_error() {
            return self.board.error;
        }
        ErrorCode::NoError
    }

    fn update_led(&mut self, registry: &TaskRegistry) {
        let pad_temp = self.pad_temp();
        let led = if self.error_bitmap != 0 {
            (LedColor::Amber, LedMode::Pulse)
        } else if self.status == SystemStatus::Controlling {
            if (pad_temp - self.setpoint).abs() <= HOLDING_BAND_C {
                (LedColor::Red, LedMode::Solid)
            } else {
                (LedColor::Red, LedMode::Pulse)
            }
        } else if pad_temp > HOT_TO_TOUCH_C {
            (LedColor::Amber, LedMode::Solid)
        } else {
            (LedColor::White, LedMode::Solid)
        };
        if led != self.led {
            self.led = led;
            let _ = registry.system.try_send(SystemMessage::UpdateLed {
                color: led.0,
                mode: led.1,
            });
        }
    }

    // ── Queries ───────────────────────────────────────────────

    /// Averaged pad temperature.
    pub fn pad_temp(&self) -> f64 {
        (self.pad_a.temp_c + self.pad_b.temp_c) / 2.0
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
