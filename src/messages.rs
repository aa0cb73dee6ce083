//! Inter-task message unions.
//!
//! Every control task owns a mailbox of its own closed message enum;
//! replies flow to the comms task and UI updates to the system task.
//! Commands carry a host-assigned request id, and every command produces
//! exactly one acknowledgement echoing that id — the host matches replies
//! to requests by id alone, so a task must never ack twice or drop an ack.

use crate::error::ErrorCode;

/// Host-assigned correlation id carried on every command/ack pair.
pub type RequestId = u32;

/// Direction a peltier pair is driven. Zero power reads as `Heating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeltierDirection {
    #[default]
    Heating,
    Cooling,
}

/// Which plate zone(s) a debug/tuning command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeltierSelection {
    All,
    Left,
    Center,
    Right,
}

/// Which plate controller a gain update addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidSelection {
    Peltiers,
    Fans,
}

// ---------------------------------------------------------------------------
// Heater task
// ---------------------------------------------------------------------------

/// Raw ADC counts for one heater conversion cycle. Timestamps are the
/// hardware counter's wrapping milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct HeaterReadings {
    pub pad_a: u16,
    pub pad_b: u16,
    pub board: u16,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum HeaterMessage {
    TempReadComplete(HeaterReadings),
    SetTemperature { id: RequestId, target_c: f64 },
    GetTemperature { id: RequestId },
    Deactivate { id: RequestId },
    SetPidConstants { id: RequestId, kp: f64, ki: f64, kd: f64 },
    /// Drive the pads open-loop at a fixed power for manufacturing test.
    SetPowerTest { id: RequestId, power: f64 },
}

// ---------------------------------------------------------------------------
// Lid heater task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct LidReadings {
    pub lid: u16,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum LidMessage {
    TempReadComplete(LidReadings),
    SetTemperature { id: RequestId, target_c: f64 },
    GetTemperature { id: RequestId },
    Deactivate { id: RequestId },
    SetPidConstants { id: RequestId, kp: f64, ki: f64, kd: f64 },
    SetPowerTest { id: RequestId, power: f64 },
}

// ---------------------------------------------------------------------------
// Thermal plate task
// ---------------------------------------------------------------------------

/// Raw ADC counts for one plate conversion cycle, six plate channels
/// plus the heatsink.
#[derive(Debug, Clone, Copy)]
pub struct PlateReadings {
    pub front_right: u16,
    pub front_left: u16,
    pub front_center: u16,
    pub back_right: u16,
    pub back_left: u16,
    pub back_center: u16,
    pub heatsink: u16,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum PlateMessage {
    TempReadComplete(PlateReadings),
    SetTemperature {
        id: RequestId,
        target_c: f64,
        /// Seconds to hold at target once reached. 0 = hold forever.
        hold_time_s: f64,
        /// Sample volume for overshoot sizing. `None` = default volume.
        volume_ul: Option<f64>,
        /// Setpoint slew limit in °C/s. `None` = unlimited (snap).
        ramp_rate: Option<f64>,
    },
    GetTemperature { id: RequestId },
    Deactivate { id: RequestId },
    SetPidConstants {
        id: RequestId,
        selection: PidSelection,
        kp: f64,
        ki: f64,
        kd: f64,
    },
    /// Drive selected zones open-loop for manufacturing test.
    SetPowerTest {
        id: RequestId,
        selection: PeltierSelection,
        power: f64,
        direction: PeltierDirection,
    },
    /// Pin the fan at a fixed power, overriding the automatic policy.
    SetFanManual { id: RequestId, power: f64 },
    /// Return the fan to the automatic policy.
    SetFanAutomatic { id: RequestId },
}

// ---------------------------------------------------------------------------
// Comms task (host-bound replies)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum CommsMessage {
    /// The single reply every command produces.
    Acknowledge {
        responding_to_id: RequestId,
        with_error: ErrorCode,
    },
    /// Unsolicited fault notification (new sensor/circuit fault).
    Error { code: ErrorCode },
    HeaterTemperature {
        responding_to_id: RequestId,
        pad_a_c: f64,
        pad_b_c: f64,
        board_c: f64,
        target_c: f64,
    },
    LidTemperature {
        responding_to_id: RequestId,
        lid_c: f64,
        target_c: f64,
    },
    PlateTemperature {
        responding_to_id: RequestId,
        front_right_c: f64,
        front_left_c: f64,
        front_center_c: f64,
        back_right_c: f64,
        back_left_c: f64,
        back_center_c: f64,
        heatsink_c: f64,
        target_c: f64,
    },
}

// ---------------------------------------------------------------------------
// System task (UI / supervision)
// ---------------------------------------------------------------------------

/// Front-panel LED modes the heater task can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Solid,
    Pulse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    White,
    Red,
    Amber,
}

/// Coarse plate activity for the front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateActivity {
    Idle,
    Heating,
    AtHotTemp,
    Cooling,
    AtColdTemp,
    Error,
}

/// Which task a supervision update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Heater,
    Lid,
    Plate,
}

#[derive(Debug, Clone, Copy)]
pub enum SystemMessage {
    /// A task's error bitmap changed.
    TaskError { task: TaskKind, bitmap: u16 },
    UpdateLed { color: LedColor, mode: LedMode },
    UpdatePlateState { activity: PlateActivity },
}
