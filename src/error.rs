//! Unified error codes for the thermal control core.
//!
//! Domain failures are plain data, not panics. Every code is `Copy` so it
//! can be carried in messages, latched in task bitmaps, and echoed back to
//! the host layer without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Sensor channels
// ---------------------------------------------------------------------------

/// Every thermistor channel in the instrument. Used to qualify sensor
/// error codes so the host can tell which physical probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermistorChannel {
    PlateFrontRight,
    PlateFrontLeft,
    PlateFrontCenter,
    PlateBackRight,
    PlateBackLeft,
    PlateBackCenter,
    Heatsink,
    Lid,
    HeaterPadA,
    HeaterPadB,
    HeaterBoard,
}

impl fmt::Display for ThermistorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlateFrontRight => write!(f, "plate front-right"),
            Self::PlateFrontLeft => write!(f, "plate front-left"),
            Self::PlateFrontCenter => write!(f, "plate front-center"),
            Self::PlateBackRight => write!(f, "plate back-right"),
            Self::PlateBackLeft => write!(f, "plate back-left"),
            Self::PlateBackCenter => write!(f, "plate back-center"),
            Self::Heatsink => write!(f, "heatsink"),
            Self::Lid => write!(f, "lid"),
            Self::HeaterPadA => write!(f, "heater pad A"),
            Self::HeaterPadB => write!(f, "heater pad B"),
            Self::HeaterBoard => write!(f, "heater board"),
        }
    }
}

/// Which heating element a circuit-level fault refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatElement {
    Heater,
    Lid,
}

impl fmt::Display for HeatElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heater => write!(f, "heater"),
            Self::Lid => write!(f, "lid"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Every fault or rejection the control tasks can report. Codes flow in
/// two directions: latched into a task's error bitmap when hardware
/// misbehaves, and echoed in acknowledgements when a command is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    /// Thermistor reads open — ADC pinned past the conversion table.
    ThermistorDisconnected(ThermistorChannel),
    /// Thermistor reads shorted — ADC pinned the other way.
    ThermistorShort(ThermistorChannel),
    /// Converted temperature exceeds the channel's safety limit.
    ThermistorOvertemp(ThermistorChannel),
    /// Element power circuit reads open.
    CircuitOpen(HeatElement),
    /// Element power circuit reads shorted.
    CircuitShort(HeatElement),
    /// Element power circuit tripped its current limit.
    CircuitOvercurrent(HeatElement),
    /// Safety latch would not re-arm after its fault inputs cleared.
    LatchFault(HeatElement),
    /// A peltier drive refused a power command.
    PeltierFault,
    /// The heatsink fan refused a power command.
    FanFault,
    /// One plate zone drifted from setpoint while the others held.
    PlateDrift,
    /// Command refused because the task is actively driving power.
    Busy,
    /// Requested target temperature is outside the allowed band.
    TargetOutOfRange,
    /// Requested PID gain is outside the allowed band.
    GainOutOfRange,
}

impl ErrorCode {
    /// True for any code other than `NoError`.
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "no error"),
            Self::ThermistorDisconnected(ch) => write!(f, "{ch} thermistor disconnected"),
            Self::ThermistorShort(ch) => write!(f, "{ch} thermistor shorted"),
            Self::ThermistorOvertemp(ch) => write!(f, "{ch} thermistor over temperature"),
            Self::CircuitOpen(el) => write!(f, "{el} circuit open"),
            Self::CircuitShort(el) => write!(f, "{el} circuit shorted"),
            Self::CircuitOvercurrent(el) => write!(f, "{el} circuit overcurrent"),
            Self::LatchFault(el) => write!(f, "{el} safety latch will not reset"),
            Self::PeltierFault => write!(f, "peltier drive fault"),
            Self::FanFault => write!(f, "heatsink fan fault"),
            Self::PlateDrift => write!(f, "plate zone temperature drift"),
            Self::Busy => write!(f, "task busy"),
            Self::TargetOutOfRange => write!(f, "target temperature out of range"),
            Self::GainOutOfRange => write!(f, "PID gain out of range"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Failures from the persistence seam. Calibration loading treats every
/// variant the same way (fall back to defaults), but adapters report the
/// distinction for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Key does not exist in the namespace.
    NotFound,
    /// Caller's buffer is too small for the stored blob.
    BufferTooSmall,
    /// Backing medium failed the operation.
    Io,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::Io => write!(f, "storage I/O failed"),
        }
    }
}
