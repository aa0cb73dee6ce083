//! Sensor and actuator records shared by the control tasks.
//!
//! A [`Thermistor`] tracks the latest converted reading and its fault
//! classification; [`Peltier`] and [`HeatsinkFan`] bundle the sensors a
//! controller regulates with its PID state.

use crate::control::pid::Pid;
use crate::error::{ErrorCode, ThermistorChannel};
use crate::ports::PeltierId;
use crate::sensors::thermistor::{ConversionTable, RangeError, RangePolarity};

/// While the safety latch is down, readings this close to the limit
/// still count as overtemp; stops the latch chattering at the edge.
const OVERTEMP_LATCH_BAND_C: f64 = 1.0;
/// Once in overtemp, the reading must fall this far below the limit
/// before the fault clears.
const OVERTEMP_HOLD_BAND_C: f64 = 5.0;

/// One NTC probe and its latest classified reading.
#[derive(Debug, Clone)]
pub struct Thermistor {
    pub channel: ThermistorChannel,
    /// Latest successful conversion (stale while `error` is set).
    pub temp_c: f64,
    pub last_adc: u16,
    /// Classification of the most recent conversion only.
    pub error: ErrorCode,
    pub overtemp_limit_c: f64,
    /// This probe's bit in the owning task's error bitmap.
    pub error_bit: u16,
    polarity: RangePolarity,
    table: &'static ConversionTable,
}

impl Thermistor {
    pub fn new(
        channel: ThermistorChannel,
        overtemp_limit_c: f64,
        error_bit: u16,
        polarity: RangePolarity,
        table: &'static ConversionTable,
    ) -> Self {
        Self {
            channel,
            temp_c: 0.0,
            last_adc: 0,
            error: ErrorCode::NoError,
            overtemp_limit_c,
            error_bit,
            polarity,
            table,
        }
    }

    /// Classify one conversion. `latch_down` tightens the overtemp
    /// threshold while the hardware safety latch is already tripped.
    pub fn update(&mut self, adc: u16, latch_down: bool) {
        self.last_adc = adc;
        match self.table.convert(adc) {
            Ok(temp_c) => {
                self.temp_c = temp_c;
                let was_overtemp = matches!(self.error, ErrorCode::ThermistorOvertemp(_));
                let limit = if was_overtemp {
                    self.overtemp_limit_c - OVERTEMP_HOLD_BAND_C
                } else if latch_down {
                    self.overtemp_limit_c - OVERTEMP_LATCH_BAND_C
                } else {
                    self.overtemp_limit_c
                };
                self.error = if temp_c > limit {
                    ErrorCode::ThermistorOvertemp(self.channel)
                } else {
                    ErrorCode::NoError
                };
            }
            Err(RangeError::OutOfRangeLow) => {
                self.error = match self.polarity {
                    RangePolarity::LowIsDisconnected => {
                        ErrorCode::ThermistorDisconnected(self.channel)
                    }
                    RangePolarity::LowIsShort => ErrorCode::ThermistorShort(self.channel),
                };
            }
            Err(RangeError::OutOfRangeHigh) => {
                self.error = match self.polarity {
                    RangePolarity::LowIsDisconnected => ErrorCode::ThermistorShort(self.channel),
                    RangePolarity::LowIsShort => ErrorCode::ThermistorDisconnected(self.channel),
                };
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_error()
    }
}

/// One peltier pair and the two probes it regulates on.
#[derive(Debug, Clone)]
pub struct Peltier {
    pub id: PeltierId,
    pub front: Thermistor,
    pub back: Thermistor,
    pub pid: Pid,
    pub temp_target: f64,
}

impl Peltier {
    pub fn new(id: PeltierId, front: Thermistor, back: Thermistor, pid: Pid) -> Self {
        Self {
            id,
            front,
            back,
            pid,
            temp_target: 0.0,
        }
    }

    /// Zone temperature is the average of the pair.
    pub fn current_temp(&self) -> f64 {
        (self.front.temp_c + self.back.temp_c) / 2.0
    }

    pub fn has_sensor_error(&self) -> bool {
        self.front.has_error() || self.back.has_error()
    }
}

/// The heatsink fan and the probe its automatic policy regulates on.
#[derive(Debug, Clone)]
pub struct HeatsinkFan {
    pub thermistor: Thermistor,
    pub pid: Pid,
    pub temp_target: f64,
    /// True while the host has pinned the fan at a fixed power.
    pub manual_control: bool,
}

impl HeatsinkFan {
    pub fn new(thermistor: Thermistor, pid: Pid) -> Self {
        Self {
            thermistor,
            pid,
            temp_target: 0.0,
            manual_control: false,
        }
    }
}
