//! Mock hardware policies for integration tests.
//!
//! Record every actuator call so tests can assert on the full command
//! history, and let tests script fault injection (latch refusing to
//! re-arm, circuit faults on power writes, drives rejecting commands).

use std::collections::HashMap;

use thermocore::error::StorageError;
use thermocore::messages::PeltierDirection;
use thermocore::ports::{CircuitFault, HeaterPolicy, PeltierId, PlatePolicy, StoragePort};
use thermocore::sensors::thermistor::NTC_10K_B3984;

// ── Heater-side mock ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum HeaterCall {
    SetPower(f64),
    Disable,
    TryReset,
}

pub struct MockHeater {
    pub calls: Vec<HeaterCall>,
    pub latch_ok: bool,
    /// Whether the next `try_reset_power_good` succeeds.
    pub reset_succeeds: bool,
    /// Fault returned by every `set_power_output` call.
    pub fault_on_set: CircuitFault,
}

#[allow(dead_code)]
impl MockHeater {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            latch_ok: true,
            reset_succeeds: true,
            fault_on_set: CircuitFault::None,
        }
    }

    pub fn last_power(&self) -> Option<f64> {
        self.calls.iter().rev().find_map(|c| match c {
            HeaterCall::SetPower(p) => Some(*p),
            HeaterCall::Disable => Some(0.0),
            HeaterCall::TryReset => None,
        })
    }

    pub fn reset_attempts(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, HeaterCall::TryReset))
            .count()
    }
}

impl Default for MockHeater {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaterPolicy for MockHeater {
    fn power_good(&self) -> bool {
        self.latch_ok
    }

    fn try_reset_power_good(&mut self) -> bool {
        self.calls.push(HeaterCall::TryReset);
        if self.reset_succeeds {
            self.latch_ok = true;
        }
        self.reset_succeeds
    }

    fn set_power_output(&mut self, power: f64) -> CircuitFault {
        self.calls.push(HeaterCall::SetPower(power));
        self.fault_on_set
    }

    fn disable_power_output(&mut self) {
        self.calls.push(HeaterCall::Disable);
    }
}

// ── Plate-side mock ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlateCall {
    SetEnabled(bool),
    SetPeltier {
        id: PeltierId,
        power: f64,
        direction: PeltierDirection,
    },
    SetFan(f64),
}

pub struct MockPlate {
    pub calls: Vec<PlateCall>,
    pub zones: [(PeltierDirection, f64); 3],
    pub fan: f64,
    pub enabled: bool,
    /// When false, peltier writes are rejected.
    pub peltier_ok: bool,
    /// When false, fan writes are rejected.
    pub fan_ok: bool,
}

#[allow(dead_code)]
impl MockPlate {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            zones: [(PeltierDirection::Heating, 0.0); 3],
            fan: 0.0,
            enabled: false,
            peltier_ok: true,
            fan_ok: true,
        }
    }

    pub fn zone(&self, id: PeltierId) -> (PeltierDirection, f64) {
        self.zones[zone_index(id)]
    }

    pub fn all_zones_off(&self) -> bool {
        self.zones.iter().all(|(_, p)| *p == 0.0)
    }
}

impl Default for MockPlate {
    fn default() -> Self {
        Self::new()
    }
}

fn zone_index(id: PeltierId) -> usize {
    match id {
        PeltierId::Left => 0,
        PeltierId::Center => 1,
        PeltierId::Right => 2,
    }
}

impl PlatePolicy for MockPlate {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.calls.push(PlateCall::SetEnabled(enabled));
    }

    fn set_peltier(&mut self, id: PeltierId, power: f64, direction: PeltierDirection) -> bool {
        self.calls.push(PlateCall::SetPeltier {
            id,
            power,
            direction,
        });
        if self.peltier_ok {
            self.zones[zone_index(id)] = (direction, power);
        }
        self.peltier_ok
    }

    fn get_peltier(&self, id: PeltierId) -> (PeltierDirection, f64) {
        self.zones[zone_index(id)]
    }

    fn set_fan(&mut self, power: f64) -> bool {
        self.calls.push(PlateCall::SetFan(power));
        if self.fan_ok {
            self.fan = power;
        }
        self.fan_ok
    }

    fn get_fan(&self) -> f64 {
        self.fan
    }
}

// ── Storage mock ──────────────────────────────────────────────

/// HashMap-backed stand-in for the EEPROM.
#[derive(Default, Clone)]
pub struct MockStorage {
    map: HashMap<(String, String), Vec<u8>>,
}

impl StoragePort for MockStorage {
    fn read(&self, ns: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let blob = self
            .map
            .get(&(ns.to_owned(), key.to_owned()))
            .ok_or(StorageError::NotFound)?;
        if blob.len() > buf.len() {
            return Err(StorageError::BufferTooSmall);
        }
        buf[..blob.len()].copy_from_slice(blob);
        Ok(blob.len())
    }

    fn write(&mut self, ns: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map
            .insert((ns.to_owned(), key.to_owned()), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, ns: &str, key: &str) -> Result<(), StorageError> {
        self.map.remove(&(ns.to_owned(), key.to_owned()));
        Ok(())
    }

    fn exists(&self, ns: &str, key: &str) -> bool {
        self.map.contains_key(&(ns.to_owned(), key.to_owned()))
    }
}

// ── Shared helpers ────────────────────────────────────────────

/// ADC counts for a plausible temperature, for synthesizing readings.
#[allow(dead_code)]
pub fn adc_for(temp_c: f64) -> u16 {
    NTC_10K_B3984
        .backconvert(temp_c)
        .unwrap_or_else(|| panic!("{temp_c} outside conversion table"))
}

/// An ADC count pinned past the table (open probe on the default
/// polarity).
#[allow(dead_code)]
pub const ADC_RAIL_HIGH: u16 = 0x5DC0;
/// An ADC count pinned at zero (shorted probe on the default polarity).
#[allow(dead_code)]
pub const ADC_RAIL_LOW: u16 = 0;
