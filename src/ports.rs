//! Hardware policy traits — the seam between control logic and drivers.
//!
//! Tasks consume these via generics, so the whole control core runs
//! against mock policies on the host. Board support crates implement
//! them over the real PWM/GPIO/latch hardware.

use crate::error::StorageError;
use crate::messages::PeltierDirection;

/// Synchronous fault report from an element power write. The hardware
/// samples its sense lines inside the write, so a bad circuit surfaces
/// immediately rather than waiting for the next conversion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitFault {
    #[default]
    None,
    Open,
    Short,
    Overcurrent,
}

/// One resistive heating element behind a hardware safety latch
/// (heater pads or the lid element).
pub trait HeaterPolicy {
    /// Whether the safety latch currently permits power.
    fn power_good(&self) -> bool;

    /// Attempt to re-arm the safety latch. `false` when the latch
    /// refuses, which is a distinct hardware fault from whatever
    /// tripped it.
    fn try_reset_power_good(&mut self) -> bool;

    /// Drive the element at `power` ∈ [0, 1]. Returns the circuit
    /// fault sampled during the write.
    fn set_power_output(&mut self, power: f64) -> CircuitFault;

    /// Cut element power immediately.
    fn disable_power_output(&mut self);
}

/// One of the three peltier pairs under the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeltierId {
    Left,
    Center,
    Right,
}

/// The peltier bank and heatsink fan.
pub trait PlatePolicy {
    /// Master enable for the peltier drive stage.
    fn set_enabled(&mut self, enabled: bool);

    /// Drive one pair at `power` ∈ [0, 1] in `direction`.
    /// `false` when the drive rejects the command.
    fn set_peltier(&mut self, id: PeltierId, power: f64, direction: PeltierDirection) -> bool;

    /// Last commanded drive for one pair.
    fn get_peltier(&self, id: PeltierId) -> (PeltierDirection, f64);

    /// Drive the heatsink fan at `power` ∈ [0, 1].
    fn set_fan(&mut self, power: f64) -> bool;

    /// Last commanded fan power.
    fn get_fan(&self) -> f64;
}

/// Namespaced key-value persistence (EEPROM / flash / host file).
/// Writes are atomic: a torn write must surface as a read failure,
/// never as a partial blob.
pub trait StoragePort {
    /// Read a value into `buf`, returning the byte count.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Create or overwrite a value.
    fn write(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Whether a key exists.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}
