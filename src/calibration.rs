//! Persisted thermal calibration offsets.
//!
//! Factory calibration characterises each instrument's thermal path as a
//! linear correction applied to converted plate readings:
//!
//! ```text
//! adjusted = a × heatsink + (1 + b) × raw + c
//! ```
//!
//! The plate shares one heatsink coefficient `a` across zones but keeps
//! per-zone `b`/`c` pairs; the heater and lid elements use `b`/`c` only.
//! Blobs are postcard-encoded behind [`StoragePort`]; a missing or
//! corrupt blob falls back to defaults so a wiped EEPROM never bricks
//! the thermal loop.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::ports::{PeltierId, StoragePort};

/// Storage namespace shared by all calibration blobs.
pub const NAMESPACE: &str = "thermal";
/// Storage keys.
pub const PLATE_KEY: &str = "plate_offsets";
pub const HEATER_KEY: &str = "heater_offsets";
pub const LID_KEY: &str = "lid_offsets";

// Largest postcard encoding of either struct, with headroom.
const BLOB_CAP: usize = 64;

// Real correction constants are fractions of a degree per degree; any
// non-finite or larger value means the blob is garbage, not a
// calibrated instrument.
const OFFSET_LIMIT: f64 = 10.0;

fn plausible(v: f64) -> bool {
    v.is_finite() && v.abs() <= OFFSET_LIMIT
}

/// Per-zone plate correction constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlateOffsets {
    /// Heatsink cross-coupling coefficient, shared across zones.
    pub a: f64,
    pub b_left: f64,
    pub c_left: f64,
    pub b_center: f64,
    pub c_center: f64,
    pub b_right: f64,
    pub c_right: f64,
}

impl Default for PlateOffsets {
    fn default() -> Self {
        // Fleet-average constants, used until the unit is calibrated.
        Self {
            a: -0.02,
            b_left: 0.022,
            c_left: -0.154,
            b_center: 0.022,
            c_center: -0.154,
            b_right: 0.022,
            c_right: -0.154,
        }
    }
}

impl PlateOffsets {
    /// Apply the correction for `zone` to a converted reading.
    pub fn adjust(&self, zone: PeltierId, raw_c: f64, heatsink_c: f64) -> f64 {
        let (b, c) = match zone {
            PeltierId::Left => (self.b_left, self.c_left),
            PeltierId::Center => (self.b_center, self.c_center),
            PeltierId::Right => (self.b_right, self.c_right),
        };
        self.a * heatsink_c + (1.0 + b) * raw_c + c
    }

    pub fn load_or_default(storage: &impl StoragePort) -> Self {
        match load_blob::<Self>(storage, PLATE_KEY) {
            Some(offsets) if offsets.is_plausible() => offsets,
            Some(_) => {
                warn!("calibration blob for {PLATE_KEY} is implausible; using defaults");
                Self::default()
            }
            None => Self::default(),
        }
    }

    pub fn store(&self, storage: &mut impl StoragePort) -> Result<(), StorageError> {
        store_blob(storage, PLATE_KEY, self)
    }

    fn is_plausible(&self) -> bool {
        [
            self.a,
            self.b_left,
            self.c_left,
            self.b_center,
            self.c_center,
            self.b_right,
            self.c_right,
        ]
        .into_iter()
        .all(plausible)
    }
}

/// Correction constants for a single heating element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementOffsets {
    pub b: f64,
    pub c: f64,
}

impl ElementOffsets {
    /// Apply the correction to a converted reading.
    pub fn adjust(&self, raw_c: f64) -> f64 {
        (1.0 + self.b) * raw_c + self.c
    }

    pub fn load_or_default(storage: &impl StoragePort, key: &str) -> Self {
        match load_blob::<Self>(storage, key) {
            Some(offsets) if plausible(offsets.b) && plausible(offsets.c) => offsets,
            Some(_) => {
                warn!("calibration blob for {key} is implausible; using defaults");
                Self::default()
            }
            None => Self::default(),
        }
    }

    pub fn store(&self, storage: &mut impl StoragePort, key: &str) -> Result<(), StorageError> {
        store_blob(storage, key, self)
    }
}

fn load_blob<T: for<'de> Deserialize<'de>>(storage: &impl StoragePort, key: &str) -> Option<T> {
    let mut buf = [0u8; BLOB_CAP];
    let len = match storage.read(NAMESPACE, key, &mut buf) {
        Ok(len) => len,
        Err(StorageError::NotFound) => return None,
        Err(e) => {
            warn!("calibration read failed for {key}: {e}; using defaults");
            return None;
        }
    };
    match postcard::from_bytes(&buf[..len]) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("calibration blob for {key} is corrupt; using defaults");
            None
        }
    }
}

fn store_blob<T: Serialize>(
    storage: &mut impl StoragePort,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let mut buf = [0u8; BLOB_CAP];
    let used = postcard::to_slice(value, &mut buf).map_err(|_| StorageError::BufferTooSmall)?;
    storage.write(NAMESPACE, key, used)
}
