//! ADC-count to temperature conversion for NTC thermistors.
//!
//! Conversion is a monotonic lookup table with linear interpolation
//! between bracketing entries. ADC counts ascend while temperature
//! descends (NTC in a pull-up divider: hotter probe, lower counts).
//! Readings past either end of the table are hardware faults, not
//! temperatures — no extrapolation.

use core::fmt;

/// Full-scale ADC count on the sense rail.
pub const ADC_MAX: u16 = 0x5DC0;

/// A reading fell off the conversion table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// ADC pinned high — temperature below the table minimum.
    OutOfRangeLow,
    /// ADC pinned low — temperature above the table maximum.
    OutOfRangeHigh,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRangeLow => write!(f, "reading below table range"),
            Self::OutOfRangeHigh => write!(f, "reading above table range"),
        }
    }
}

/// Maps range faults to circuit diagnoses. The two sense circuit
/// variants in the fleet disagree on which rail a broken probe pins
/// the ADC to, so each sensor instance declares its own polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolarity {
    /// Rail-high ADC (`OutOfRangeLow`) means the probe is disconnected.
    #[default]
    LowIsDisconnected,
    /// Rail-high ADC means the probe is shorted.
    LowIsShort,
}

/// A static `(adc, temp_c)` lookup table.
///
/// Entries must be strictly ascending in ADC and strictly descending in
/// temperature; `debug_assert`ed at construction sites via tests.
#[derive(Debug)]
pub struct ConversionTable {
    entries: &'static [(u16, f64)],
}

impl ConversionTable {
    pub const fn new(entries: &'static [(u16, f64)]) -> Self {
        Self { entries }
    }

    /// Convert an ADC reading to °C.
    pub fn convert(&self, adc: u16) -> Result<f64, RangeError> {
        let first = self.entries[0];
        let last = self.entries[self.entries.len() - 1];
        if adc < first.0 {
            return Err(RangeError::OutOfRangeHigh);
        }
        if adc > last.0 {
            return Err(RangeError::OutOfRangeLow);
        }
        // Bracket and interpolate. Tables are ~30 entries; linear scan
        // beats a binary search at this size.
        let mut prev = first;
        for &entry in &self.entries[1..] {
            if adc == prev.0 {
                return Ok(prev.1);
            }
            if adc < entry.0 {
                let span = f64::from(entry.0 - prev.0);
                let frac = f64::from(adc - prev.0) / span;
                return Ok(prev.1 + frac * (entry.1 - prev.1));
            }
            prev = entry;
        }
        Ok(last.1)
    }

    /// Invert the table: the ADC count that converts nearest to
    /// `temp_c`. `None` outside the table's temperature span. Used by
    /// simulators and tests to synthesize readings.
    pub fn backconvert(&self, temp_c: f64) -> Option<u16> {
        let first = self.entries[0];
        let last = self.entries[self.entries.len() - 1];
        if temp_c > first.1 || temp_c < last.1 {
            return None;
        }
        let mut prev = first;
        for &entry in &self.entries[1..] {
            if temp_c >= entry.1 {
                let span = prev.1 - entry.1;
                let frac = if span > 0.0 { (prev.1 - temp_c) / span } else { 0.0 };
                let adc = f64::from(prev.0) + frac * f64::from(entry.0 - prev.0);
                return Some(adc.round() as u16);
            }
            prev = entry;
        }
        Some(last.0)
    }

    /// Lowest in-range ADC count.
    pub fn adc_min(&self) -> u16 {
        self.entries[0].0
    }

    /// Highest in-range ADC count.
    pub fn adc_max(&self) -> u16 {
        self.entries[self.entries.len() - 1].0
    }
}

/// 10 kΩ B3984 NTC against a 10 kΩ pull-up, 24000-count full scale.
/// Shared by every probe in the instrument.
pub static NTC_10K_B3984: ConversionTable = ConversionTable::new(&[
    (914, 120.0),
    (1036, 115.0),
    (1177, 110.0),
    (1341, 105.0),
    (1532, 100.0),
    (1753, 95.0),
    (2011, 90.0),
    (2312, 85.0),
    (2663, 80.0),
    (3071, 75.0),
    (3546, 70.0),
    (4097, 65.0),
    (4733, 60.0),
    (5464, 55.0),
    (6297, 50.0),
    (7237, 45.0),
    (8286, 40.0),
    (9438, 35.0),
    (10683, 30.0),
    (12000, 25.0),
    (13362, 20.0),
    (14734, 15.0),
    (16078, 10.0),
    (17359, 5.0),
    (18542, 0.0),
    (19604, -5.0),
    (20529, -10.0),
    (21312, -15.0),
    (21958, -20.0),
]);
