//! Register values: raw protocol samples, scaled measurements and the
//! results cache the coordinator publishes.

use crate::payload::units::{unit_info, UnitLabel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifies a meter register. KMP register ids are 16 bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterKey(pub u16);

impl RegisterKey {
    pub const fn new(id: u16) -> Self {
        RegisterKey(id)
    }

    pub const fn id(self) -> u16 {
        self.0
    }

    /// Big-endian wire representation.
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for RegisterKey {
    fn from(id: u16) -> Self {
        RegisterKey(id)
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RegisterKey {
    type Err = std::num::ParseIntError;

    /// Accepts decimal (`60`) or hexadecimal (`0x003C`) register ids.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).map(RegisterKey),
            None => s.parse::<u16>().map(RegisterKey),
        }
    }
}

/// Decoded but unscaled register value, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub key: RegisterKey,
    pub unit_code: u8,
    pub mantissa: i64,
    pub exponent: i8,
}

impl RawSample {
    /// Applies the unit table: `mantissa * 10^(exponent + scale)`.
    pub fn to_measurement(&self) -> Measurement {
        let (unit, scale) = unit_info(self.unit_code);
        let power = i32::from(self.exponent) + i32::from(scale);
        let mantissa = self.mantissa as f64;
        // Dividing keeps values such as 1234e-2 exact to the last digit
        let value = if power >= 0 {
            mantissa * 10f64.powi(power)
        } else {
            mantissa / 10f64.powi(-power)
        };

        Measurement {
            key: self.key,
            value,
            unit,
        }
    }
}

/// A scaled register value with its physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub key: RegisterKey,
    pub value: f64,
    pub unit: Option<UnitLabel>,
}

/// Latest successfully decoded measurement per register.
///
/// A register that never answered has no entry. Entries are only replaced,
/// never cleared, so a failed read leaves the last known value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultsCache {
    measurements: BTreeMap<RegisterKey, Measurement>,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: RegisterKey) -> Option<&Measurement> {
        self.measurements.get(&key)
    }

    /// Convenience accessor for the scaled value of a register.
    pub fn value(&self, key: RegisterKey) -> Option<f64> {
        self.get(key).map(|m| m.value)
    }

    pub fn contains(&self, key: RegisterKey) -> bool {
        self.measurements.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = RegisterKey> + '_ {
        self.measurements.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.measurements.values()
    }

    /// Stores a measurement, returning `true` if the cache changed.
    pub(crate) fn merge(&mut self, measurement: Measurement) -> bool {
        match self.measurements.insert(measurement.key, measurement) {
            Some(previous) => previous != measurement,
            None => true,
        }
    }
}

impl FromIterator<Measurement> for ResultsCache {
    /// Later measurements of the same register win.
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        let mut cache = ResultsCache::new();
        for measurement in iter {
            cache.merge(measurement);
        }
        cache
    }
}
