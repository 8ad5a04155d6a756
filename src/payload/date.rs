//! Packed date registers.
//!
//! Some registers (e.g. the date of the monthly maximum flow) report a date
//! as the decimal number `yymmdd`, so `230101.0` is 1 January 2023.

use crate::error::DateDecodeError;
use crate::payload::record::Measurement;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};

/// Decodes a packed date, anchoring the two-digit year to the current
/// century. Returns local midnight of that day.
pub fn decode_packed_date(value: f64) -> Result<DateTime<Local>, DateDecodeError> {
    let century = Local::now().year() / 100 * 100;
    decode_packed_date_in_century(value, century)
}

/// Decodes a packed date with an explicit century (e.g. `2000`).
pub fn decode_packed_date_in_century(
    value: f64,
    century: i32,
) -> Result<DateTime<Local>, DateDecodeError> {
    let date = packed_date_to_naive(value, century)?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        DateDecodeError::NonexistentLocalTime(date)
    })?;

    Local
        .from_local_datetime(&midnight)
        .earliest()
        .ok_or(DateDecodeError::NonexistentLocalTime(date))
}

/// Parses the `yymmdd` digits of a packed date into a calendar date.
pub fn packed_date_to_naive(value: f64, century: i32) -> Result<NaiveDate, DateDecodeError> {
    if !value.is_finite() || value < 0.0 || value.trunc() > 999_999.0 {
        return Err(DateDecodeError::InvalidDigits(value.to_string()));
    }

    let digits = format!("{:06}", value.trunc() as u32);
    let field = |range: std::ops::Range<usize>| -> Result<u32, DateDecodeError> {
        digits[range]
            .parse::<u32>()
            .map_err(|_| DateDecodeError::InvalidDigits(digits.clone()))
    };

    let year = field(0..2)?;
    let month = field(2..4)?;
    let day = field(4..6)?;

    NaiveDate::from_ymd_opt(century + year as i32, month, day)
        .ok_or_else(|| DateDecodeError::InvalidDigits(digits.clone()))
}

impl Measurement {
    /// Interprets the value as a packed date register.
    pub fn as_date(&self) -> Result<DateTime<Local>, DateDecodeError> {
        decode_packed_date(self.value)
    }
}
