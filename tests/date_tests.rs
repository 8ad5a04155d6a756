//! Tests for packed `yymmdd` date registers.

use chrono::{Datelike, NaiveDate, Timelike};
use kamstrup_rs::payload::{decode_packed_date, decode_packed_date_in_century, packed_date_to_naive};
use kamstrup_rs::payload::{Measurement, MeterModel, RegisterKey};
use kamstrup_rs::DateDecodeError;

#[test]
fn test_decode_to_local_midnight() {
    let date = decode_packed_date_in_century(230101.0, 2000).unwrap();
    assert_eq!(date.date_naive(), NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
    assert_eq!((date.hour(), date.minute(), date.second()), (0, 0, 0));
}

#[test]
fn test_leading_zero_year() {
    // 050101 loses its leading zero on the wire
    let date = packed_date_to_naive(50101.0, 2000).unwrap();
    assert_eq!(date, NaiveDate::from_ymd_opt(2005, 1, 1).unwrap());

    let date = packed_date_to_naive(101.0, 2000).unwrap();
    assert_eq!(date, NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
}

#[test]
fn test_current_century() {
    let date = decode_packed_date(240229.0).unwrap();
    assert_eq!(date.year() % 100, 24);
    assert_eq!((date.month(), date.day()), (2, 29));
}

#[test]
fn test_invalid_dates() {
    for value in [991301.0, 230230.0, 230100.0, 0.0, -1.0, 1_000_000.0, f64::NAN] {
        assert!(
            matches!(
                packed_date_to_naive(value, 2000),
                Err(DateDecodeError::InvalidDigits(_))
            ),
            "{value} should be rejected"
        );
    }
}

#[test]
fn test_measurement_as_date() {
    let model = MeterModel::Kamstrup403;
    let date_register = model
        .registers()
        .iter()
        .find(|info| model.is_date_register(info.key))
        .map(|info| info.key)
        .unwrap();

    let measurement = Measurement {
        key: date_register,
        value: 231231.0,
        unit: None,
    };
    let date = measurement.as_date().unwrap();
    assert_eq!((date.month(), date.day()), (12, 31));
    assert!(!model.is_date_register(RegisterKey(60)));
}
