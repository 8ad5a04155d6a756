//! Tests for the logging helpers of the `kamstrup-rs` crate.

use kamstrup_rs::logging::{init_logger, init_logger_with_default, log_info};
use kamstrup_rs::util::logging::{log_frame_hex, LogThrottle};

/// Tests that the logging helpers do not panic after init.
#[test]
fn test_logging() {
    init_logger();
    log_info("This is an info message");
    log_frame_hex("TX", &[0x80, 0x3F, 0x10, 0x01, 0x00, 0x3C, 0x0D]);
}

/// Tests that the logger can be initialized more than once.
#[test]
fn test_init_logger_twice() {
    init_logger();
    init_logger_with_default("debug");
}

/// Tests that a throttle caps repeated warnings.
#[test]
fn test_throttle_caps_messages() {
    let mut throttle = LogThrottle::new(60_000, 5);
    let allowed = (0..20).filter(|_| throttle.allow()).count();
    assert_eq!(allowed, 5);
    assert!(!throttle.allow());
}
