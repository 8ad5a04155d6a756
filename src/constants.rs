//! KMP Protocol Constants
//!
//! This module defines constants used by the Kamstrup Meter Protocol (KMP)
//! implementation, as documented for the Kamstrup 382/403 meter families.

/// Start byte of a frame sent to the meter
pub const KMP_START_REQUEST: u8 = 0x80;

/// Start byte of a frame sent by the meter
pub const KMP_START_RESPONSE: u8 = 0x40;

/// Stop byte terminating every frame
pub const KMP_STOP: u8 = 0x0D;

/// Acknowledge byte (reserved, must be escaped inside a frame)
pub const KMP_ACK: u8 = 0x06;

/// Escape byte, followed by the escaped byte XOR 0xFF
pub const KMP_ESCAPE: u8 = 0x1B;

/// XOR mask applied to an escaped byte
pub const KMP_ESCAPE_MASK: u8 = 0xFF;

/// Bytes that may not appear unescaped between the delimiters
pub const KMP_RESERVED_BYTES: [u8; 5] = [KMP_ACK, KMP_STOP, KMP_ESCAPE, KMP_START_RESPONSE, KMP_START_REQUEST];

/// Destination address of the meter on a point-to-point link
pub const KMP_DESTINATION_ADDRESS: u8 = 0x3F;

/// Command id: read one or more registers
pub const KMP_CID_GET_REGISTER: u8 = 0x10;

/// Maximum number of registers the meter answers in one request
pub const KMP_MAX_REGISTERS_PER_REQUEST: usize = 8;

/// Maximum mantissa width in bytes that fits an i64
pub const KMP_MAX_MANTISSA_BYTES: usize = 8;

// ----------------------------------------------------------------------------
// SIEX byte (sign of integer, sign of exponent, exponent)
// ----------------------------------------------------------------------------

pub const KMP_SIEX_MANTISSA_NEGATIVE: u8 = 0x80;
pub const KMP_SIEX_EXPONENT_NEGATIVE: u8 = 0x40;
pub const KMP_SIEX_EXPONENT_MASK: u8 = 0x3F;

// Link and polling defaults
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: f64 = 1.0;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 3600;
