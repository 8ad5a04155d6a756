//! # Kamstrup Error Handling
//!
//! This module defines the error enums for every layer of the crate: frame
//! encoding and decoding, the serial transport, packed date registers, the
//! command registry and configuration. `KamstrupError` wraps all of them for
//! callers that just want one error type.

use crate::payload::RegisterKey;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A request must name at least one register.
    #[error("Request contains no registers")]
    Empty,

    /// The batch exceeds the registers-per-request limit of the protocol.
    #[error("Too many registers in one request: {count} (max {max})")]
    TooManyKeys { count: usize, max: usize },
}

/// Errors raised while decoding a frame received from the meter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame does not start or end with the expected delimiter.
    #[error("Missing or unexpected frame delimiter")]
    Delimiter,

    /// An escape byte was the last byte before the stop byte.
    #[error("Escape byte at end of frame")]
    DanglingEscape,

    /// Fewer bytes are available than the declared structure requires.
    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The CRC over the unescaped payload does not match.
    #[error("Invalid checksum: expected 0x{expected:04X}, calculated 0x{calculated:04X}")]
    ChecksumMismatch { expected: u16, calculated: u16 },

    /// The frame is not a register response from the meter.
    #[error("Unexpected frame header: address 0x{address:02X}, command 0x{command:02X}")]
    UnexpectedHeader { address: u8, command: u8 },

    /// The declared mantissa width is zero or wider than an i64.
    #[error("Unsupported mantissa width: {0} bytes")]
    MantissaWidth(u8),

    /// The signed mantissa does not fit an i64.
    #[error("Mantissa of register {key} overflows i64")]
    MantissaOverflow { key: RegisterKey },

    /// The unit code has no table entry. Reported as a warning alongside
    /// the decoded sample.
    #[error("Unknown unit code {code} for register {key}")]
    UnknownUnit { key: RegisterKey, code: u8 },
}

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to open serial port: {0}")]
    Open(String),

    #[error("Serial write failed: {0}")]
    Write(String),

    #[error("Serial read failed: {0}")]
    Read(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Transport is not open")]
    NotOpen,
}

/// Errors raised while decoding a packed `yymmdd` date register.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateDecodeError {
    #[error("Invalid packed date digits: {0}")]
    InvalidDigits(String),

    #[error("Local midnight does not exist for {0}")]
    NonexistentLocalTime(chrono::NaiveDate),
}

/// Errors raised by the command registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Register {0} is not attached")]
    NotAttached(RegisterKey),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error for library callers.
#[derive(Debug, Error)]
pub enum KamstrupError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Date(#[from] DateDecodeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A catch‑all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}
