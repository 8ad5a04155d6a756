//! The kmp module contains the components responsible for the Kamstrup Meter
//! Protocol itself: frame encoding and decoding, and the serial transport the
//! frames travel over.

pub mod frame;
pub mod serial;
pub mod serial_mock;

pub use frame::*;
pub use serial::*;

/// Represents the outcome of decoding a register response.
pub use frame::DecodedResponse;

/// Represents a byte link to the meter.
pub use serial::Transport;
