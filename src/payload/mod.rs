//! The payload module contains the components responsible for turning the
//! register blocks of a KMP response into typed measurements.

pub mod date;
pub mod derived;
pub mod record;
pub mod registers;
pub mod units;

pub use date::*;
pub use record::*;
pub use registers::*;
pub use units::*;

/// Represents a decoded, unscaled register value.
pub use record::RawSample;

/// Represents a scaled register value.
pub use record::Measurement;
