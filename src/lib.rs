//! # kamstrup-rs - A Rust Crate for Reading Kamstrup Heat Meters
//!
//! The kamstrup-rs crate implements the Kamstrup Meter Protocol (KMP) as used
//! by the Kamstrup 382 and 403 meters over an optical eye, and a polling
//! coordinator that keeps the latest value of every register its consumers
//! care about.
//!
//! ## Features
//!
//! - Encode register requests and decode register responses, including byte
//!   stuffing and the CRC-16 checksum
//! - Scale raw mantissa/exponent values into measurements with units
//! - Register catalogues for the 403 and 382 models, packed date registers
//!   and the derived gas value
//! - Reference-counted register subscriptions and batched, fault-isolated
//!   polling with exponential backoff
//! - Logging through the `log` facade and JSON configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kamstrup_rs::{MeterConfig, MeterCoordinator, RegisterKey, SerialTransport};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), kamstrup_rs::KamstrupError> {
//! let config = MeterConfig::default();
//! let transport = SerialTransport::new(config.serial_config());
//! let coordinator = Arc::new(MeterCoordinator::new(
//!     config.coordinator_config(),
//!     config.model,
//!     transport,
//! ));
//! coordinator.attach(RegisterKey(60));
//! coordinator.on_update(|cache| println!("{:?}", cache.value(RegisterKey(60))));
//! let task = coordinator.spawn();
//! // ...
//! coordinator.stop();
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod kmp;
pub mod logging;
pub mod payload;
pub mod util;

pub use crate::config::MeterConfig;
pub use crate::error::{
    ConfigError, DateDecodeError, DecodeError, EncodeError, KamstrupError, RegistryError,
    TransportError,
};
pub use crate::logging::{init_logger, log_info};

// Protocol
pub use kmp::{
    decode_response, encode_request, exchange, DecodedResponse, SerialConfig, SerialTransport,
    Transport,
};

// Registers and values
pub use payload::derived::heat_energy_to_gas;
pub use payload::{
    decode_packed_date, Measurement, MeterModel, RawSample, RegisterInfo, RegisterKey,
    ResultsCache,
};

// Polling
pub use coordinator::{CommandRegistry, CoordinatorConfig, CoordinatorState, MeterCoordinator, PollCycle};

use crate::constants::KMP_MAX_REGISTERS_PER_REQUEST;
use std::time::Duration;

/// Reads a set of registers once, without a coordinator.
///
/// Opens the transport if needed and splits `keys` into as many requests as
/// the protocol requires. Unlike polling, the first failing request aborts
/// the read.
///
/// # Arguments
/// * `transport` - Link to the meter
/// * `keys` - Registers to read, in any order
/// * `timeout` - Time allowed for each request/response exchange
///
/// # Returns
/// * `Ok(Vec<Measurement>)` - One measurement per register the meter answered
/// * `Err(KamstrupError)` - The link failed or a response was malformed
pub async fn read_registers<T: Transport + ?Sized>(
    transport: &mut T,
    keys: &[RegisterKey],
    timeout: Duration,
) -> Result<Vec<Measurement>, KamstrupError> {
    if keys.is_empty() {
        return Err(EncodeError::Empty.into());
    }
    if !transport.is_open() {
        transport.open().await?;
    }

    let mut measurements = Vec::with_capacity(keys.len());
    for batch in keys.chunks(KMP_MAX_REGISTERS_PER_REQUEST) {
        let response = exchange(&mut *transport, batch, timeout).await?;
        for warning in &response.warnings {
            log::warn!("{warning}");
        }
        measurements.extend(response.measurements());
    }
    Ok(measurements)
}
