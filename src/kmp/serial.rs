//! # KMP Serial Communication
//!
//! This module provides the transport abstraction the coordinator talks
//! through, and its implementation on top of a real serial port (usually an
//! optical eye on a USB serial adapter).

use crate::constants::{DEFAULT_BAUDRATE, KMP_START_RESPONSE, KMP_STOP};
use crate::error::{KamstrupError, TransportError};
use crate::kmp::frame::{decode_response, encode_request, DecodedResponse};
use crate::payload::RegisterKey;
use crate::util::logging::log_frame_hex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;

/// A byte-oriented, half-duplex link to one meter.
///
/// Implementations own their device handle. `open` is called again by the
/// coordinator after any failure, so it must be cheap to retry.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Opens the link. Opening an already open link is a no-op.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Writes a complete frame.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads up to and including `terminator`, failing with
    /// [`TransportError::Timeout`] if it does not arrive in time.
    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Closes the link. The next `open` reopens it.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Drops any bytes received but not yet read, e.g. a late answer to a
    /// request that already timed out.
    async fn discard_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Configuration for serial connection.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    pub stop_bits: tokio_serial::StopBits,
    /// Driver-level timeout for blocking operations.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: DEFAULT_BAUDRATE,
            stop_bits: tokio_serial::StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Serial port transport backed by `tokio_serial`.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<tokio_serial::SerialStream>,
    /// Bytes read past the last terminator.
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        SerialTransport {
            config,
            port: None,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = tokio_serial::new(&self.config.port, self.config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(self.config.stop_bits)
            .parity(tokio_serial::Parity::None)
            .timeout(self.config.timeout)
            .open_native_async()
            .map_err(|e| TransportError::Open(format!("{}: {e}", self.config.port)))?;

        log::info!(
            "Opened {} at {} baud",
            self.config.port,
            self.config.baudrate
        );
        self.pending.clear();
        self.port = Some(port);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        log_frame_hex("TX", bytes);
        port.write_all(bytes)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        port.flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == terminator) {
                let rest = self.pending.split_off(pos + 1);
                let frame = std::mem::replace(&mut self.pending, rest);
                log_frame_hex("RX", &frame);
                return Ok(frame);
            }

            let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
            let n = timeout_at(deadline, port.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(timeout))
                .and_then(|res| res.map_err(|e| TransportError::Read(e.to_string())))?;
            if n == 0 {
                return Err(TransportError::Read("port closed".into()));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn close(&mut self) {
        // SerialStream has no close method; dropping it closes the port
        if self.port.take().is_some() {
            log::info!("Closed {}", self.config.port);
        }
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        if let Some(port) = self.port.as_ref() {
            tokio_serial::SerialPort::clear(port, tokio_serial::ClearBuffer::Input)
                .map_err(|e| TransportError::Read(e.to_string()))?;
        }
        Ok(())
    }
}

/// Sends one register request and waits for the meter's answer.
///
/// Stale input is dropped before writing. Frames that do not contain the
/// response start byte, such as the echo of an optical head, are skipped
/// until `timeout` runs out.
pub async fn exchange<T: Transport + ?Sized>(
    transport: &mut T,
    keys: &[RegisterKey],
    timeout: Duration,
) -> Result<DecodedResponse, KamstrupError> {
    let request = encode_request(keys)?;
    transport.discard_input().await?;
    transport.write(&request).await?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(timeout).into());
        }

        let bytes = transport.read_until(KMP_STOP, remaining).await?;
        match bytes.iter().position(|&b| b == KMP_START_RESPONSE) {
            Some(start) => return Ok(decode_response(&bytes[start..])?),
            None => log::debug!("Skipping {} bytes before response", bytes.len()),
        }
    }
}
