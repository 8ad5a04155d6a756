//! Mock transport and meter simulator for testing
//!
//! This module provides an in-memory [`Transport`] that can either replay
//! scripted bytes or answer requests through a [`SimulatedMeter`], so the
//! codec and the coordinator can be exercised without hardware.

use crate::error::TransportError;
use crate::kmp::frame::{decode_request, encode_response};
use crate::kmp::serial::Transport;
use crate::payload::{RawSample, RegisterKey};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A meter answering register requests from a table of raw samples.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMeter {
    registers: BTreeMap<RegisterKey, RawSample>,
    /// A request naming any of these keys gets no answer.
    silent: BTreeSet<RegisterKey>,
    /// A request naming any of these keys gets an answer with a broken CRC.
    corrupt: BTreeSet<RegisterKey>,
}

impl SimulatedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value a register reports.
    pub fn set_register(&mut self, sample: RawSample) {
        self.registers.insert(sample.key, sample);
    }

    /// Convenience wrapper around [`SimulatedMeter::set_register`].
    pub fn with_register(mut self, id: u16, unit_code: u8, mantissa: i64, exponent: i8) -> Self {
        self.set_register(RawSample {
            key: RegisterKey(id),
            unit_code,
            mantissa,
            exponent,
        });
        self
    }

    pub fn silence(&mut self, key: RegisterKey) {
        self.silent.insert(key);
    }

    pub fn unsilence(&mut self, key: RegisterKey) {
        self.silent.remove(&key);
    }

    pub fn corrupt(&mut self, key: RegisterKey) {
        self.corrupt.insert(key);
    }

    /// Produces the meter's answer to a request frame, if any. Registers the
    /// meter does not know are left out of the answer.
    pub fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        let keys = decode_request(request).ok()?;
        if keys.iter().any(|key| self.silent.contains(key)) {
            return None;
        }

        let samples: Vec<RawSample> = keys
            .iter()
            .filter_map(|key| self.registers.get(key).copied())
            .collect();
        let mut response = encode_response(&samples);

        if keys.iter().any(|key| self.corrupt.contains(key)) {
            // Header bytes 0x3F 0x10 are never stuffed; break the address
            response[1] ^= 0x01;
        }
        Some(response)
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Frames written to the transport (outgoing)
    tx_frames: Vec<Vec<u8>>,
    /// Bytes waiting to be read (incoming)
    rx_buffer: VecDeque<u8>,
    open: bool,
    opens: usize,
    reads: usize,
    /// Number of upcoming `open` calls that fail
    open_failures: usize,
    fail_writes: bool,
    /// Echo every written frame before the answer, like an optical head
    echo: bool,
}

/// In-memory transport. Clones share state, so a test can keep one clone
/// while the coordinator owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    meter: Option<Arc<Mutex<SimulatedMeter>>>,
}

impl MockTransport {
    /// A transport that only returns scripted bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport wired to a simulated meter.
    pub fn with_meter(meter: SimulatedMeter) -> Self {
        MockTransport {
            state: Arc::default(),
            meter: Some(Arc::new(Mutex::new(meter))),
        }
    }

    /// Runs `f` against the simulated meter, e.g. to change a value.
    pub fn with_meter_mut<R>(&self, f: impl FnOnce(&mut SimulatedMeter) -> R) -> Option<R> {
        self.meter.as_ref().map(|meter| f(&mut lock(meter)))
    }

    /// Queue data to be read from the transport
    pub fn queue_rx_data(&self, data: &[u8]) {
        lock(&self.state).rx_buffer.extend(data);
    }

    pub fn set_open_failures(&self, count: usize) {
        lock(&self.state).open_failures = count;
    }

    pub fn set_write_failure(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn set_echo(&self, echo: bool) {
        lock(&self.state).echo = echo;
    }

    /// Frames written so far.
    pub fn tx_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.state).tx_frames.clone()
    }

    /// Register keys requested so far, one entry per request.
    pub fn requested_batches(&self) -> Vec<Vec<RegisterKey>> {
        self.tx_frames()
            .iter()
            .filter_map(|frame| decode_request(frame).ok())
            .collect()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).tx_frames.len()
    }

    pub fn read_count(&self) -> usize {
        lock(&self.state).reads
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.opens += 1;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(TransportError::Open("simulated open failure".into()));
        }
        state.open = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let response = self
            .meter
            .as_ref()
            .and_then(|meter| lock(meter).respond(bytes));

        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.fail_writes {
            return Err(TransportError::Write("simulated write failure".into()));
        }
        state.tx_frames.push(bytes.to_vec());
        if state.echo {
            state.rx_buffer.extend(bytes);
        }
        if let Some(response) = response {
            state.rx_buffer.extend(response);
        }
        Ok(())
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.reads += 1;

        match state.rx_buffer.iter().position(|&b| b == terminator) {
            Some(pos) => Ok(state.rx_buffer.drain(..=pos).collect()),
            None => {
                // Nothing complete will ever arrive: report the timeout at once
                state.rx_buffer.clear();
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn close(&mut self) {
        let mut state = lock(&self.state);
        state.open = false;
        state.rx_buffer.clear();
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    async fn discard_input(&mut self) -> Result<(), TransportError> {
        lock(&self.state).rx_buffer.clear();
        Ok(())
    }
}
