//! # Meter Polling Coordinator
//!
//! This module provides [`MeterCoordinator`], which owns the link to one
//! meter, polls every attached register on a fixed interval and publishes
//! the latest decoded values.
//!
//! Each poll splits the attached registers into batches of at most eight
//! (the KMP per-request limit) and exchanges them one after another. A batch
//! that times out or fails to decode only fails its own registers; their
//! last known values stay in the cache. When every batch of several polls in
//! a row fails, the poll interval backs off exponentially.

use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_BACKOFF_SECS, DEFAULT_SCAN_INTERVAL_SECS,
    DEFAULT_TIMEOUT_SECS, KMP_MAX_REGISTERS_PER_REQUEST,
};
use crate::coordinator::backoff::{Backoff, BackoffPolicy};
use crate::coordinator::registry::CommandRegistry;
use crate::error::{KamstrupError, RegistryError, TransportError};
use crate::kmp::frame::DecodedResponse;
use crate::kmp::serial::{exchange, Transport};
use crate::payload::{Measurement, MeterModel, RegisterKey, ResultsCache};
use crate::util::logging::ThrottleManager;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Callback fired after a poll that changed at least one value.
pub type UpdateCallback = Arc<dyn Fn(&ResultsCache) + Send + Sync>;

/// Immutable scheduling parameters of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Delay between polls.
    pub interval: Duration,
    /// Time allowed for one request/response exchange.
    pub timeout: Duration,
    /// Consecutive fully-failed polls before backing off.
    pub failure_threshold: u32,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

/// Represents the different states of a poll.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CoordinatorState {
    Idle,
    BuildingBatches,
    Exchanging,
    Merging,
    /// Too many polls in a row failed completely; the next poll is delayed.
    ErrorBackoff,
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCycle {
    pub requested: BTreeSet<RegisterKey>,
    pub succeeded: BTreeSet<RegisterKey>,
    pub failed: BTreeSet<RegisterKey>,
    /// Number of request frames the poll was split into.
    pub batches: usize,
    pub failed_batches: usize,
    /// Whether any cached value changed.
    pub changed: bool,
}

impl PollCycle {
    /// No registers were attached, so nothing was sent.
    pub fn is_idle(&self) -> bool {
        self.requested.is_empty()
    }

    /// Every batch of the poll failed.
    pub fn is_total_failure(&self) -> bool {
        self.batches > 0 && self.failed_batches == self.batches
    }

    fn fail_batch(&mut self, batch: &[RegisterKey]) {
        self.failed_batches += 1;
        self.failed.extend(batch.iter().copied());
    }
}

/// Splits registers into request-sized batches, keeping ascending order.
pub fn build_batches(keys: &BTreeSet<RegisterKey>) -> Vec<Vec<RegisterKey>> {
    let keys: Vec<RegisterKey> = keys.iter().copied().collect();
    keys.chunks(KMP_MAX_REGISTERS_PER_REQUEST)
        .map(<[RegisterKey]>::to_vec)
        .collect()
}

/// Whether an exchange error means the link itself is gone.
fn is_link_failure(error: &KamstrupError) -> bool {
    matches!(
        error,
        KamstrupError::Transport(
            TransportError::Open(_)
                | TransportError::Write(_)
                | TransportError::Read(_)
                | TransportError::NotOpen
        )
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls one meter and keeps the latest value of every attached register.
pub struct MeterCoordinator<T: Transport> {
    config: CoordinatorConfig,
    model: MeterModel,
    registry: CommandRegistry,
    /// Held for a whole poll, so exchanges and cache updates never interleave.
    transport: tokio::sync::Mutex<T>,
    results: watch::Sender<Arc<ResultsCache>>,
    listeners: Mutex<Vec<UpdateCallback>>,
    backoff: Mutex<Backoff>,
    state: Mutex<CoordinatorState>,
    shutdown: watch::Sender<bool>,
    failure_log: Mutex<ThrottleManager>,
}

impl<T: Transport> MeterCoordinator<T> {
    /// Creates a coordinator. The transport is opened on the first poll.
    pub fn new(config: CoordinatorConfig, model: MeterModel, transport: T) -> Self {
        let (results, _) = watch::channel(Arc::new(ResultsCache::new()));
        let (shutdown, _) = watch::channel(false);

        MeterCoordinator {
            config,
            model,
            registry: CommandRegistry::new(),
            transport: tokio::sync::Mutex::new(transport),
            results,
            listeners: Mutex::new(Vec::new()),
            backoff: Mutex::new(Backoff::new(BackoffPolicy {
                interval: config.interval,
                threshold: config.failure_threshold,
                max_delay: config.max_backoff,
            })),
            state: Mutex::new(CoordinatorState::Idle),
            shutdown,
            failure_log: Mutex::new(ThrottleManager::new(60_000, 5)),
        }
    }

    pub fn model(&self) -> MeterModel {
        self.model
    }

    /// Starts polling `key` on behalf of one consumer.
    pub fn attach(&self, key: RegisterKey) {
        if !self.model.is_known_register(key) {
            log::warn!(
                "Register {key} is not in the Kamstrup {} catalogue; polling it anyway",
                self.model
            );
        }
        self.registry.attach(key);
    }

    /// Stops polling `key` on behalf of one consumer.
    pub fn detach(&self, key: RegisterKey) -> Result<(), RegistryError> {
        self.registry.detach(key)
    }

    /// Snapshot of the latest values.
    pub fn latest(&self) -> Arc<ResultsCache> {
        Arc::clone(&self.results.borrow())
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ResultsCache>> {
        self.results.subscribe()
    }

    /// Registers a callback fired once after every poll that changed a value.
    ///
    /// Callbacks run on the polling task and may register further callbacks;
    /// those fire from the next update on.
    pub fn on_update(&self, callback: impl Fn(&ResultsCache) + Send + Sync + 'static) {
        lock(&self.listeners).push(Arc::new(callback));
    }

    pub fn state(&self) -> CoordinatorState {
        *lock(&self.state)
    }

    fn set_state(&self, state: CoordinatorState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::trace!("State changed: {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Delay before the next poll, including any backoff.
    pub fn next_delay(&self) -> Duration {
        lock(&self.backoff).next_delay()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.backoff).consecutive_failures()
    }

    /// Asks `run` to return after the exchange in flight, if any.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn warn_throttled(&self, category: &'static str, message: std::fmt::Arguments<'_>) {
        if lock(&self.failure_log).allow(category) {
            log::warn!("{message}");
        }
    }

    /// Runs one poll of every attached register.
    pub async fn poll_once(&self) -> PollCycle {
        let keys = self.registry.snapshot();
        if keys.is_empty() {
            log::trace!("No registers attached, skipping poll");
            return PollCycle::default();
        }

        let mut transport = self.transport.lock().await;

        self.set_state(CoordinatorState::BuildingBatches);
        let batches = build_batches(&keys);
        let mut cycle = PollCycle {
            requested: keys,
            batches: batches.len(),
            ..PollCycle::default()
        };
        let mut fresh: Vec<Measurement> = Vec::new();
        let mut interrupted = false;

        self.set_state(CoordinatorState::Exchanging);
        let opened = if transport.is_open() {
            Ok(())
        } else {
            transport.open().await
        };
        if let Err(e) = opened {
            self.warn_throttled("link", format_args!("Meter link unavailable: {e}"));
            for batch in &batches {
                cycle.fail_batch(batch);
            }
        } else {
            let mut pending = batches.iter();
            while let Some(batch) = pending.next() {
                if self.is_stopping() {
                    log::debug!("Stop requested, skipping remaining batches");
                    cycle.fail_batch(batch);
                    pending.by_ref().for_each(|batch| cycle.fail_batch(batch));
                    interrupted = true;
                    break;
                }

                match exchange(&mut *transport, batch, self.config.timeout).await {
                    Ok(response) => {
                        self.absorb(batch, response, &mut cycle, &mut fresh);
                    }
                    Err(e) if is_link_failure(&e) => {
                        self.warn_throttled("link", format_args!(
                            "Meter link failed during {batch:?}: {e}"
                        ));
                        transport.close().await;
                        cycle.fail_batch(batch);
                        pending.by_ref().for_each(|batch| cycle.fail_batch(batch));
                        break;
                    }
                    Err(e) => {
                        self.warn_throttled("batch", format_args!("Batch {batch:?} failed: {e}"));
                        cycle.fail_batch(batch);
                    }
                }
            }
        }

        self.set_state(CoordinatorState::Merging);
        cycle.changed = self.publish(fresh);

        // Batches skipped for shutdown say nothing about the meter
        if interrupted {
            self.set_state(CoordinatorState::Idle);
            return cycle;
        }

        let backing_off = {
            let mut backoff = lock(&self.backoff);
            if cycle.is_total_failure() {
                let streak = backoff.record_failure();
                if backoff.is_backing_off() {
                    log::warn!(
                        "{streak} consecutive polls failed, next attempt in {:?}",
                        backoff.next_delay()
                    );
                }
            } else {
                if backoff.consecutive_failures() > 0 {
                    log::info!(
                        "Meter answered again after {} failed polls",
                        backoff.consecutive_failures()
                    );
                    lock(&self.failure_log).reset_all();
                }
                backoff.record_success();
            }
            backoff.is_backing_off()
        };

        log::debug!(
            "Poll done: {} requested, {} succeeded, {} failed, changed={}",
            cycle.requested.len(),
            cycle.succeeded.len(),
            cycle.failed.len(),
            cycle.changed
        );

        self.set_state(if backing_off {
            CoordinatorState::ErrorBackoff
        } else {
            CoordinatorState::Idle
        });
        drop(transport);
        cycle
    }

    /// Sorts a decoded batch into succeeded and failed registers.
    fn absorb(
        &self,
        batch: &[RegisterKey],
        response: DecodedResponse,
        cycle: &mut PollCycle,
        fresh: &mut Vec<Measurement>,
    ) {
        for warning in &response.warnings {
            log::warn!("{warning}");
        }

        let mut answered = 0;
        for sample in &response.samples {
            if batch.contains(&sample.key) {
                if cycle.succeeded.insert(sample.key) {
                    answered += 1;
                }
                fresh.push(sample.to_measurement());
            } else {
                log::debug!("Ignoring unrequested register {}", sample.key);
            }
        }

        // A well-formed answer without any requested register is no answer
        if answered == 0 {
            self.warn_throttled(
                "batch",
                format_args!("Batch {batch:?} answered without any requested register"),
            );
            cycle.fail_batch(batch);
            return;
        }

        for key in batch {
            if !cycle.succeeded.contains(key) {
                log::debug!("Register {key} missing from response");
                cycle.failed.insert(*key);
            }
        }
    }

    /// Merges fresh values into a new snapshot and notifies subscribers if
    /// anything changed.
    fn publish(&self, fresh: Vec<Measurement>) -> bool {
        if fresh.is_empty() {
            return false;
        }

        let mut next = ResultsCache::clone(&self.results.borrow());
        let mut changed = false;
        for measurement in fresh {
            changed |= next.merge(measurement);
        }
        if !changed {
            return false;
        }

        let snapshot = Arc::new(next);
        self.results.send_replace(Arc::clone(&snapshot));
        let listeners: Vec<UpdateCallback> = lock(&self.listeners).iter().cloned().collect();
        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    /// Polls until [`MeterCoordinator::stop`] is called, then closes the
    /// transport. A poll in progress always completes first.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        log::info!(
            "Polling Kamstrup {} every {:?}",
            self.model,
            self.config.interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once().await;
            if *shutdown.borrow() {
                break;
            }

            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.transport.lock().await.close().await;
        self.set_state(CoordinatorState::Idle);
        log::info!("Polling stopped");
    }
}

impl<T: Transport + 'static> MeterCoordinator<T> {
    /// Runs the poll loop on a tokio task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmp::serial_mock::{MockTransport, SimulatedMeter};

    fn keys(ids: impl IntoIterator<Item = u16>) -> BTreeSet<RegisterKey> {
        ids.into_iter().map(RegisterKey).collect()
    }

    #[test]
    fn test_build_batches() {
        let batches = build_batches(&keys(1..=17));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 8);
        assert_eq!(batches[1].len(), 8);
        assert_eq!(batches[2], vec![RegisterKey(17)]);
        assert!(build_batches(&BTreeSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_poll_merges_values() {
        let meter = SimulatedMeter::new()
            .with_register(60, 2, 12345, 0)
            .with_register(86, 37, 5432, -2);
        let coordinator = MeterCoordinator::new(
            CoordinatorConfig::default(),
            MeterModel::Kamstrup403,
            MockTransport::with_meter(meter),
        );
        coordinator.attach(RegisterKey(60));
        coordinator.attach(RegisterKey(86));

        let cycle = coordinator.poll_once().await;
        assert_eq!(cycle.succeeded, keys([60, 86]));
        assert!(cycle.failed.is_empty());
        assert!(cycle.changed);

        let latest = coordinator.latest();
        assert_eq!(latest.value(RegisterKey(60)), Some(12345.0));
        assert_eq!(latest.value(RegisterKey(86)), Some(54.32));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_missing_register_fails_alone() {
        let meter = SimulatedMeter::new().with_register(60, 2, 1, 0);
        let coordinator = MeterCoordinator::new(
            CoordinatorConfig::default(),
            MeterModel::Kamstrup403,
            MockTransport::with_meter(meter),
        );
        coordinator.attach(RegisterKey(60));
        coordinator.attach(RegisterKey(68));

        let cycle = coordinator.poll_once().await;
        assert_eq!(cycle.succeeded, keys([60]));
        assert_eq!(cycle.failed, keys([68]));
        assert!(!cycle.is_total_failure());
        assert!(!coordinator.latest().contains(RegisterKey(68)));
    }

    #[tokio::test]
    async fn test_echo_is_skipped() {
        let meter = SimulatedMeter::new().with_register(60, 2, 7, 0);
        let transport = MockTransport::with_meter(meter);
        transport.set_echo(true);
        let coordinator =
            MeterCoordinator::new(CoordinatorConfig::default(), MeterModel::Kamstrup403, transport);
        coordinator.attach(RegisterKey(60));

        let cycle = coordinator.poll_once().await;
        assert_eq!(cycle.succeeded, keys([60]));
        assert_eq!(coordinator.latest().value(RegisterKey(60)), Some(7.0));
    }

    #[tokio::test]
    async fn test_stop_skips_remaining_batches() {
        let transport = MockTransport::with_meter(SimulatedMeter::new());
        let coordinator = MeterCoordinator::new(
            CoordinatorConfig::default(),
            MeterModel::Kamstrup403,
            transport.clone(),
        );
        for id in 1..=9 {
            coordinator.attach(RegisterKey(id));
        }
        coordinator.stop();

        let cycle = coordinator.poll_once().await;
        assert_eq!(cycle.failed.len(), 9);
        assert_eq!(transport.write_count(), 0);
        assert_eq!(coordinator.consecutive_failures(), 0);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_empty_answer_counts_as_failed_batch() {
        let coordinator = MeterCoordinator::new(
            CoordinatorConfig::default(),
            MeterModel::Kamstrup403,
            MockTransport::with_meter(SimulatedMeter::new()),
        );
        coordinator.attach(RegisterKey(60));

        let cycle = coordinator.poll_once().await;
        assert_eq!(cycle.failed, keys([60]));
        assert_eq!(cycle.failed_batches, 1);
        assert!(cycle.is_total_failure());
        assert_eq!(coordinator.consecutive_failures(), 1);
    }
}
