//! The poll-detect-classify-enqueue pipeline.
//!
//! A [`Monitor`] owns the state store, the cooldown ledger, the detector and
//! the classifier, plus a handle to the batching scheduler. One call to
//! [`Monitor::tick`] runs the whole pipeline once; [`Monitor::run`] drives it
//! on a fixed interval until shutdown.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::classifier::EventClassifier;
use crate::config::WatchConfig;
use crate::cooldown::CooldownLedger;
use crate::detector::ChangeDetector;
use crate::error::{Result, WatchError};
use crate::scheduler::SchedulerHandle;
use crate::source::ObservationSource;
use crate::store::StateStore;
use crate::types::{ClassifiedEvent, HealthState, Instance, InstanceRecord, Workload};

/// Shutdown signal receiver.
pub type ShutdownRx = tokio::sync::broadcast::Receiver<()>;

/// Shutdown signal sender.
pub type ShutdownTx = tokio::sync::broadcast::Sender<()>;

/// Health of the monitor itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MonitorHealth {
    /// Observations are succeeding.
    #[default]
    Healthy,
    /// Too many observations in a row failed.
    Degraded {
        /// Failures since the last successful observation.
        consecutive_failures: u32,
    },
}

impl MonitorHealth {
    /// Returns true when healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// True when the tick only seeded the store.
    pub seeded: bool,
    /// Valid instances observed.
    pub observed: usize,
    /// Records skipped as malformed or duplicate.
    pub skipped: usize,
    /// Down records expired before detection.
    pub expired: usize,
    /// Raw change events detected.
    pub raw_events: usize,
    /// Instances that finished successfully this tick.
    pub completed: usize,
    /// Alerts that passed classification.
    pub alerts: Vec<ClassifiedEvent>,
    /// Alerts that could not be handed to the scheduler.
    pub enqueue_failures: usize,
    /// Per-workload aggregate after the tick.
    pub workloads: Vec<Workload>,
}

/// Runs the watch pipeline against one observation source.
pub struct Monitor<S> {
    config: WatchConfig,
    source: S,
    store: StateStore,
    ledger: CooldownLedger,
    detector: ChangeDetector,
    classifier: EventClassifier,
    scheduler: SchedulerHandle,
    health: Arc<RwLock<MonitorHealth>>,
    consecutive_failures: u32,
}

impl<S: ObservationSource> Monitor<S> {
    /// Creates a monitor, opening state as configured.
    pub fn new(config: WatchConfig, source: S, scheduler: SchedulerHandle) -> Self {
        let store = config.state_store();
        let ledger = config.cooldown_ledger();
        Self::with_state(config, source, scheduler, store, ledger)
    }

    /// Creates a monitor around an existing store and ledger.
    pub fn with_state(
        config: WatchConfig,
        source: S,
        scheduler: SchedulerHandle,
        store: StateStore,
        ledger: CooldownLedger,
    ) -> Self {
        let classifier = EventClassifier::new(config.classifier_config());
        Self {
            config,
            source,
            store,
            ledger,
            detector: ChangeDetector::new(),
            classifier,
            scheduler,
            health: Arc::new(RwLock::new(MonitorHealth::Healthy)),
            consecutive_failures: 0,
        }
    }

    /// Returns the current health.
    #[must_use]
    pub fn health(&self) -> MonitorHealth {
        *self.health.read()
    }

    /// Returns a shared handle to the health flag.
    #[must_use]
    pub fn health_handle(&self) -> Arc<RwLock<MonitorHealth>> {
        Arc::clone(&self.health)
    }

    /// Returns the state store.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// Returns the cooldown ledger.
    #[must_use]
    pub const fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }

    /// Returns the observation source.
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Runs one tick now.
    ///
    /// # Errors
    ///
    /// Returns an observation error if the source failed or timed out; the
    /// store is left untouched in that case.
    pub async fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Runs one tick with `now` as the wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns an observation error if the source failed or timed out; the
    /// store is left untouched in that case.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let timeout = self.config.observe_timeout();
        let observed = tokio::time::timeout(timeout, self.source.observe()).await;
        let records = match observed {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => return Err(self.observation_failed(e)),
            Err(_) => {
                return Err(self.observation_failed(WatchError::ObservationTimeout {
                    secs: timeout.as_secs(),
                }));
            }
        };
        self.observation_succeeded();

        let total = records.len();
        let instances = validate_records(records, now);
        let mut report = TickReport {
            observed: instances.len(),
            skipped: total - instances.len(),
            ..TickReport::default()
        };

        report.expired = self
            .store
            .expire_down_records(now, self.config.down_record_expiry())
            .len();

        let detection = self.detector.detect(&mut self.store, instances, now);
        report.seeded = detection.seeded;
        report.raw_events = detection.events.len();
        report.completed = detection.completed;

        report.alerts = self.classifier.classify(
            detection.events,
            &detection.prior_down,
            &mut self.ledger,
            now,
        );

        for alert in &report.alerts {
            info!(
                priority = %alert.priority,
                category = %alert.category,
                owner = %alert.owner,
                reason = %alert.reason,
                "alert raised"
            );
            for destination in self.config.destinations_for(alert.priority) {
                if let Err(e) = self.scheduler.enqueue(alert.clone(), destination.clone()).await {
                    report.enqueue_failures += 1;
                    warn!(destination = %destination, error = %e, "failed to enqueue alert");
                }
            }
        }

        self.ledger.purge(now);
        self.store.persist();
        self.ledger.persist();

        report.workloads = Workload::aggregate(self.store.snapshot().values());
        let unhealthy = report
            .workloads
            .iter()
            .filter(|w| w.health != HealthState::Healthy)
            .count();

        debug!(
            source = %self.source.name(),
            observed = report.observed,
            skipped = report.skipped,
            expired = report.expired,
            raw_events = report.raw_events,
            completed = report.completed,
            alerts = report.alerts.len(),
            workloads = report.workloads.len(),
            unhealthy_workloads = unhealthy,
            seeded = report.seeded,
            "tick complete"
        );

        Ok(report)
    }

    /// Ticks on the poll interval until `shutdown` fires, then flushes the
    /// scheduler and persists state.
    ///
    /// A tick that overruns the interval makes the missed ticks be skipped.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for fatal startup checks.
    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<()> {
        let poll_interval = self.config.poll_interval();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = %self.source.name(),
            poll_interval_secs = poll_interval.as_secs(),
            seeded = self.store.is_seeded(),
            "monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(e) = self.tick().await {
                        debug!(error = %e, "tick aborted");
                    }
                    let elapsed = started.elapsed();
                    if elapsed > poll_interval {
                        info!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            poll_interval_secs = poll_interval.as_secs(),
                            "tick overran the poll interval, skipping missed ticks"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.store.persist();
        self.ledger.persist();
        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "scheduler already stopped");
        }
        info!("monitor stopped");
        Ok(())
    }

    fn observation_failed(&mut self, error: WatchError) -> WatchError {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            source = %self.source.name(),
            consecutive_failures = self.consecutive_failures,
            error = %error,
            "observation failed, tick aborted"
        );

        if self.consecutive_failures >= self.config.failure_threshold {
            let mut health = self.health.write();
            if health.is_healthy() {
                warn!(
                    consecutive_failures = self.consecutive_failures,
                    "monitor degraded"
                );
            }
            *health = MonitorHealth::Degraded {
                consecutive_failures: self.consecutive_failures,
            };
        }
        error
    }

    fn observation_succeeded(&mut self) {
        self.consecutive_failures = 0;
        let mut health = self.health.write();
        if !health.is_healthy() {
            info!("monitor healthy again");
            *health = MonitorHealth::Healthy;
        }
    }
}

/// Turns raw records into instances, skipping malformed ones and keeping the
/// first record of any duplicated key.
fn validate_records(records: Vec<InstanceRecord>, now: DateTime<Utc>) -> Vec<Instance> {
    let mut seen = HashSet::new();
    let mut instances = Vec::with_capacity(records.len());

    for record in records {
        match record.into_instance(now) {
            Ok(instance) => {
                if seen.insert(instance.key.clone()) {
                    instances.push(instance);
                } else {
                    warn!(key = %instance.key, "duplicate instance in observation, keeping the first");
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed record"),
        }
    }
    instances
}
