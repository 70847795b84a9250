//! Batching of classified events into timed notifications.
//!
//! [`BatchQueue`] holds one open batch per `(priority, destination)` and
//! decides when each is due. [`BatchScheduler`] wraps it in a single tokio
//! task fed through an `mpsc` channel, so appends and flushes never overlap.
//! Finished batches go to the [`Dispatcher`] on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchReceipt, Dispatcher};
use crate::error::{Result, WatchError};
use crate::types::{AlertBatch, ClassifiedEvent, Destination, Priority};

/// How a batch deadline reacts to new arrivals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPolicy {
    /// The deadline is set when the first event arrives and never moves.
    #[default]
    Fixed,
    /// Every arrival pushes the deadline out, up to the lifetime cap.
    ///
    /// Trades flush latency for fewer, larger batches: a steady trickle
    /// holds a batch open until `max_batch_lifetime`.
    Sliding,
}

/// Timing and sizing of the batching scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Window for warning batches.
    pub warning_window: Duration,
    /// Window for info batches.
    pub info_window: Duration,
    /// No batch stays open longer than this.
    pub max_batch_lifetime: Duration,
    /// A batch reaching this many events is flushed at once.
    pub max_batch_events: usize,
    /// How often due batches are looked for.
    pub sweep_interval: Duration,
    /// Deadline policy.
    pub window_policy: WindowPolicy,
    /// Capacity of the command channel.
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warning_window: Duration::from_secs(15),
            info_window: Duration::from_secs(5),
            max_batch_lifetime: Duration::from_secs(60),
            max_batch_events: 100,
            sweep_interval: Duration::from_secs(1),
            window_policy: WindowPolicy::Fixed,
            channel_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Returns the batch window for a priority, capped at the batch lifetime.
    ///
    /// Critical events are never batched.
    #[must_use]
    pub fn window(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Critical => Duration::ZERO,
            Priority::Warning => self.warning_window.min(self.max_batch_lifetime),
            Priority::Info => self.info_window.min(self.max_batch_lifetime),
        }
    }
}

#[derive(Debug)]
struct OpenBatch {
    events: Vec<ClassifiedEvent>,
    opened_at: Instant,
    opened_at_wall: DateTime<Utc>,
    deadline: Instant,
}

type BatchKey = (Priority, Destination);

/// Open batches keyed by `(priority, destination)`.
///
/// Purely synchronous; the caller supplies the clock.
#[derive(Debug)]
pub struct BatchQueue {
    config: SchedulerConfig,
    open: BTreeMap<BatchKey, OpenBatch>,
}

impl BatchQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            open: BTreeMap::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Adds an event for `destination`.
    ///
    /// Returns a batch that must be dispatched right away: a single-event
    /// batch for critical events, or a batch that just reached
    /// `max_batch_events`.
    pub fn enqueue(
        &mut self,
        event: ClassifiedEvent,
        destination: Destination,
        now: Instant,
    ) -> Option<AlertBatch> {
        let priority = event.priority;
        if priority == Priority::Critical {
            let at = Utc::now();
            return Some(AlertBatch {
                id: Uuid::new_v4(),
                priority,
                destination,
                events: vec![event],
                window_opened_at: at,
                window_closed_at: at,
            });
        }

        let window = self.config.window(priority);
        let key = (priority, destination);
        let batch = self.open.entry(key.clone()).or_insert_with(|| {
            debug!(priority = %priority, destination = %key.1, "opened batch");
            OpenBatch {
                events: Vec::new(),
                opened_at: now,
                opened_at_wall: Utc::now(),
                deadline: now + window,
            }
        });

        batch.events.push(event);
        if self.config.window_policy == WindowPolicy::Sliding {
            batch.deadline = (now + window).min(batch.opened_at + self.config.max_batch_lifetime);
        }

        if batch.events.len() >= self.config.max_batch_events {
            debug!(priority = %priority, destination = %key.1, "batch full, flushing early");
            return self.close(&key);
        }
        None
    }

    /// Removes and returns every batch whose deadline has passed.
    pub fn due(&mut self, now: Instant) -> Vec<AlertBatch> {
        let keys: Vec<BatchKey> = self
            .open
            .iter()
            .filter(|(_, batch)| batch.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        keys.iter().filter_map(|key| self.close(key)).collect()
    }

    /// Removes and returns every open batch.
    pub fn drain(&mut self) -> Vec<AlertBatch> {
        let keys: Vec<BatchKey> = self.open.keys().cloned().collect();
        keys.iter().filter_map(|key| self.close(key)).collect()
    }

    /// Returns the earliest deadline among open batches.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.values().map(|batch| batch.deadline).min()
    }

    /// Returns the number of open batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Returns true if no batch is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Returns the number of events waiting in open batches.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.open.values().map(|batch| batch.events.len()).sum()
    }

    fn close(&mut self, key: &BatchKey) -> Option<AlertBatch> {
        let batch = self.open.remove(key)?;
        Some(AlertBatch {
            id: Uuid::new_v4(),
            priority: key.0,
            destination: key.1.clone(),
            events: batch.events,
            window_opened_at: batch.opened_at_wall,
            window_closed_at: Utc::now(),
        })
    }
}

/// Counters reported by the scheduler task when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Batches the dispatcher accepted.
    pub batches_dispatched: u64,
    /// Events in those batches.
    pub events_dispatched: u64,
    /// Batches the dispatcher rejected or panicked on.
    pub dispatch_failures: u64,
}

enum Command {
    Enqueue {
        event: ClassifiedEvent,
        destination: Destination,
    },
    Flush {
        done: oneshot::Sender<usize>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`BatchScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Queues an event for `destination`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::SchedulerClosed` if the scheduler has stopped.
    pub async fn enqueue(&self, event: ClassifiedEvent, destination: Destination) -> Result<()> {
        self.tx
            .send(Command::Enqueue { event, destination })
            .await
            .map_err(|_| WatchError::SchedulerClosed)
    }

    /// Flushes every open batch now and returns how many were flushed.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::SchedulerClosed` if the scheduler has stopped.
    pub async fn flush_now(&self) -> Result<usize> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { done })
            .await
            .map_err(|_| WatchError::SchedulerClosed)?;
        rx.await.map_err(|_| WatchError::SchedulerClosed)
    }

    /// Flushes every open batch, waits for in-flight dispatches, and stops
    /// the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::SchedulerClosed` if the scheduler had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { done })
            .await
            .map_err(|_| WatchError::SchedulerClosed)?;
        rx.await.map_err(|_| WatchError::SchedulerClosed)
    }

    /// Returns true once the scheduler has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type DispatchOutcome = (AlertBatch, Result<DispatchReceipt>);

/// The scheduler task.
pub struct BatchScheduler {
    queue: BatchQueue,
    dispatcher: Arc<dyn Dispatcher>,
    in_flight: JoinSet<DispatchOutcome>,
    stats: SchedulerStats,
    rx: mpsc::Receiver<Command>,
}

impl BatchScheduler {
    /// Starts the scheduler on the current runtime.
    ///
    /// The returned join handle yields the final counters once the scheduler
    /// has shut down.
    pub fn spawn(
        config: SchedulerConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> (SchedulerHandle, JoinHandle<SchedulerStats>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let scheduler = Self {
            queue: BatchQueue::new(config),
            dispatcher,
            in_flight: JoinSet::new(),
            stats: SchedulerStats::default(),
            rx,
        };
        let task = tokio::spawn(scheduler.run());
        (SchedulerHandle { tx }, task)
    }

    async fn run(mut self) -> SchedulerStats {
        let mut sweep = tokio::time::interval(self.queue.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            dispatcher = %self.dispatcher.name(),
            warning_window_secs = self.queue.config().warning_window.as_secs(),
            info_window_secs = self.queue.config().info_window.as_secs(),
            "batch scheduler started"
        );

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Enqueue { event, destination }) => {
                        if let Some(batch) = self.queue.enqueue(event, destination, Instant::now()) {
                            self.dispatch(batch);
                        }
                    }
                    Some(Command::Flush { done }) => {
                        let batches = self.queue.drain();
                        let count = batches.len();
                        for batch in batches {
                            self.dispatch(batch);
                        }
                        let _ = done.send(count);
                    }
                    Some(Command::Shutdown { done }) => {
                        self.finish().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("all scheduler handles dropped");
                        self.finish().await;
                        break;
                    }
                },
                _ = sweep.tick() => {
                    for batch in self.queue.due(Instant::now()) {
                        self.dispatch(batch);
                    }
                }
            }

            while let Some(outcome) = self.in_flight.try_join_next() {
                self.record(outcome);
            }
        }

        info!(
            batches = self.stats.batches_dispatched,
            events = self.stats.events_dispatched,
            failures = self.stats.dispatch_failures,
            "batch scheduler stopped"
        );
        self.stats
    }

    fn dispatch(&mut self, batch: AlertBatch) {
        debug!(
            batch = %batch.id,
            priority = %batch.priority,
            destination = %batch.destination,
            events = batch.len(),
            "flushing batch"
        );
        let dispatcher = Arc::clone(&self.dispatcher);
        self.in_flight.spawn_blocking(move || {
            let result = dispatcher.dispatch(&batch);
            (batch, result)
        });
    }

    async fn finish(&mut self) {
        let batches = self.queue.drain();
        if !batches.is_empty() {
            info!(batches = batches.len(), "flushing open batches before shutdown");
        }
        for batch in batches {
            self.dispatch(batch);
        }
        while let Some(outcome) = self.in_flight.join_next().await {
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: std::result::Result<DispatchOutcome, JoinError>) {
        match outcome {
            Ok((batch, Ok(receipt))) => {
                self.stats.batches_dispatched += 1;
                self.stats.events_dispatched += batch.len() as u64;
                info!(
                    batch = %batch.id,
                    priority = %batch.priority,
                    destination = %batch.destination,
                    events = batch.len(),
                    dispatcher = %receipt.dispatcher,
                    "batch dispatched"
                );
            }
            Ok((batch, Err(e))) => {
                self.stats.dispatch_failures += 1;
                warn!(
                    batch = %batch.id,
                    destination = %batch.destination,
                    events = batch.len(),
                    error = %e,
                    "dispatch failed, batch dropped"
                );
            }
            Err(e) => {
                self.stats.dispatch_failures += 1;
                error!(error = %e, "dispatch task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingDispatcher;
    use crate::types::{Category, Instance, RawChangeEvent};

    fn event(name: &str, priority: Priority) -> ClassifiedEvent {
        let instance = Instance::new("default", name, Utc::now());
        ClassifiedEvent::new(
            priority,
            Category::IndividualChange,
            format!("default/{name} disappeared"),
            vec![RawChangeEvent::Disappeared {
                last_known: instance,
            }],
            Utc::now(),
        )
    }

    fn oncall() -> Destination {
        Destination::new("oncall")
    }

    mod queue_tests {
        use super::*;

        #[test]
        fn window_per_priority() {
            let config = SchedulerConfig::default();
            assert_eq!(config.window(Priority::Critical), Duration::ZERO);
            assert_eq!(config.window(Priority::Warning), Duration::from_secs(15));
            assert_eq!(config.window(Priority::Info), Duration::from_secs(5));

            let capped = SchedulerConfig {
                max_batch_lifetime: Duration::from_secs(10),
                ..SchedulerConfig::default()
            };
            assert_eq!(capped.window(Priority::Warning), Duration::from_secs(10));
        }

        #[test]
        fn critical_is_immediate() {
            let mut queue = BatchQueue::new(SchedulerConfig::default());
            let batch = queue.enqueue(event("a", Priority::Critical), oncall(), Instant::now());

            let batch = batch.unwrap();
            assert_eq!(batch.priority, Priority::Critical);
            assert_eq!(batch.len(), 1);
            assert!(queue.is_empty());
        }

        #[test]
        fn fixed_window() {
            let mut queue = BatchQueue::new(SchedulerConfig::default());
            let t0 = Instant::now();

            assert!(queue.enqueue(event("a", Priority::Warning), oncall(), t0).is_none());
            assert!(
                queue
                    .enqueue(event("b", Priority::Warning), oncall(), t0 + Duration::from_secs(10))
                    .is_none()
            );

            assert!(queue.due(t0 + Duration::from_millis(14_900)).is_empty());
            let flushed = queue.due(t0 + Duration::from_secs(15));

            assert_eq!(flushed.len(), 1);
            let names: Vec<_> = flushed[0].events.iter().map(|e| e.keys()[0].name().to_string()).collect();
            assert_eq!(names, vec!["a", "b"]);
            assert!(queue.is_empty());
        }

        #[test]
        fn sliding_window_is_capped() {
            let mut queue = BatchQueue::new(SchedulerConfig {
                window_policy: WindowPolicy::Sliding,
                max_batch_lifetime: Duration::from_secs(20),
                ..SchedulerConfig::default()
            });
            let t0 = Instant::now();

            queue.enqueue(event("a", Priority::Warning), oncall(), t0);
            queue.enqueue(event("b", Priority::Warning), oncall(), t0 + Duration::from_secs(10));
            assert_eq!(queue.next_deadline(), Some(t0 + Duration::from_secs(20)));

            assert!(queue.due(t0 + Duration::from_secs(15)).is_empty());
            assert_eq!(queue.due(t0 + Duration::from_secs(20)).len(), 1);
        }

        #[test]
        fn batches_are_per_priority_and_destination() {
            let mut queue = BatchQueue::new(SchedulerConfig::default());
            let t0 = Instant::now();

            queue.enqueue(event("a", Priority::Warning), oncall(), t0);
            queue.enqueue(event("b", Priority::Info), oncall(), t0);
            queue.enqueue(event("c", Priority::Warning), Destination::new("team"), t0);
            assert_eq!(queue.len(), 3);
            assert_eq!(queue.pending_events(), 3);

            let info_due = queue.due(t0 + Duration::from_secs(5));
            assert_eq!(info_due.len(), 1);
            assert_eq!(info_due[0].priority, Priority::Info);

            assert_eq!(queue.drain().len(), 2);
        }

        #[test]
        fn full_batch_flushes_early() {
            let mut queue = BatchQueue::new(SchedulerConfig {
                max_batch_events: 3,
                ..SchedulerConfig::default()
            });
            let t0 = Instant::now();

            assert!(queue.enqueue(event("a", Priority::Info), oncall(), t0).is_none());
            assert!(queue.enqueue(event("b", Priority::Info), oncall(), t0).is_none());
            let full = queue.enqueue(event("c", Priority::Info), oncall(), t0).unwrap();

            assert_eq!(full.len(), 3);
            assert!(queue.is_empty());
        }
    }

    mod actor_tests {
        use super::*;

        fn fast_config() -> SchedulerConfig {
            SchedulerConfig {
                warning_window: Duration::from_millis(80),
                info_window: Duration::from_millis(40),
                sweep_interval: Duration::from_millis(10),
                ..SchedulerConfig::default()
            }
        }

        async fn wait_for(recorder: &RecordingDispatcher, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while recorder.len() < count && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        #[tokio::test]
        async fn critical_dispatched_promptly() {
            let recorder = Arc::new(RecordingDispatcher::new());
            let (handle, _task) = BatchScheduler::spawn(SchedulerConfig::default(), recorder.clone());

            handle.enqueue(event("a", Priority::Critical), oncall()).await.unwrap();
            wait_for(&recorder, 1).await;

            assert_eq!(recorder.len(), 1);
            assert_eq!(recorder.batches()[0].priority, Priority::Critical);
        }

        #[tokio::test]
        async fn warning_flushed_after_window() {
            let recorder = Arc::new(RecordingDispatcher::new());
            let (handle, _task) = BatchScheduler::spawn(fast_config(), recorder.clone());

            handle.enqueue(event("a", Priority::Warning), oncall()).await.unwrap();
            handle.enqueue(event("b", Priority::Warning), oncall()).await.unwrap();
            assert!(recorder.is_empty());

            wait_for(&recorder, 1).await;
            let batches = recorder.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 2);
        }

        #[tokio::test]
        async fn flush_now_forces_open_batches() {
            let recorder = Arc::new(RecordingDispatcher::new());
            let (handle, _task) = BatchScheduler::spawn(SchedulerConfig::default(), recorder.clone());

            handle.enqueue(event("a", Priority::Warning), oncall()).await.unwrap();
            handle.enqueue(event("b", Priority::Info), oncall()).await.unwrap();

            assert_eq!(handle.flush_now().await.unwrap(), 2);
            wait_for(&recorder, 2).await;
            assert_eq!(recorder.len(), 2);
        }

        #[tokio::test]
        async fn shutdown_flushes_and_reports() {
            let recorder = Arc::new(RecordingDispatcher::new());
            let (handle, task) = BatchScheduler::spawn(SchedulerConfig::default(), recorder.clone());

            handle.enqueue(event("a", Priority::Warning), oncall()).await.unwrap();
            handle.enqueue(event("b", Priority::Warning), oncall()).await.unwrap();
            handle.shutdown().await.unwrap();

            assert_eq!(recorder.len(), 1);
            let stats = task.await.unwrap();
            assert_eq!(stats.batches_dispatched, 1);
            assert_eq!(stats.events_dispatched, 2);
            assert!(handle.is_closed());
            assert!(matches!(
                handle.enqueue(event("c", Priority::Info), oncall()).await,
                Err(WatchError::SchedulerClosed)
            ));
        }

        #[tokio::test]
        async fn failed_dispatch_is_counted_not_retried() {
            let recorder = Arc::new(RecordingDispatcher::new());
            recorder.set_failing(true);
            let (handle, task) = BatchScheduler::spawn(SchedulerConfig::default(), recorder.clone());

            handle.enqueue(event("a", Priority::Critical), oncall()).await.unwrap();
            handle.shutdown().await.unwrap();

            let stats = task.await.unwrap();
            assert_eq!(stats.dispatch_failures, 1);
            assert_eq!(stats.batches_dispatched, 0);
            assert!(recorder.is_empty());
        }
    }
}
