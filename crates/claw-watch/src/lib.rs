//! Pod fleet watching with deduplicated, batched alerting for Clawbernetes.
//!
//! `claw-watch` polls a fleet of pods, works out which changes are new and
//! worth telling someone about, and turns a stream of such decisions into a
//! few well-timed notifications instead of a flood of one-off messages.
//!
//! # Pipeline
//!
//! - **Observation**: an [`ObservationSource`] lists the current pods
//! - **Detection**: the [`ChangeDetector`] diffs them against the [`StateStore`]
//! - **Classification**: the [`EventClassifier`] assigns priority and category,
//!   consulting open down records and the [`CooldownLedger`]
//! - **Batching**: the [`BatchScheduler`] coalesces events per priority and
//!   destination and flushes them to a [`Dispatcher`]
//!
//! The [`Monitor`] wires these together and drives them on a fixed interval.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use claw_watch::{ChangeDetector, CooldownLedger, EventClassifier, Instance, Priority, StateStore};
//!
//! let mut store = StateStore::in_memory();
//! let detector = ChangeDetector::new();
//! let now = Utc::now();
//!
//! // The first observation only seeds the store.
//! let pods = vec![Instance::new("default", "api-0", now).with_owner("api")];
//! assert!(detector.detect(&mut store, pods, now).events.is_empty());
//!
//! // The pod is gone on the next poll.
//! let detection = detector.detect(&mut store, Vec::new(), now);
//! let alerts = EventClassifier::default().classify(
//!     detection.events,
//!     &detection.prior_down,
//!     &mut CooldownLedger::new(),
//!     now,
//! );
//!
//! assert_eq!(alerts.len(), 1);
//! assert_eq!(alerts[0].priority, Priority::Warning);
//! assert!(alerts[0].reason.contains("default/api-0 disappeared"));
//! ```

#![forbid(unsafe_code)]

pub mod classifier;
pub mod config;
pub mod cooldown;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod types;

pub use classifier::{ClassifierConfig, EventClassifier};
pub use config::{BatchWindows, MailConfig, Route, WatchConfig};
pub use cooldown::CooldownLedger;
pub use detector::{ChangeDetector, Detection};
pub use dispatch::{
    DispatchReceipt, Dispatcher, LogDispatcher, LogTransport, MailDispatcher, MailMessage,
    MailTransport, RecordingDispatcher,
};
pub use error::{Result, WatchError};
pub use monitor::{Monitor, MonitorHealth, ShutdownRx, ShutdownTx, TickReport};
pub use scheduler::{
    BatchQueue, BatchScheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, WindowPolicy,
};
pub use source::{FakeSource, FileSource, KubectlSource, ObservationSource};
pub use store::{Snapshot, StateStore};
pub use types::{
    AlertBatch, Category, ClassifiedEvent, Destination, DownRecord, HealthState, Instance,
    InstanceKey, InstanceRecord, Phase, Priority, RawChangeEvent, Workload,
};
