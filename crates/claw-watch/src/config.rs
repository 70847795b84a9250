//! Watcher configuration.
//!
//! Loaded once at startup from a JSON file. Every field has a default, so an
//! empty object `{}` is a valid configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierConfig;
use crate::cooldown::CooldownLedger;
use crate::error::{Result, WatchError};
use crate::scheduler::{SchedulerConfig, WindowPolicy};
use crate::store::StateStore;
use crate::types::{Category, Destination, Priority};

/// Upper bound for poll, timeout and batching durations (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Upper bound for cooldowns and down record expiry (one year).
pub const MAX_RETENTION_SECS: u64 = 365 * 86_400;

/// Batch windows per priority, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchWindows {
    /// Window for warning batches.
    pub warning: u64,
    /// Window for info batches.
    pub info: u64,
}

impl Default for BatchWindows {
    fn default() -> Self {
        Self {
            warning: 15,
            info: 5,
        }
    }
}

/// Sends classified events at or above `min_priority` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination name.
    pub destination: String,
    /// Lowest priority this route accepts.
    #[serde(default = "Route::default_min_priority")]
    pub min_priority: Priority,
}

impl Route {
    /// Creates a route.
    #[must_use]
    pub fn new(destination: impl Into<String>, min_priority: Priority) -> Self {
        Self {
            destination: destination.into(),
            min_priority,
        }
    }

    /// Returns true if an event of `priority` goes through this route.
    #[must_use]
    pub fn accepts(&self, priority: Priority) -> bool {
        priority >= self.min_priority
    }

    const fn default_min_priority() -> Priority {
        Priority::Info
    }
}

/// Mail delivery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailConfig {
    /// Sender address.
    pub from: String,
    /// Recipient addresses per destination name.
    #[serde(default)]
    pub recipients: HashMap<String, Vec<String>>,
}

/// Main watcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Seconds between two polls of the observation source.
    pub poll_interval_secs: u64,
    /// Failures in one owner per tick that make a mass failure.
    pub mass_threshold: usize,
    /// Minimum seconds between two restart alerts for one instance.
    pub restart_cooldown_secs: u64,
    /// Batch windows per priority.
    pub batch_window_secs: BatchWindows,
    /// Hard cap on how long a batch stays open.
    pub max_batch_lifetime_secs: u64,
    /// Seconds before an observation is abandoned.
    pub observe_timeout_secs: u64,
    /// Consecutive observation failures before health turns degraded.
    pub failure_threshold: u32,
    /// Seconds after which an unrecovered down record is dropped.
    pub down_record_expiry_secs: u64,
    /// Restart delta reported as a restart storm.
    pub restart_storm_threshold: u32,
    /// Events after which a batch is flushed early.
    pub max_batch_events: usize,
    /// Milliseconds between two batch sweeps.
    pub sweep_interval_millis: u64,
    /// Batch deadline policy.
    pub window_policy: WindowPolicy,
    /// Namespaces never alerted on.
    pub excluded_namespaces: Vec<String>,
    /// Owners never alerted on.
    pub excluded_owners: Vec<String>,
    /// Where classified events go.
    pub routes: Vec<Route>,
    /// Directory for persisted state; in-memory when absent.
    pub state_dir: Option<PathBuf>,
    /// Mail delivery; batches are only logged when absent.
    pub mail: Option<MailConfig>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            mass_threshold: 3,
            restart_cooldown_secs: 300,
            batch_window_secs: BatchWindows::default(),
            max_batch_lifetime_secs: 60,
            observe_timeout_secs: 10,
            failure_threshold: 3,
            down_record_expiry_secs: 86_400,
            restart_storm_threshold: 5,
            max_batch_events: 100,
            sweep_interval_millis: 1000,
            window_policy: WindowPolicy::Fixed,
            excluded_namespaces: Vec::new(),
            excluded_owners: Vec::new(),
            routes: vec![Route::new("default", Priority::Info)],
            state_dir: None,
            mail: None,
        }
    }
}

impl WatchConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WatchError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parses configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the values fail validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| WatchError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("observe_timeout_secs", self.observe_timeout_secs),
            ("batch_window_secs.warning", self.batch_window_secs.warning),
            ("batch_window_secs.info", self.batch_window_secs.info),
            ("max_batch_lifetime_secs", self.max_batch_lifetime_secs),
            ("down_record_expiry_secs", self.down_record_expiry_secs),
            ("sweep_interval_millis", self.sweep_interval_millis),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(WatchError::Config(format!("{field} must be greater than 0")));
            }
        }

        let bounded = [
            ("poll_interval_secs", self.poll_interval_secs, MAX_INTERVAL_SECS),
            ("observe_timeout_secs", self.observe_timeout_secs, MAX_INTERVAL_SECS),
            ("max_batch_lifetime_secs", self.max_batch_lifetime_secs, MAX_INTERVAL_SECS),
            ("sweep_interval_millis", self.sweep_interval_millis, MAX_INTERVAL_SECS * 1000),
            ("restart_cooldown_secs", self.restart_cooldown_secs, MAX_RETENTION_SECS),
            ("down_record_expiry_secs", self.down_record_expiry_secs, MAX_RETENTION_SECS),
        ];
        for (field, value, max) in bounded {
            if value > max {
                return Err(WatchError::Config(format!("{field} cannot exceed {max}")));
            }
        }

        if self.mass_threshold == 0 {
            return Err(WatchError::Config("mass_threshold must be at least 1".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(WatchError::Config("failure_threshold must be at least 1".to_string()));
        }
        if self.restart_storm_threshold == 0 {
            return Err(WatchError::Config(
                "restart_storm_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_batch_events == 0 {
            return Err(WatchError::Config("max_batch_events must be at least 1".to_string()));
        }

        let windows = self.batch_window_secs;
        if windows.warning > self.max_batch_lifetime_secs || windows.info > self.max_batch_lifetime_secs {
            return Err(WatchError::Config(
                "batch windows cannot exceed max_batch_lifetime_secs".to_string(),
            ));
        }

        if self.routes.is_empty() {
            return Err(WatchError::Config("at least one route is required".to_string()));
        }
        let mut seen = HashSet::new();
        for route in &self.routes {
            if route.destination.trim().is_empty() {
                return Err(WatchError::Config("route destination cannot be empty".to_string()));
            }
            if !seen.insert(route.destination.as_str()) {
                return Err(WatchError::Config(format!(
                    "duplicate route destination '{}'",
                    route.destination
                )));
            }
        }

        if let Some(mail) = &self.mail {
            if mail.from.trim().is_empty() {
                return Err(WatchError::Config("mail.from cannot be empty".to_string()));
            }
            for route in &self.routes {
                let has_recipients = mail
                    .recipients
                    .get(&route.destination)
                    .is_some_and(|to| !to.is_empty());
                if !has_recipients {
                    return Err(WatchError::Config(format!(
                        "no mail recipients for route '{}'",
                        route.destination
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns the poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the observation timeout.
    #[must_use]
    pub const fn observe_timeout(&self) -> Duration {
        Duration::from_secs(self.observe_timeout_secs)
    }

    /// Returns the down record expiry.
    #[must_use]
    pub const fn down_record_expiry(&self) -> Duration {
        Duration::from_secs(self.down_record_expiry_secs)
    }

    /// Builds the scheduler configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            warning_window: Duration::from_secs(self.batch_window_secs.warning),
            info_window: Duration::from_secs(self.batch_window_secs.info),
            max_batch_lifetime: Duration::from_secs(self.max_batch_lifetime_secs),
            max_batch_events: self.max_batch_events,
            sweep_interval: Duration::from_millis(self.sweep_interval_millis),
            window_policy: self.window_policy,
            ..SchedulerConfig::default()
        }
    }

    /// Builds the classifier configuration.
    #[must_use]
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            mass_threshold: self.mass_threshold,
            restart_storm_threshold: self.restart_storm_threshold,
            excluded_namespaces: self.excluded_namespaces.iter().cloned().collect(),
            excluded_owners: self.excluded_owners.iter().cloned().collect(),
        }
    }

    /// Opens the state store, file-backed when `state_dir` is set.
    #[must_use]
    pub fn state_store(&self) -> StateStore {
        self.state_dir
            .as_deref()
            .map_or_else(StateStore::in_memory, StateStore::open)
    }

    /// Opens the cooldown ledger with the configured cooldowns.
    #[must_use]
    pub fn cooldown_ledger(&self) -> CooldownLedger {
        let ledger = self
            .state_dir
            .as_deref()
            .map_or_else(CooldownLedger::new, CooldownLedger::open);
        ledger.with_cooldown(Category::Restart, Duration::from_secs(self.restart_cooldown_secs))
    }

    /// Returns every destination whose route accepts `priority`.
    #[must_use]
    pub fn destinations_for(&self, priority: Priority) -> Vec<Destination> {
        self.routes
            .iter()
            .filter(|route| route.accepts(priority))
            .map(|route| Destination::new(route.destination.clone()))
            .collect()
    }
}
