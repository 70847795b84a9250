//! Per-key, per-category alert cooldowns.
//!
//! The [`CooldownLedger`] remembers when each instance last produced an alert
//! of a given [`Category`] and answers whether a new one would come too soon.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use tracing::{debug, warn};

use crate::types::{Category, InstanceKey};

type Stamps = HashMap<InstanceKey, HashMap<Category, DateTime<Utc>>>;

/// Ledger of last-alerted timestamps.
#[derive(Debug, Default)]
pub struct CooldownLedger {
    cooldowns: HashMap<Category, Duration>,
    entries: Stamps,
    store: Option<JsonStore>,
}

impl CooldownLedger {
    /// Creates an empty in-memory ledger with no cooldowns configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger backed by `<state_path>/cooldowns.json`, loading any
    /// existing stamps.
    #[must_use]
    pub fn open(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "cooldowns");
        let entries: Stamps = store.load();
        debug!(count = entries.len(), "loaded cooldown ledger from disk");
        Self {
            cooldowns: HashMap::new(),
            entries,
            store: Some(store),
        }
    }

    /// Sets the cooldown for a category.
    #[must_use]
    pub fn with_cooldown(mut self, category: Category, cooldown: Duration) -> Self {
        self.cooldowns.insert(category, cooldown);
        self
    }

    /// Returns the cooldown for a category (zero when not configured).
    #[must_use]
    pub fn cooldown(&self, category: Category) -> Duration {
        self.cooldowns.get(&category).copied().unwrap_or_default()
    }

    /// Returns when `key` last alerted for `category`.
    #[must_use]
    pub fn last_alerted(&self, key: &InstanceKey, category: Category) -> Option<DateTime<Utc>> {
        self.entries.get(key)?.get(&category).copied()
    }

    /// Returns true if an alert for `key`/`category` at `now` falls inside
    /// the cooldown window.
    #[must_use]
    pub fn should_suppress(&self, key: &InstanceKey, category: Category, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_alerted(key, category) else {
            return false;
        };
        // A stamp from the future (clock skew) counts as zero elapsed.
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
        elapsed < self.cooldown(category)
    }

    /// Records that `key` alerted for `category` at `now`.
    pub fn stamp(&mut self, key: &InstanceKey, category: Category, now: DateTime<Utc>) {
        self.entries
            .entry(key.clone())
            .or_default()
            .insert(category, now);
    }

    /// Stamps and returns true unless the alert is suppressed.
    pub fn check_and_stamp(&mut self, key: &InstanceKey, category: Category, now: DateTime<Utc>) -> bool {
        if self.should_suppress(key, category, now) {
            return false;
        }
        self.stamp(key, category, now);
        true
    }

    /// How long a stamp is kept: twice the longest configured cooldown.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.cooldowns.values().max().copied().unwrap_or_default() * 2
    }

    /// Removes stamps older than [`retention`](Self::retention).
    ///
    /// Returns the number of stamps removed.
    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self.retention();
        let mut removed = 0;

        self.entries.retain(|_, stamps| {
            let before = stamps.len();
            stamps.retain(|_, at| {
                now.signed_duration_since(*at)
                    .to_std()
                    .map_or(true, |age| age <= retention)
            });
            removed += before - stamps.len();
            !stamps.is_empty()
        });

        if removed > 0 {
            debug!(removed, "purged expired cooldown stamps");
        }
        removed
    }

    /// Returns the number of keys with at least one stamp.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the ledger holds no stamps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the stamps to disk when the ledger is file-backed.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.entries) {
                warn!(error = %e, "failed to snapshot cooldown ledger");
            }
        }
    }
}
