//! Last-known fleet snapshot and open failure records.
//!
//! The [`StateStore`] is owned by the monitor and only touched from inside a
//! tick. When opened on a state directory it persists two documents through
//! [`claw_persist::JsonStore`]: `snapshot.json` and `down_records.json`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use tracing::{debug, info, warn};

use crate::types::{DownRecord, Instance, InstanceKey};

/// A full snapshot, keyed by instance key.
pub type Snapshot = HashMap<InstanceKey, Instance>;

#[derive(Debug)]
struct Persistence {
    snapshot: JsonStore,
    down_records: JsonStore,
}

/// Snapshot of every tracked instance plus every open [`DownRecord`].
#[derive(Debug, Default)]
pub struct StateStore {
    snapshot: Snapshot,
    down_records: HashMap<InstanceKey, DownRecord>,
    seeded: bool,
    persistence: Option<Persistence>,
}

impl StateStore {
    /// Creates an empty, unseeded store that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a store under `state_path`, loading any persisted state.
    ///
    /// The store counts as seeded only if a snapshot document was found; a
    /// missing or corrupt snapshot makes the next tick a seeding tick.
    #[must_use]
    pub fn open(state_path: &Path) -> Self {
        let persistence = Persistence {
            snapshot: JsonStore::new(state_path, "snapshot"),
            down_records: JsonStore::new(state_path, "down_records"),
        };

        let loaded: Option<Snapshot> = persistence.snapshot.load_existing();
        let seeded = loaded.is_some();
        let snapshot = loaded.unwrap_or_default();
        let down_records: HashMap<InstanceKey, DownRecord> = persistence.down_records.load();

        info!(
            path = %state_path.display(),
            instances = snapshot.len(),
            down_records = down_records.len(),
            seeded,
            "loaded fleet state from disk"
        );

        Self {
            snapshot,
            down_records,
            seeded,
            persistence: Some(persistence),
        }
    }

    /// Returns true once a snapshot has been recorded.
    #[must_use]
    pub const fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Returns the current snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Replaces the snapshot in full and marks the store seeded.
    pub fn replace(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
        self.seeded = true;
    }

    /// Returns the number of tracked instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    /// Returns true if no instance is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    /// Returns every open down record, oldest first.
    #[must_use]
    pub fn open_down_records(&self) -> Vec<&DownRecord> {
        let mut records: Vec<_> = self.down_records.values().collect();
        records.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.key.cmp(&b.key)));
        records
    }

    /// Returns the keys with an open down record.
    #[must_use]
    pub fn open_down_keys(&self) -> HashSet<InstanceKey> {
        self.down_records.keys().cloned().collect()
    }

    /// Returns the open down record for `key`, if any.
    #[must_use]
    pub fn down_record(&self, key: &InstanceKey) -> Option<&DownRecord> {
        self.down_records.get(key)
    }

    /// Inserts or replaces the down record for its key.
    ///
    /// Returns the record it replaced. At most one record per key exists.
    pub fn upsert_down_record(&mut self, record: DownRecord) -> Option<DownRecord> {
        self.down_records.insert(record.key.clone(), record)
    }

    /// Opens `record` unless one is already open for its key.
    ///
    /// Returns true if the record was inserted. An existing record is kept
    /// untouched so its `opened_at` still marks the start of the outage.
    pub fn open_down_record(&mut self, record: DownRecord) -> bool {
        if self.down_records.contains_key(&record.key) {
            debug!(key = %record.key, "down record already open");
            return false;
        }
        debug!(key = %record.key, reason = %record.reason, "opened down record");
        self.down_records.insert(record.key.clone(), record);
        true
    }

    /// Closes and returns the down record for `key`.
    pub fn close_down_record(&mut self, key: &InstanceKey) -> Option<DownRecord> {
        let closed = self.down_records.remove(key);
        if closed.is_some() {
            debug!(key = %key, "closed down record");
        }
        closed
    }

    /// Closes every down record older than `max_age` and returns them.
    pub fn expire_down_records(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<DownRecord> {
        let expired_keys: Vec<InstanceKey> = self
            .down_records
            .values()
            .filter(|r| r.is_expired(now, max_age))
            .map(|r| r.key.clone())
            .collect();

        let expired: Vec<DownRecord> = expired_keys
            .iter()
            .filter_map(|key| self.down_records.remove(key))
            .collect();

        for record in &expired {
            info!(
                key = %record.key,
                opened_at = %record.opened_at,
                "down record expired without recovery"
            );
        }
        expired
    }

    /// Writes the snapshot and down records to disk when file-backed.
    ///
    /// Failures are logged; the in-memory state stays authoritative.
    pub fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if !self.seeded {
            return;
        }

        if let Err(e) = persistence.snapshot.save(&self.snapshot) {
            warn!(error = %e, "failed to snapshot fleet state");
        }
        if let Err(e) = persistence.down_records.save(&self.down_records) {
            warn!(error = %e, "failed to snapshot down records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn instance(name: &str) -> Instance {
        Instance::new("default", name, Utc::now())
    }

    fn snapshot_of(instances: &[Instance]) -> Snapshot {
        instances.iter().map(|i| (i.key.clone(), i.clone())).collect()
    }

    fn record(name: &str, opened_at: DateTime<Utc>) -> DownRecord {
        DownRecord::open(InstanceKey::new("default", name), "disappeared", opened_at, None)
    }

    #[test]
    fn new_store_is_unseeded() {
        let store = StateStore::in_memory();
        assert!(!store.is_seeded());
        assert!(store.is_empty());
        assert!(store.open_down_records().is_empty());
    }

    #[test]
    fn replace_seeds_and_swaps_snapshot() {
        let mut store = StateStore::in_memory();
        store.replace(snapshot_of(&[instance("a"), instance("b")]));
        assert!(store.is_seeded());
        assert_eq!(store.len(), 2);

        store.replace(snapshot_of(&[instance("c")]));
        assert_eq!(store.len(), 1);
        assert!(store.snapshot().contains_key(&InstanceKey::new("default", "c")));
    }

    #[test]
    fn empty_replace_still_seeds() {
        let mut store = StateStore::in_memory();
        store.replace(Snapshot::new());
        assert!(store.is_seeded());
    }

    #[test]
    fn one_record_per_key() {
        let mut store = StateStore::in_memory();
        let t0 = Utc::now();

        assert!(store.open_down_record(record("a", t0)));
        assert!(!store.open_down_record(record("a", t0 + ChronoDuration::seconds(30))));

        assert_eq!(store.open_down_records().len(), 1);
        let open = store.down_record(&InstanceKey::new("default", "a")).unwrap();
        assert_eq!(open.opened_at, t0);
    }

    #[test]
    fn upsert_replaces() {
        let mut store = StateStore::in_memory();
        let t0 = Utc::now();
        assert!(store.upsert_down_record(record("a", t0)).is_none());

        let replaced = store.upsert_down_record(record("a", t0 + ChronoDuration::seconds(5)));
        assert_eq!(replaced.map(|r| r.opened_at), Some(t0));
        assert_eq!(store.open_down_keys().len(), 1);
    }

    #[test]
    fn close_returns_record() {
        let mut store = StateStore::in_memory();
        store.open_down_record(record("a", Utc::now()));

        let key = InstanceKey::new("default", "a");
        assert!(store.close_down_record(&key).is_some());
        assert!(store.close_down_record(&key).is_none());
    }

    #[test]
    fn records_sorted_oldest_first() {
        let mut store = StateStore::in_memory();
        let t0 = Utc::now();
        store.open_down_record(record("late", t0 + ChronoDuration::seconds(10)));
        store.open_down_record(record("early", t0));

        let keys: Vec<_> = store.open_down_records().iter().map(|r| r.key.name().to_string()).collect();
        assert_eq!(keys, vec!["early", "late"]);
    }

    #[test]
    fn expire_old_records() {
        let mut store = StateStore::in_memory();
        let t0 = Utc::now();
        store.open_down_record(record("old", t0));
        store.open_down_record(record("new", t0 + ChronoDuration::seconds(50)));

        let expired = store.expire_down_records(t0 + ChronoDuration::seconds(100), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key.name(), "old");
        assert_eq!(store.open_down_keys().len(), 1);
    }

    #[test]
    fn persist_and_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut store = StateStore::open(dir.path());
        assert!(!store.is_seeded());
        store.replace(snapshot_of(&[instance("a")]));
        store.open_down_record(record("b", Utc::now()));
        store.persist();

        let reopened = StateStore::open(dir.path());
        assert!(reopened.is_seeded());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.open_down_records().len(), 1);
    }

    #[test]
    fn unseeded_store_does_not_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path());
        store.persist();

        assert!(!StateStore::open(dir.path()).is_seeded());
    }

    #[test]
    fn corrupt_snapshot_degrades_to_unseeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("snapshot.json"), "not json").expect("write");

        let store = StateStore::open(dir.path());
        assert!(!store.is_seeded());
        assert!(store.is_empty());
    }
}
