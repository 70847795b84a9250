//! Snapshot-versus-observation diffing.
//!
//! The [`ChangeDetector`] compares the stored snapshot with a fresh
//! observation, emits [`RawChangeEvent`]s, opens and closes
//! [`DownRecord`]s, and finally replaces the snapshot with the observation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::store::{Snapshot, StateStore};
use crate::types::{DownRecord, Instance, InstanceKey, RawChangeEvent};

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Events in emission order.
    pub events: Vec<RawChangeEvent>,
    /// Keys whose down record was already open before this pass.
    pub prior_down: HashSet<InstanceKey>,
    /// True when this pass only seeded the store.
    pub seeded: bool,
    /// Instances that finished successfully, either by reaching `Succeeded`
    /// or by vanishing after it. None of them produce an event.
    pub completed: usize,
}

/// Diffs consecutive observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    /// Creates a detector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Diffs `current` against the stored snapshot.
    ///
    /// On an unseeded store the observation becomes the snapshot and no
    /// events are emitted. Otherwise events come out in this order:
    /// disappearances, unready transitions and restarts (by key), then
    /// appearances (by key), then recoveries (by key).
    pub fn detect(&self, store: &mut StateStore, current: Vec<Instance>, now: DateTime<Utc>) -> Detection {
        let prior_down = store.open_down_keys();
        let current: Snapshot = current.into_iter().map(|i| (i.key.clone(), i)).collect();

        if !store.is_seeded() {
            info!(instances = current.len(), "seeding fleet snapshot, no changes reported");
            store.replace(current);
            return Detection {
                prior_down,
                seeded: true,
                ..Detection::default()
            };
        }

        let mut events = Vec::new();
        let mut completed = 0;
        let mut failures: Vec<(InstanceKey, &'static str, Option<Instance>)> = Vec::new();

        {
            let previous = store.snapshot();

            let mut previous_keys: Vec<&InstanceKey> = previous.keys().collect();
            previous_keys.sort();

            for key in previous_keys {
                let prev = &previous[key];
                match current.get(key) {
                    None if prev.phase.is_terminal_success() => {
                        debug!(key = %key, "completed instance removed");
                        completed += 1;
                    }
                    None => {
                        failures.push((key.clone(), "disappeared", prev.is_healthy().then(|| prev.clone())));
                        events.push(RawChangeEvent::Disappeared {
                            last_known: prev.clone(),
                        });
                    }
                    Some(cur) => {
                        if prev.ready && !cur.ready && cur.phase.is_terminal_success() {
                            debug!(key = %key, "instance completed");
                            completed += 1;
                        } else if prev.ready && !cur.ready {
                            failures.push((key.clone(), "became unready", prev.is_healthy().then(|| prev.clone())));
                            events.push(RawChangeEvent::BecameUnready {
                                instance: cur.clone(),
                            });
                        }

                        if cur.restart_count > prev.restart_count {
                            events.push(RawChangeEvent::Restarted {
                                instance: cur.clone(),
                                delta: cur.restart_count - prev.restart_count,
                            });
                        } else if cur.restart_count < prev.restart_count {
                            debug!(
                                key = %key,
                                previous = prev.restart_count,
                                current = cur.restart_count,
                                "restart count went down, treating as a new baseline"
                            );
                        }
                    }
                }
            }

            let mut appeared: Vec<&Instance> = current
                .values()
                .filter(|i| !previous.contains_key(&i.key))
                .collect();
            appeared.sort_by(|a, b| a.key.cmp(&b.key));

            events.extend(appeared.into_iter().map(|instance| RawChangeEvent::Appeared {
                instance: instance.clone(),
            }));
        }

        for (key, reason, last_known_good) in failures {
            store.open_down_record(DownRecord::open(key, reason, now, last_known_good));
        }

        let mut recovering: Vec<&Instance> = store
            .open_down_records()
            .into_iter()
            .filter_map(|record| current.get(&record.key))
            .filter(|instance| instance.is_healthy())
            .collect();
        recovering.sort_by(|a, b| a.key.cmp(&b.key));
        let recovering: Vec<Instance> = recovering.into_iter().cloned().collect();

        for instance in recovering {
            if let Some(record) = store.close_down_record(&instance.key) {
                let down_duration = record.age(now);
                debug!(
                    key = %instance.key,
                    down_secs = down_duration.as_secs(),
                    "instance recovered"
                );
                events.push(RawChangeEvent::Recovered {
                    instance,
                    down_duration,
                });
            }
        }

        store.replace(current);

        Detection {
            events,
            prior_down,
            seeded: false,
            completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use std::time::Duration;

    fn pod(name: &str, at: DateTime<Utc>) -> Instance {
        Instance::new("default", name, at).with_owner("api")
    }

    fn seeded_store(instances: &[Instance]) -> StateStore {
        let mut store = StateStore::in_memory();
        store.replace(instances.iter().map(|i| (i.key.clone(), i.clone())).collect());
        store
    }

    fn kinds(detection: &Detection) -> Vec<&'static str> {
        detection.events.iter().map(RawChangeEvent::kind).collect()
    }

    mod first_tick_tests {
        use super::*;

        #[test]
        fn first_tick_emits_nothing() {
            let now = Utc::now();
            let mut store = StateStore::in_memory();
            let current = vec![pod("a", now), pod("b", now).with_ready(false)];

            let detection = ChangeDetector::new().detect(&mut store, current.clone(), now);

            assert!(detection.seeded);
            assert!(detection.events.is_empty());
            assert!(store.is_seeded());
            assert_eq!(store.len(), 2);
            for instance in &current {
                assert_eq!(store.snapshot().get(&instance.key), Some(instance));
            }
        }

        #[test]
        fn second_tick_diffs() {
            let now = Utc::now();
            let mut store = StateStore::in_memory();
            let detector = ChangeDetector::new();

            detector.detect(&mut store, vec![pod("a", now)], now);
            let detection = detector.detect(&mut store, vec![pod("a", now), pod("b", now)], now);

            assert!(!detection.seeded);
            assert_eq!(kinds(&detection), vec!["appeared"]);
        }
    }

    mod diff_tests {
        use super::*;

        #[test]
        fn disappeared_opens_down_record() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![], now);

            assert_eq!(kinds(&detection), vec!["disappeared"]);
            let record = store.down_record(&InstanceKey::new("default", "a")).unwrap();
            assert_eq!(record.reason, "disappeared");
            assert_eq!(record.opened_at, now);
            assert!(record.last_known_good.is_some());
            assert!(store.is_empty());
        }

        #[test]
        fn succeeded_instance_disappears_silently() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("job-x", now).with_phase(Phase::Succeeded).with_ready(false)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![], now);

            assert!(detection.events.is_empty());
            assert_eq!(detection.completed, 1);
            assert!(store.open_down_records().is_empty());
            assert!(store.is_empty());
        }

        #[test]
        fn ready_instance_succeeding_is_not_a_failure() {
            let now = Utc::now();
            let job = Instance::new("batch", "report-28411-abcde", now).with_owner("report-28411");
            let mut store = seeded_store(&[job.clone()]);

            let current = vec![job.with_phase(Phase::Succeeded).with_ready(false)];
            let detection = ChangeDetector::new().detect(&mut store, current, now);

            assert!(detection.events.is_empty());
            assert_eq!(detection.completed, 1);
            assert!(store.open_down_records().is_empty());
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn failed_instance_disappearance_is_reported() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now).with_phase(Phase::Failed).with_ready(false)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![], now);
            assert_eq!(kinds(&detection), vec!["disappeared"]);
            let record = store.down_record(&InstanceKey::new("default", "a")).unwrap();
            assert!(record.last_known_good.is_none());
        }

        #[test]
        fn became_unready() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![pod("a", now).with_ready(false)], now);

            assert_eq!(kinds(&detection), vec!["became_unready"]);
            assert_eq!(store.open_down_keys().len(), 1);
        }

        #[test]
        fn staying_unready_emits_nothing() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now).with_ready(false)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![pod("a", now).with_ready(false)], now);
            assert!(detection.events.is_empty());
        }

        #[test]
        fn restart_delta() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now).with_restart_count(2)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![pod("a", now).with_restart_count(5)], now);

            match detection.events.as_slice() {
                [RawChangeEvent::Restarted { delta, instance }] => {
                    assert_eq!(*delta, 3);
                    assert_eq!(instance.restart_count, 5);
                }
                other => panic!("expected one Restarted, got {other:?}"),
            }
        }

        #[test]
        fn restart_count_decrease_is_identity_reset() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now).with_restart_count(5)]);
            let detector = ChangeDetector::new();

            let detection = detector.detect(&mut store, vec![pod("a", now).with_restart_count(0)], now);
            assert!(detection.events.is_empty());
            assert_eq!(store.snapshot()[&InstanceKey::new("default", "a")].restart_count, 0);

            // The new baseline is used from now on.
            let detection = detector.detect(&mut store, vec![pod("a", now).with_restart_count(1)], now);
            assert_eq!(kinds(&detection), vec!["restarted"]);
        }

        #[test]
        fn unready_and_restart_in_one_tick() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("a", now)]);

            let current = vec![pod("a", now).with_ready(false).with_restart_count(1)];
            let detection = ChangeDetector::new().detect(&mut store, current, now);
            assert_eq!(kinds(&detection), vec!["became_unready", "restarted"]);
        }

        #[test]
        fn events_are_ordered_by_key() {
            let now = Utc::now();
            let mut store = seeded_store(&[pod("c", now), pod("a", now)]);

            let detection = ChangeDetector::new().detect(&mut store, vec![pod("z", now), pod("b", now)], now);
            let keys: Vec<_> = detection.events.iter().map(|e| e.key().name().to_string()).collect();
            assert_eq!(keys, vec!["a", "c", "b", "z"]);
        }
    }

    mod recovery_tests {
        use super::*;

        #[test]
        fn recovery_closes_record() {
            let t0 = Utc::now();
            let t1 = t0 + ChronoDuration::seconds(45);
            let mut store = seeded_store(&[pod("a", t0)]);
            let detector = ChangeDetector::new();

            detector.detect(&mut store, vec![], t0);
            let detection = detector.detect(&mut store, vec![pod("a", t1)], t1);

            assert_eq!(kinds(&detection), vec!["appeared", "recovered"]);
            assert!(detection.prior_down.contains(&InstanceKey::new("default", "a")));
            match &detection.events[1] {
                RawChangeEvent::Recovered { down_duration, .. } => {
                    assert_eq!(*down_duration, Duration::from_secs(45));
                }
                other => panic!("expected Recovered, got {other:?}"),
            }
            assert!(store.open_down_records().is_empty());
        }

        #[test]
        fn unhealthy_return_keeps_record_open() {
            let t0 = Utc::now();
            let mut store = seeded_store(&[pod("a", t0)]);
            let detector = ChangeDetector::new();

            detector.detect(&mut store, vec![], t0);
            let detection = detector.detect(
                &mut store,
                vec![pod("a", t0).with_phase(Phase::Pending).with_ready(false)],
                t0 + ChronoDuration::seconds(10),
            );

            assert_eq!(kinds(&detection), vec!["appeared"]);
            assert_eq!(store.open_down_keys().len(), 1);
        }

        #[test]
        fn repeated_failure_keeps_first_record() {
            let t0 = Utc::now();
            let mut store = seeded_store(&[pod("a", t0)]);
            let detector = ChangeDetector::new();

            detector.detect(&mut store, vec![pod("a", t0).with_ready(false)], t0);
            let detection = detector.detect(&mut store, vec![], t0 + ChronoDuration::seconds(30));

            assert_eq!(kinds(&detection), vec!["disappeared"]);
            assert!(detection.prior_down.contains(&InstanceKey::new("default", "a")));
            let records = store.open_down_records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].opened_at, t0);
            assert_eq!(records[0].reason, "became unready");
        }

        #[test]
        fn unready_then_ready_recovers() {
            let t0 = Utc::now();
            let mut store = seeded_store(&[pod("a", t0)]);
            let detector = ChangeDetector::new();

            detector.detect(&mut store, vec![pod("a", t0).with_ready(false)], t0);
            let detection = detector.detect(&mut store, vec![pod("a", t0)], t0 + ChronoDuration::seconds(5));

            assert_eq!(kinds(&detection), vec!["recovered"]);
        }
    }

    fn arb_instance() -> impl Strategy<Value = Instance> {
        ("[a-e]", any::<bool>(), 0_u32..20, prop_oneof![Just(Phase::Running), Just(Phase::Pending), Just(Phase::Succeeded)])
            .prop_map(|(name, ready, restarts, phase)| {
                Instance::new("default", &name, Utc::now())
                    .with_ready(ready)
                    .with_restart_count(restarts)
                    .with_phase(phase)
            })
    }

    proptest! {
        #[test]
        fn prop_first_tick_is_silent(current in proptest::collection::vec(arb_instance(), 0..8)) {
            let mut store = StateStore::in_memory();
            let detection = ChangeDetector::new().detect(&mut store, current.clone(), Utc::now());

            prop_assert!(detection.events.is_empty());
            let expected: Snapshot = current.into_iter().map(|i| (i.key.clone(), i)).collect();
            prop_assert_eq!(store.snapshot(), &expected);
        }

        #[test]
        fn prop_snapshot_tracks_ground_truth(
            first in proptest::collection::vec(arb_instance(), 0..8),
            second in proptest::collection::vec(arb_instance(), 0..8),
        ) {
            let detector = ChangeDetector::new();
            let mut store = StateStore::in_memory();
            detector.detect(&mut store, first, Utc::now());
            detector.detect(&mut store, second.clone(), Utc::now());

            let expected: Snapshot = second.into_iter().map(|i| (i.key.clone(), i)).collect();
            prop_assert_eq!(store.snapshot(), &expected);
        }

        #[test]
        fn prop_at_most_one_record_per_key(
            ticks in proptest::collection::vec(proptest::collection::vec(arb_instance(), 0..6), 1..6),
        ) {
            let detector = ChangeDetector::new();
            let mut store = StateStore::in_memory();
            for tick in ticks {
                detector.detect(&mut store, tick, Utc::now());
                let records = store.open_down_records();
                let keys: HashSet<_> = records.iter().map(|r| r.key.clone()).collect();
                prop_assert_eq!(keys.len(), records.len());
            }
        }
    }
}
