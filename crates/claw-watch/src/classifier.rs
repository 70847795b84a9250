//! Raw change events to prioritised alerts.
//!
//! Rules, first match wins:
//!
//! | Raw event | Condition | Result |
//! |---|---|---|
//! | Disappeared / BecameUnready | ≥ `mass_threshold` new failures for one owner in one namespace | one `critical` / `mass-failure` |
//! | Disappeared / BecameUnready | key already down before this tick | suppressed |
//! | Disappeared / BecameUnready | otherwise | `warning` / `individual-change` |
//! | Restarted | key inside its restart cooldown | suppressed |
//! | Restarted | otherwise | `warning` / `restart` |
//! | Recovered | always | `info` / `recovery` |
//! | Appeared | key already down before this tick | suppressed |
//! | Appeared | otherwise | `info` / `new-instance` |

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cooldown::CooldownLedger;
use crate::types::{Category, ClassifiedEvent, InstanceKey, Priority, RawChangeEvent};

/// Thresholds and exclusions applied by the [`EventClassifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Failures in one owner per tick that turn into a single mass-failure alert.
    pub mass_threshold: usize,
    /// Restart delta at which a restart is reported as a storm.
    pub restart_storm_threshold: u32,
    /// Namespaces whose events are dropped.
    pub excluded_namespaces: HashSet<String>,
    /// Owners whose events are dropped.
    pub excluded_owners: HashSet<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mass_threshold: 3,
            restart_storm_threshold: 5,
            excluded_namespaces: HashSet::new(),
            excluded_owners: HashSet::new(),
        }
    }
}

/// Mass failures are grouped per `(namespace, owner)`.
type OwnerKey = (String, String);

fn owner_key(event: &RawChangeEvent) -> OwnerKey {
    (event.key().namespace().to_string(), event.owner().to_string())
}

enum Slot {
    Ready(ClassifiedEvent),
    Mass(OwnerKey),
}

/// Maps raw change events to classified alerts.
#[derive(Debug, Clone, Default)]
pub struct EventClassifier {
    config: ClassifierConfig,
}

impl EventClassifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies one tick's raw events.
    ///
    /// `prior_down` holds the keys whose down record was open before the
    /// tick. Restart alerts that pass are stamped in `ledger`. The output
    /// keeps input order; a mass-failure alert sits where the first member
    /// of its group was.
    pub fn classify(
        &self,
        raw: Vec<RawChangeEvent>,
        prior_down: &HashSet<InstanceKey>,
        ledger: &mut CooldownLedger,
        now: DateTime<Utc>,
    ) -> Vec<ClassifiedEvent> {
        let raw: Vec<RawChangeEvent> = raw
            .into_iter()
            .filter(|event| {
                let excluded = self.is_excluded(event);
                if excluded {
                    debug!(key = %event.key(), kind = event.kind(), "event excluded");
                }
                !excluded
            })
            .collect();

        let mut group_sizes: HashMap<OwnerKey, usize> = HashMap::new();
        for event in raw.iter().filter(|e| e.is_failure() && !prior_down.contains(e.key())) {
            *group_sizes.entry(owner_key(event)).or_default() += 1;
        }
        let mass_owners: HashSet<OwnerKey> = group_sizes
            .into_iter()
            .filter(|(_, size)| *size >= self.config.mass_threshold)
            .map(|(owner, _)| owner)
            .collect();

        let mut slots = Vec::new();
        let mut groups: HashMap<OwnerKey, Vec<RawChangeEvent>> = HashMap::new();

        for event in raw {
            let known_down = prior_down.contains(event.key());

            match &event {
                RawChangeEvent::Disappeared { .. } | RawChangeEvent::BecameUnready { .. } => {
                    if known_down {
                        debug!(key = %event.key(), kind = event.kind(), "failure already open, suppressed");
                    } else if mass_owners.contains(&owner_key(&event)) {
                        let owner = owner_key(&event);
                        let group = groups.entry(owner.clone()).or_default();
                        if group.is_empty() {
                            slots.push(Slot::Mass(owner));
                        }
                        group.push(event);
                    } else {
                        let reason = individual_reason(&event);
                        slots.push(Slot::Ready(ClassifiedEvent::new(
                            Priority::Warning,
                            Category::IndividualChange,
                            reason,
                            vec![event],
                            now,
                        )));
                    }
                }
                RawChangeEvent::Restarted { instance, delta } => {
                    if ledger.check_and_stamp(&instance.key, Category::Restart, now) {
                        let reason = if *delta >= self.config.restart_storm_threshold {
                            format!(
                                "restart storm: {} restarted {delta} times since last poll (total {})",
                                instance.key, instance.restart_count
                            )
                        } else {
                            format!(
                                "{} restarted {delta} time(s) (total {})",
                                instance.key, instance.restart_count
                            )
                        };
                        slots.push(Slot::Ready(ClassifiedEvent::new(
                            Priority::Warning,
                            Category::Restart,
                            reason,
                            vec![event],
                            now,
                        )));
                    } else {
                        debug!(key = %instance.key, delta, "restart inside cooldown, suppressed");
                    }
                }
                RawChangeEvent::Recovered {
                    instance,
                    down_duration,
                } => {
                    let reason = format!(
                        "{} recovered after {}s",
                        instance.key,
                        down_duration.as_secs()
                    );
                    slots.push(Slot::Ready(ClassifiedEvent::new(
                        Priority::Info,
                        Category::Recovery,
                        reason,
                        vec![event],
                        now,
                    )));
                }
                RawChangeEvent::Appeared { instance } => {
                    if known_down {
                        debug!(key = %instance.key, "failed instance reappeared, awaiting recovery");
                    } else {
                        let reason = format!(
                            "{} appeared on {}",
                            instance.key,
                            instance.node.as_deref().unwrap_or("an unscheduled node")
                        );
                        slots.push(Slot::Ready(ClassifiedEvent::new(
                            Priority::Info,
                            Category::NewInstance,
                            reason,
                            vec![event],
                            now,
                        )));
                    }
                }
            }
        }

        slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Ready(event) => Some(event),
                Slot::Mass(owner) => {
                    let events = groups.remove(&owner)?;
                    let reason = mass_reason(&owner.0, &owner.1, &events);
                    Some(ClassifiedEvent::new(
                        Priority::Critical,
                        Category::MassFailure,
                        reason,
                        events,
                        now,
                    ))
                }
            })
            .collect()
    }

    fn is_excluded(&self, event: &RawChangeEvent) -> bool {
        self.config.excluded_namespaces.contains(event.key().namespace())
            || self.config.excluded_owners.contains(event.owner())
    }
}

fn individual_reason(event: &RawChangeEvent) -> String {
    match event {
        RawChangeEvent::Disappeared { last_known } => format!(
            "{} disappeared (last seen {}, ready={})",
            last_known.key, last_known.phase, last_known.ready
        ),
        RawChangeEvent::BecameUnready { instance } => format!(
            "{} became unready (phase {})",
            instance.key, instance.phase
        ),
        other => format!("{} {}", other.key(), other.kind()),
    }
}

fn mass_reason(namespace: &str, owner: &str, events: &[RawChangeEvent]) -> String {
    let disappeared = events
        .iter()
        .filter(|e| matches!(e, RawChangeEvent::Disappeared { .. }))
        .count();
    let unready = events.len() - disappeared;
    format!(
        "{} instances of {namespace}/{owner} failed: {disappeared} disappeared, {unready} became unready",
        events.len()
    )
}
