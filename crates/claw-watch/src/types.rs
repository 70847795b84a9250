//! Core types for fleet watching.
//!
//! This module provides the fundamental types used throughout the claw-watch crate:
//! - [`Instance`]: One observed pod, keyed by [`InstanceKey`]
//! - [`InstanceRecord`]: The loosely-typed record an observation source returns
//! - [`Workload`]: The per-owner, per-namespace aggregate recomputed every tick
//! - [`RawChangeEvent`]: A state change found by the change detector
//! - [`ClassifiedEvent`]: A change with a [`Priority`] and [`Category`] attached
//! - [`DownRecord`]: An open, unresolved failure for one instance
//! - [`AlertBatch`]: A flushed group of classified events for one destination

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WatchError};

/// Alphabet Kubernetes uses for generated name suffixes and template hashes.
const GENERATED_ALPHABET: &str = "bcdfghjklmnpqrstvwxz2456789";

/// Unique identity of an instance: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// Creates a key from a namespace and a pod name.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    /// Returns the key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespace part of the key.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map_or("", |(ns, _)| ns)
    }

    /// Returns the name part of the key.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Accepted but not all containers are running yet.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated and at least one failed.
    Failed,
    /// All containers terminated successfully.
    Succeeded,
    /// State could not be obtained.
    #[default]
    Unknown,
}

impl Phase {
    /// Returns the phase as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
            Self::Unknown => "Unknown",
        }
    }

    /// Parses a phase name, ignoring ASCII case.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Running,
            Self::Failed,
            Self::Succeeded,
            Self::Unknown,
        ]
        .into_iter()
        .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Returns true for phases that end an instance without failure. Neither
    /// reaching such a phase nor disappearing after it is reported.
    #[must_use]
    pub const fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed unit (a pod).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique key (`namespace/name`).
    pub key: InstanceKey,
    /// Name of the workload this instance belongs to.
    pub owner: String,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Whether the instance reports ready.
    pub ready: bool,
    /// Total container restarts.
    pub restart_count: u32,
    /// Node the instance is scheduled on, if any.
    pub node: Option<String>,
    /// When this state was observed.
    pub last_seen: DateTime<Utc>,
}

impl Instance {
    /// Creates a running, ready instance with no restarts.
    ///
    /// The owner is derived from the pod name; see [`derive_owner`].
    #[must_use]
    pub fn new(namespace: &str, name: &str, last_seen: DateTime<Utc>) -> Self {
        Self {
            key: InstanceKey::new(namespace, name),
            owner: derive_owner(name),
            phase: Phase::Running,
            ready: true,
            restart_count: 0,
            node: None,
            last_seen,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Sets the phase.
    #[must_use]
    pub const fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the ready flag.
    #[must_use]
    pub const fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Sets the restart count.
    #[must_use]
    pub const fn with_restart_count(mut self, restart_count: u32) -> Self {
        self.restart_count = restart_count;
        self
    }

    /// Sets the node.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Returns true if the instance is running and ready.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.phase == Phase::Running && self.ready
    }
}

/// A raw record as returned by an observation source.
///
/// Records are validated into [`Instance`]s by [`InstanceRecord::into_instance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod.
    pub name: String,
    /// Owning workload, derived from the name when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Phase name as reported by the source.
    #[serde(default)]
    pub phase: Option<String>,
    /// Whether the pod reports ready.
    #[serde(default)]
    pub ready: bool,
    /// Total container restarts.
    #[serde(default)]
    pub restart_count: i64,
    /// Node the pod runs on.
    #[serde(default)]
    pub node: Option<String>,
    /// Observation time reported by the source.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Validates the record and converts it into an [`Instance`].
    ///
    /// `now` is used when the record carries no observation time.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::MalformedRecord` if the namespace or name is empty,
    /// the phase is not recognised, or the restart count is out of range.
    pub fn into_instance(self, now: DateTime<Utc>) -> Result<Instance> {
        let label = format!("{}/{}", self.namespace, self.name);
        let malformed = |reason: String| WatchError::MalformedRecord {
            key: label.clone(),
            reason,
        };

        if self.namespace.trim().is_empty() {
            return Err(malformed("namespace is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(malformed("name is empty".to_string()));
        }
        if self.namespace.contains('/') || self.name.contains('/') {
            return Err(malformed("namespace and name must not contain '/'".to_string()));
        }

        let phase = match self.phase.as_deref() {
            None => Phase::Unknown,
            Some(raw) => Phase::parse(raw).ok_or_else(|| malformed(format!("unknown phase '{raw}'")))?,
        };

        let restart_count = u32::try_from(self.restart_count)
            .map_err(|_| malformed(format!("restart count {} out of range", self.restart_count)))?;

        let owner = self
            .owner
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| derive_owner(&self.name));

        Ok(Instance {
            key: InstanceKey::new(&self.namespace, &self.name),
            owner,
            phase,
            ready: self.ready,
            restart_count,
            node: self.node,
            last_seen: self.last_seen.unwrap_or(now),
        })
    }
}

impl From<&Instance> for InstanceRecord {
    fn from(instance: &Instance) -> Self {
        Self {
            namespace: instance.key.namespace().to_string(),
            name: instance.key.name().to_string(),
            owner: Some(instance.owner.clone()),
            phase: Some(instance.phase.as_str().to_string()),
            ready: instance.ready,
            restart_count: i64::from(instance.restart_count),
            node: instance.node.clone(),
            last_seen: Some(instance.last_seen),
        }
    }
}

fn is_generated(segment: &str, min_len: usize, max_len: usize) -> bool {
    (min_len..=max_len).contains(&segment.len())
        && segment.chars().all(|c| GENERATED_ALPHABET.contains(c))
}

/// Strips a trailing pod-template hash (`api-7d9f8b6c5` → `api`).
#[must_use]
pub fn strip_template_hash(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, hash)) if !base.is_empty() && is_generated(hash, 6, 10) => base,
        _ => name,
    }
}

/// Derives the owning workload name from a pod name.
///
/// - `<deployment>-<template-hash>-<suffix>` → `<deployment>`
/// - `<daemonset-or-job>-<suffix>` → `<daemonset-or-job>`
/// - `<statefulset>-<ordinal>` → `<statefulset>`
/// - anything else is its own owner
#[must_use]
pub fn derive_owner(pod_name: &str) -> String {
    let Some((rest, last)) = pod_name.rsplit_once('-') else {
        return pod_name.to_string();
    };
    if rest.is_empty() {
        return pod_name.to_string();
    }

    if is_generated(last, 5, 5) {
        return strip_template_hash(rest).to_string();
    }

    if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
        return rest.to_string();
    }

    pod_name.to_string()
}

/// Health of a workload, computed from the current tick only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Every tracked instance is ready.
    Healthy,
    /// Some, but not all, instances are ready.
    Degraded,
    /// No instance is ready.
    Critical,
}

impl HealthState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate of the instances sharing an owner within one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Namespace of the owner.
    pub namespace: String,
    /// Owner name.
    pub owner: String,
    /// Number of instances currently tracked under this owner.
    pub desired: usize,
    /// Number of those instances reporting ready.
    pub ready_count: usize,
    /// Computed health.
    pub health: HealthState,
}

impl Workload {
    /// Computes health from ready and desired counts.
    #[must_use]
    pub const fn health_for(ready_count: usize, desired: usize) -> HealthState {
        if ready_count == 0 && desired > 0 {
            HealthState::Critical
        } else if ready_count > 0 && ready_count < desired {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Builds one workload per `(namespace, owner)`, sorted by both.
    pub fn aggregate<'a>(instances: impl IntoIterator<Item = &'a Instance>) -> Vec<Self> {
        let mut counts: BTreeMap<(&str, &str), (usize, usize)> = BTreeMap::new();
        for instance in instances {
            let entry = counts
                .entry((instance.key.namespace(), instance.owner.as_str()))
                .or_default();
            entry.0 += 1;
            if instance.ready {
                entry.1 += 1;
            }
        }

        counts
            .into_iter()
            .map(|((namespace, owner), (desired, ready_count))| Self {
                namespace: namespace.to_string(),
                owner: owner.to_string(),
                desired,
                ready_count,
                health: Self::health_for(ready_count, desired),
            })
            .collect()
    }
}

/// A state change found by diffing two consecutive observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawChangeEvent {
    /// A key not present in the previous snapshot.
    Appeared {
        /// The new instance.
        instance: Instance,
    },
    /// A key present in the previous snapshot but no longer observed.
    Disappeared {
        /// The last state seen for it.
        last_known: Instance,
    },
    /// A ready instance that stopped reporting ready.
    BecameUnready {
        /// The current state.
        instance: Instance,
    },
    /// The restart counter went up.
    Restarted {
        /// The current state.
        instance: Instance,
        /// How many restarts happened since the previous observation.
        delta: u32,
    },
    /// An instance with an open failure is healthy again.
    Recovered {
        /// The current state.
        instance: Instance,
        /// Time between the failure opening and this observation.
        down_duration: Duration,
    },
}

impl RawChangeEvent {
    /// Returns the instance the event is about.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        match self {
            Self::Appeared { instance }
            | Self::BecameUnready { instance }
            | Self::Restarted { instance, .. }
            | Self::Recovered { instance, .. } => instance,
            Self::Disappeared { last_known } => last_known,
        }
    }

    /// Returns the key of the instance the event is about.
    #[must_use]
    pub const fn key(&self) -> &InstanceKey {
        &self.instance().key
    }

    /// Returns the owner of the instance the event is about.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.instance().owner
    }

    /// Returns the event kind as a string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Appeared { .. } => "appeared",
            Self::Disappeared { .. } => "disappeared",
            Self::BecameUnready { .. } => "became_unready",
            Self::Restarted { .. } => "restarted",
            Self::Recovered { .. } => "recovered",
        }
    }

    /// Returns true for events that signal a new failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Disappeared { .. } | Self::BecameUnready { .. })
    }
}

/// Priority of a classified event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational, batched on the short window.
    Info,
    /// Should be investigated, batched on the long window.
    #[default]
    Warning,
    /// Requires immediate attention, never batched.
    Critical,
}

impl Priority {
    /// Returns the priority as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Many instances of one owner failed in the same tick.
    MassFailure,
    /// A single instance disappeared or became unready.
    IndividualChange,
    /// An instance restarted.
    Restart,
    /// A failed instance is healthy again.
    Recovery,
    /// A previously unknown instance appeared.
    NewInstance,
}

impl Category {
    /// Returns the category as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MassFailure => "mass-failure",
            Self::IndividualChange => "individual-change",
            Self::Restart => "restart",
            Self::Recovery => "recovery",
            Self::NewInstance => "new-instance",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change that passed classification and is on its way to a destination.
///
/// A mass-failure event carries every raw event of its group; all other
/// categories carry exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Priority.
    pub priority: Priority,
    /// Category.
    pub category: Category,
    /// Owner of the affected instances.
    pub owner: String,
    /// Human-readable reason.
    pub reason: String,
    /// The raw events this classification covers.
    pub events: Vec<RawChangeEvent>,
    /// When the classification happened.
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedEvent {
    /// Creates a classified event over one or more raw events.
    #[must_use]
    pub fn new(
        priority: Priority,
        category: Category,
        reason: impl Into<String>,
        events: Vec<RawChangeEvent>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let owner = events
            .first()
            .map_or_else(String::new, |e| e.owner().to_string());

        Self {
            id: Uuid::new_v4(),
            priority,
            category,
            owner,
            reason: reason.into(),
            events,
            timestamp,
        }
    }

    /// Returns the keys of every instance covered by this event.
    #[must_use]
    pub fn keys(&self) -> Vec<&InstanceKey> {
        self.events.iter().map(RawChangeEvent::key).collect()
    }
}

/// An open failure for one instance key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownRecord {
    /// Key of the failed instance.
    pub key: InstanceKey,
    /// Why the record was opened.
    pub reason: String,
    /// When the failure was first seen.
    pub opened_at: DateTime<Utc>,
    /// Last state seen before the failure, if known.
    pub last_known_good: Option<Instance>,
}

impl DownRecord {
    /// Opens a record.
    #[must_use]
    pub fn open(
        key: InstanceKey,
        reason: impl Into<String>,
        opened_at: DateTime<Utc>,
        last_known_good: Option<Instance>,
    ) -> Self {
        Self {
            key,
            reason: reason.into(),
            opened_at,
            last_known_good,
        }
    }

    /// Time since the record was opened, clamped at zero.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.opened_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Returns true once the record is older than `max_age`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }
}

/// Name of a notification destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    /// Creates a destination name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A flushed batch, handed to a dispatcher exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertBatch {
    /// Unique identifier.
    pub id: Uuid,
    /// Priority shared by every event in the batch.
    pub priority: Priority,
    /// Where the batch goes.
    pub destination: Destination,
    /// Events in arrival order.
    pub events: Vec<ClassifiedEvent>,
    /// When the first event arrived.
    pub window_opened_at: DateTime<Utc>,
    /// When the batch was flushed.
    pub window_closed_at: DateTime<Utc>,
}

impl AlertBatch {
    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
