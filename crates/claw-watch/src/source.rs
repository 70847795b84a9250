//! Observation sources.
//!
//! An [`ObservationSource`] returns the current list of pods as raw
//! [`InstanceRecord`]s. Validation into instances happens in the monitor so
//! that a bad record never takes the rest of the observation down with it.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::types::{InstanceRecord, strip_template_hash};

/// Supplies the current fleet on demand.
pub trait ObservationSource: Send + Sync {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Observes the fleet.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Observation` if the fleet cannot be listed.
    fn observe(&self) -> impl Future<Output = Result<Vec<InstanceRecord>>> + Send;
}

impl<T: ObservationSource> ObservationSource for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn observe(&self) -> impl Future<Output = Result<Vec<InstanceRecord>>> + Send {
        (**self).observe()
    }
}

/// Reads the fleet from a JSON file on every observation.
///
/// The file holds either an array of instance records or a Kubernetes
/// `PodList` document.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObservationSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn observe(&self) -> impl Future<Output = Result<Vec<InstanceRecord>>> + Send {
        let path = self.path.clone();
        async move {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| WatchError::Observation {
                    reason: format!("failed to read {}: {e}", path.display()),
                })?;
            parse_records(&content)
        }
    }
}

/// Lists pods with `kubectl get pods -o json`.
#[derive(Debug, Clone)]
pub struct KubectlSource {
    program: String,
    namespace: Option<String>,
    context: Option<String>,
}

impl KubectlSource {
    /// Creates a source running `kubectl` across all namespaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "kubectl".to_string(),
            namespace: None,
            context: None,
        }
    }

    /// Uses another `kubectl` binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Limits the listing to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Selects a kubeconfig context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the arguments passed to `kubectl`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["get", "pods", "-o", "json"].map(String::from).to_vec();
        match &self.namespace {
            Some(namespace) => {
                args.push("--namespace".to_string());
                args.push(namespace.clone());
            }
            None => args.push("--all-namespaces".to_string()),
        }
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args
    }
}

impl Default for KubectlSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationSource for KubectlSource {
    fn name(&self) -> &str {
        "kubectl"
    }

    fn observe(&self) -> impl Future<Output = Result<Vec<InstanceRecord>>> + Send {
        let program = self.program.clone();
        let args = self.args();
        async move {
            debug!(program = %program, args = ?args, "listing pods");
            let output = Command::new(&program)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| WatchError::Observation {
                    reason: format!("failed to run {program}: {e}"),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(WatchError::Observation {
                    reason: format!("{program} exited with {}: {}", output.status, stderr.trim()),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_pod_list(&stdout)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: PodMeta,
    spec: PodSpec,
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodMeta {
    name: String,
    namespace: Option<String>,
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OwnerReference {
    kind: String,
    name: String,
    controller: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    conditions: Vec<PodCondition>,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContainerStatus {
    restart_count: i64,
}

impl Pod {
    fn owner(&self) -> Option<String> {
        let refs = &self.metadata.owner_references;
        let owner = refs
            .iter()
            .find(|r| r.controller == Some(true))
            .or_else(|| refs.first())?;

        if owner.kind == "ReplicaSet" {
            Some(strip_template_hash(&owner.name).to_string())
        } else {
            Some(owner.name.clone())
        }
    }

    fn into_record(self) -> InstanceRecord {
        let owner = self.owner();
        let ready = self
            .status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True");
        let restart_count = self
            .status
            .container_statuses
            .iter()
            .map(|c| c.restart_count)
            .sum();

        InstanceRecord {
            namespace: self.metadata.namespace.unwrap_or_else(|| "default".to_string()),
            name: self.metadata.name,
            owner,
            phase: self.status.phase,
            ready,
            restart_count,
            node: self.spec.node_name,
            last_seen: None,
        }
    }
}

/// Decodes a Kubernetes `PodList` document into instance records.
///
/// # Errors
///
/// Returns `WatchError::Observation` if the document is not valid JSON.
pub fn parse_pod_list(json: &str) -> Result<Vec<InstanceRecord>> {
    let list: PodList = serde_json::from_str(json).map_err(|e| WatchError::Observation {
        reason: format!("failed to parse pod list: {e}"),
    })?;
    Ok(list.items.into_iter().map(Pod::into_record).collect())
}

/// Decodes either a JSON array of instance records or a `PodList`.
///
/// # Errors
///
/// Returns `WatchError::Observation` if the document matches neither shape.
pub fn parse_records(json: &str) -> Result<Vec<InstanceRecord>> {
    if json.trim_start().starts_with('[') {
        serde_json::from_str(json).map_err(|e| WatchError::Observation {
            reason: format!("failed to parse instance records: {e}"),
        })
    } else {
        parse_pod_list(json)
    }
}

/// A scripted source for testing.
///
/// Returns queued observations in order; once the queue is empty it keeps
/// returning the last successful observation.
#[derive(Debug, Default)]
pub struct FakeSource {
    queue: Mutex<VecDeque<Result<Vec<InstanceRecord>>>>,
    last: Mutex<Vec<InstanceRecord>>,
    calls: Mutex<usize>,
    delay: Option<Duration>,
}

impl FakeSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every observation by `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a successful observation.
    pub fn push_ok(&self, records: Vec<InstanceRecord>) {
        self.queue.lock().push_back(Ok(records));
    }

    /// Queues a failed observation.
    pub fn push_err(&self, reason: impl Into<String>) {
        self.queue.lock().push_back(Err(WatchError::Observation {
            reason: reason.into(),
        }));
    }

    /// Returns how many times the source was observed.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }

    fn next(&self) -> Result<Vec<InstanceRecord>> {
        *self.calls.lock() += 1;
        match self.queue.lock().pop_front() {
            Some(Ok(records)) => {
                self.last.lock().clone_from(&records);
                Ok(records)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().clone()),
        }
    }
}

impl ObservationSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn observe(&self) -> impl Future<Output = Result<Vec<InstanceRecord>>> + Send {
        let next = self.next();
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next
        }
    }
}
