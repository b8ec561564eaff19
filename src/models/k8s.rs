// Reconciled cluster view: keys, inbound events, stored records, derived jobs.
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const POD_KIND: &str = "Pod";
pub const JOB_KIND: &str = "Job";

/// Identity of a watched resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, POD_KIND, name)
    }

    pub fn is_pod(&self) -> bool {
        self.kind == POD_KIND
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Upsert,
    Delete,
}

/// One decoded inbound frame, tagged with the namespace of the watch it
/// arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEvent {
    pub action: EventAction,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub status: String,
    pub containers: Vec<String>,
    pub labels: HashMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub image: Option<String>,
    /// The frame exactly as received.
    pub raw: serde_json::Value,
}

impl ResourceEvent {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.kind, &self.name)
    }
}

/// Latest known state of a Pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<String>,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub image: Option<String>,
    /// Store arrival sequence of the first upsert for this key.
    pub first_seen: u64,
    pub last_updated: DateTime<Utc>,
    /// Set while the namespace connection is down.
    pub stale: bool,
}

impl PodRecord {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::pod(&self.namespace, &self.name)
    }

    /// Compares the externally visible fields only; bookkeeping
    /// (`first_seen`, `last_updated`, `stale`) and the raw frame are ignored.
    pub fn matches(&self, event: &ResourceEvent) -> bool {
        self.name == event.name
            && self.namespace == event.namespace
            && self.status == event.status
            && self.containers == event.containers
            && self.labels == event.labels
            && self.owner_references == event.owner_references
            && self.creation_timestamp == event.creation_timestamp
            && self.image == event.image
    }
}

/// Latest frame for a kind the client does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueResource {
    pub key: ResourceKey,
    pub raw: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Completed,
    Failed,
    Running,
    /// Raw status of the representative pod, kept verbatim.
    Other(String),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Completed => f.write_str("Completed"),
            JobStatus::Failed => f.write_str("Failed"),
            JobStatus::Running => f.write_str("Running"),
            JobStatus::Other(raw) => f.write_str(raw),
        }
    }
}

/// A Job derived from the pods that belong to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredJob {
    pub name: String,
    pub namespace: String,
    pub status: JobStatus,
    pub representative_image: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub pod_count: usize,
}

/// A single container addressed by log and exec streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl StreamTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}
