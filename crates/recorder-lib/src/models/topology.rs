//! Cluster topology as seen by one snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::stats::{NodeStats, PodStats};

/// One poll of the cluster: topology objects plus the kubelet stats feed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub cluster_name: String,
    /// API endpoint address; identifies the cluster under its manager
    pub cluster_address: String,
    pub namespaces: Vec<NamespaceInfo>,
    /// Keyed by node name
    pub nodes: BTreeMap<String, NodeInfo>,
    /// Keyed by pod UID
    pub pods: BTreeMap<String, PodInfo>,
    /// Keyed by service UID
    pub services: BTreeMap<String, ServiceInfo>,
    pub daemonsets: BTreeMap<String, DaemonSetInfo>,
    pub replicasets: BTreeMap<String, ReplicaSetInfo>,
    pub deployments: BTreeMap<String, DeploymentInfo>,
    pub statefulsets: BTreeMap<String, StatefulSetInfo>,
    /// Node-level stats keyed by node name
    pub node_stats: BTreeMap<String, NodeStats>,
    /// Per-pod stats keyed by the name of the node reporting them
    pub pod_stats: BTreeMap<String, Vec<PodStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    /// Namespace phase, e.g. `Active` or `Terminating`
    pub phase: String,
}

/// Node descriptive fields from the node object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub uid: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub kernel_version: String,
    pub os_image: String,
    pub os_name: String,
    pub container_runtime_version: String,
    pub kubelet_version: String,
    pub kube_proxy_version: String,
    pub cpu_arch: String,
    /// CPU capacity in whole cores
    pub cpu_count: u32,
    pub ephemeral_storage_bytes: i64,
    pub memory_bytes: i64,
    pub pod_capacity: i64,
    pub ip: String,
    /// False when the stats endpoint could not be reached this poll
    pub connected: bool,
}

/// Owner reference captured from an object's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub uid: String,
}

/// Container template reported by a workload object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: String,
    pub env: String,
    pub resources: String,
    pub volume_mounts: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodInfo {
    pub uid: String,
    /// Static-pod UID from the `kubernetes.io/config.hash` (or `config.mirror`) annotation
    pub annotation_uid: String,
    pub name: String,
    pub namespace: String,
    /// Empty when the pod is not scheduled yet
    pub node_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub restart_policy: String,
    pub service_account: String,
    pub phase: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub restart_count: i64,
    pub restart_time: Option<DateTime<Utc>>,
    pub condition: String,
    pub owner: Option<OwnerRef>,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<DateTime<Utc>>,
    pub service_type: String,
    pub cluster_ip: String,
    pub ports: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<DateTime<Utc>>,
    pub service_account: String,
    pub replicas: i64,
    pub updated_replicas: i64,
    pub ready_replicas: i64,
    pub available_replicas: i64,
    pub observed_generation: i64,
    pub selector: String,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulSetInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<DateTime<Utc>>,
    pub service_account: String,
    pub replicas: i64,
    pub ready_replicas: i64,
    pub available_replicas: i64,
    pub selector: String,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSetInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<DateTime<Utc>>,
    pub service_account: String,
    pub current_scheduled: i64,
    pub desired_scheduled: i64,
    pub ready: i64,
    pub updated_scheduled: i64,
    pub available: i64,
    pub selector: String,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSetInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<DateTime<Utc>>,
    pub replicas: i64,
    pub fully_labeled_replicas: i64,
    pub ready_replicas: i64,
    pub available_replicas: i64,
    pub observed_generation: i64,
    pub selector: String,
    pub owner: Option<OwnerRef>,
    pub containers: Vec<ContainerSpec>,
}

/// Object kinds that can own pods, replicasets or container templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Pod,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
}

impl ObjectKind {
    /// Kind name as reported by the Kubernetes API
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "Pod",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::ReplicaSet => "ReplicaSet",
        }
    }

    /// Parse an API kind name; unknown kinds (Job, Node, ...) yield `None`
    pub fn from_api(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(ObjectKind::Pod),
            "Deployment" => Some(ObjectKind::Deployment),
            "StatefulSet" => Some(ObjectKind::StatefulSet),
            "DaemonSet" => Some(ObjectKind::DaemonSet),
            "ReplicaSet" => Some(ObjectKind::ReplicaSet),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch, 0 when the source omitted the timestamp
pub fn unix_seconds(ts: Option<&DateTime<Utc>>) -> i64 {
    ts.map(|t| t.timestamp()).unwrap_or(0)
}
