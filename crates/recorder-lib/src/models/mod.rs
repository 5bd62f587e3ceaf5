//! Core data models for the recorder
//!
//! The snapshot structures produced by the cluster poller: topology objects
//! keyed the way the reconciler diffs them, plus the kubelet stats feed.

mod stats;
mod topology;

pub use stats::{
    ContainerStats, CpuStats, FsStats, InterfaceStats, MemoryStats, NetworkStats, NodeStats,
    PodReference, PodStats, ProcessStats, RlimitStats, RuntimeStats, SwapStats, VolumeStats,
};
pub use topology::{
    unix_seconds, ClusterSnapshot, ContainerSpec, DaemonSetInfo, DeploymentInfo, NamespaceInfo,
    NodeInfo, ObjectKind, OwnerRef, PodInfo, ReplicaSetInfo, ServiceInfo, StatefulSetInfo,
};
