//! Error types for the recording cycle

use std::fmt;
use thiserror::Error;

/// Failures raised while writing to the store
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid schema definition: {0}")]
    Schema(String),

    #[error("time synchronization record is missing from ontuneinfo")]
    MissingClock,

    #[error("no live node could be resolved for cluster {0}")]
    EmptyNodeCatalog(i64),

    #[error("{table} row for {key} could not be read back after insert")]
    Unresolved { table: &'static str, key: String },
}

/// Stage of a recording cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Schema,
    Manager,
    Cluster,
    Namespace,
    Node,
    NodeSystemContainer,
    Service,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Pod,
    ContainerSpec,
    ContainerInstance,
    Device,
    LastRealtimePerf,
    Realtime,
    Rollup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Schema => "schema",
            Phase::Manager => "manager",
            Phase::Cluster => "cluster",
            Phase::Namespace => "namespace",
            Phase::Node => "node",
            Phase::NodeSystemContainer => "node_system_container",
            Phase::Service => "service",
            Phase::Deployment => "deployment",
            Phase::StatefulSet => "statefulset",
            Phase::DaemonSet => "daemonset",
            Phase::ReplicaSet => "replicaset",
            Phase::Pod => "pod",
            Phase::ContainerSpec => "container_spec",
            Phase::ContainerInstance => "container_instance",
            Phase::Device => "device",
            Phase::LastRealtimePerf => "last_realtime_perf",
            Phase::Realtime => "realtime",
            Phase::Rollup => "rollup",
        }
    }

    /// Whether the phase belongs to reference reconciliation
    pub fn is_reference(&self) -> bool {
        !matches!(
            self,
            Phase::Schema | Phase::LastRealtimePerf | Phase::Realtime | Phase::Rollup
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase failure that aborts the rest of the cycle
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct CycleError {
    pub phase: Phase,
    #[source]
    pub source: RecorderError,
}

impl CycleError {
    pub fn new(phase: Phase, source: impl Into<RecorderError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// Attach the failing phase to a store result
pub trait PhaseContext<T> {
    fn in_phase(self, phase: Phase) -> Result<T, CycleError>;
}

impl<T, E: Into<RecorderError>> PhaseContext<T> for Result<T, E> {
    fn in_phase(self, phase: Phase) -> Result<T, CycleError> {
        self.map_err(|e| CycleError::new(phase, e))
    }
}
