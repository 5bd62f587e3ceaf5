//! Recorder library for Kubernetes cluster state and performance history
//!
//! This crate provides the core functionality for:
//! - Reconciling cluster topology into soft-deleted reference tables
//! - Converting kubelet stats into day-partitioned metric rows
//! - Windowed average rollups of the raw partitions
//! - Health checks and observability

pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod reconcile;
pub mod rollup;
pub mod schema;
pub mod source;
pub mod store;

pub use engine::{CycleEngine, CycleReport, EngineConfig, RecorderLoop, RecorderLoopBuilder, TickOutcome};
pub use error::{CycleError, Phase, RecorderError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RecorderMetrics, StructuredLogger};
pub use reconcile::ManagerIdentity;
pub use schema::{MetricFamily, SchemaCatalog};
pub use source::{FileSnapshotSource, SnapshotSource};
pub use store::Store;
