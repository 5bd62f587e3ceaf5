//! The recording cycle
//!
//! One tick runs, in order: clock management (optional), schema check,
//! reference reconciliation, metric ingestion and, when the rollup gate
//! opens, the average rollup. The first failing phase ends the tick; the
//! next tick starts again from the stored state.

pub mod scheduler;

#[cfg(test)]
mod tests;

pub use scheduler::{RecorderLoop, RecorderLoopBuilder, TickOutcome};

use crate::error::{CycleError, Phase, PhaseContext};
use crate::metrics::{IngestReport, MetricPipeline};
use crate::models::ClusterSnapshot;
use crate::reconcile::{ManagerIdentity, ReconcileReport, ReferenceReconciler};
use crate::rollup::{AverageRollupScheduler, RollupGate, RollupReport};
use crate::schema::{EnsureReport, SchemaCatalog};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// Settings of the cycle engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub manager: ManagerIdentity,
    /// Cluster name used when the snapshot has none
    pub cluster_name: String,
    pub short_interval: Duration,
    pub long_interval: Duration,
    /// Minutes added to the tick counter to form the agent time
    pub bias_minutes: i64,
    /// Advance `ontuneinfo` to the wall clock at the start of every tick
    pub manage_clock: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manager: ManagerIdentity {
                name: "kube-recorder".to_string(),
                ip: "127.0.0.1".to_string(),
            },
            cluster_name: "kubernetes".to_string(),
            short_interval: Duration::from_secs(10),
            long_interval: Duration::from_secs(600),
            bias_minutes: 0,
            manage_clock: true,
        }
    }
}

/// Everything one completed tick wrote
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub tick: u64,
    pub schema: EnsureReport,
    pub reconcile: ReconcileReport,
    pub ingest: IngestReport,
    /// Present on ticks that ran the rollup
    pub rollup: Option<RollupReport>,
}

/// Owns the store and every stage of the cycle
///
/// Not shared: the scheduler moves it onto a blocking thread for each
/// tick, so two cycles never overlap.
pub struct CycleEngine {
    store: Store,
    catalog: SchemaCatalog,
    reconciler: ReferenceReconciler,
    pipeline: MetricPipeline,
    rollup: AverageRollupScheduler,
    gate: RollupGate,
    config: EngineConfig,
    ticks: u64,
}

impl CycleEngine {
    pub fn new(store: Store, catalog: SchemaCatalog, config: EngineConfig) -> Self {
        Self {
            store,
            catalog,
            reconciler: ReferenceReconciler::new(config.manager.clone(), config.cluster_name.clone()),
            pipeline: MetricPipeline::new(),
            rollup: AverageRollupScheduler::new(config.long_interval),
            gate: RollupGate::new(config.short_interval, config.long_interval),
            config,
            ticks: 0,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn pipeline(&self) -> &MetricPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one tick against the wall clock
    pub fn run_cycle(&mut self, snapshot: &ClusterSnapshot) -> Result<CycleReport, CycleError> {
        self.run_cycle_at(snapshot, Utc::now())
    }

    /// Account for a tick that had no snapshot to record
    ///
    /// The rollup gate still advances so rollups stay aligned to the long
    /// interval.
    pub fn skip_cycle(&mut self) {
        self.ticks += 1;
        if self.gate.advance() {
            debug!(tick = self.ticks, "Rollup due on a skipped tick, not run");
        }
    }

    /// Run one tick; `now` picks the day partition and, with clock
    /// management on, the new tick counter
    pub fn run_cycle_at(
        &mut self,
        snapshot: &ClusterSnapshot,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, CycleError> {
        self.ticks += 1;
        let rollup_due = self.gate.advance();
        let today = now.date_naive();

        if self.config.manage_clock {
            // Every later phase stamps rows with this clock
            self.store
                .advance_clock(now.timestamp(), self.config.bias_minutes)
                .in_phase(Phase::Schema)?;
        }

        let schema = self
            .catalog
            .ensure(self.store.connection_mut(), today)
            .in_phase(Phase::Schema)?;

        let (maps, reconcile) = self
            .reconciler
            .reconcile(self.store.connection_mut(), snapshot)?;

        let ingest = self
            .pipeline
            .ingest(self.store.connection_mut(), snapshot, &maps, today)?;

        let rollup = if rollup_due {
            Some(
                self.rollup
                    .rollup(self.store.connection_mut(), &self.catalog, today)?,
            )
        } else {
            None
        };

        Ok(CycleReport {
            tick: self.ticks,
            schema,
            reconcile,
            ingest,
            rollup,
        })
    }
}
