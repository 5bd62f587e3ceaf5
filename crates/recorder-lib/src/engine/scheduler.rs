//! Periodic driver of the recording cycle
//!
//! Fetches a snapshot on every tick and runs the cycle on a blocking
//! thread. Failures are logged and reflected in the health registry; the
//! loop itself only stops on shutdown.

use super::{CycleEngine, CycleReport};
use crate::error::Phase;
use crate::health::{component_for, components, HealthRegistry};
use crate::observability::{RecorderMetrics, StructuredLogger};
use crate::source::SnapshotSource;
use anyhow::{Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// What happened on one tick
#[derive(Debug)]
pub enum TickOutcome {
    Completed(Box<CycleReport>),
    Aborted { phase: Phase, error: String },
    /// No snapshot could be read; nothing was written
    SourceFailed(String),
    /// The cycle panicked; its open transaction rolled back on unwind
    Panicked(String),
}

/// Run `f`, turning a panic into its message
fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct RecorderLoop {
    /// Taken while a cycle runs on the blocking pool
    engine: Option<CycleEngine>,
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    health: HealthRegistry,
    metrics: RecorderMetrics,
    logger: StructuredLogger,
}

impl RecorderLoop {
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn engine(&self) -> Option<&CycleEngine> {
        self.engine.as_ref()
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            source = %self.source.describe(),
            "Starting recorder loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await?;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down recorder loop");
                    break;
                }
            }
        }

        self.logger.log_shutdown("shutdown signal");
        Ok(())
    }

    /// Fetch one snapshot and record it
    ///
    /// A panicking cycle is caught on the blocking thread, so the engine is
    /// always handed back. Errors only when the blocking task itself could
    /// not be joined.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let snapshot = match self.source.fetch().await {
            Ok(snapshot) => {
                self.health.set_healthy(components::SOURCE).await;
                snapshot
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                let engine = self.engine.as_mut().context("Cycle engine is not available")?;
                engine.skip_cycle();
                self.logger.log_snapshot_unavailable(engine.ticks(), &reason);
                self.health.set_degraded(components::SOURCE, reason.clone()).await;
                return Ok(TickOutcome::SourceFailed(reason));
            }
        };

        let mut engine = self.engine.take().context("Cycle engine is not available")?;
        let start = Instant::now();
        let (engine, result) = tokio::task::spawn_blocking(move || {
            let result = catch_panic(|| engine.run_cycle(&snapshot));
            (engine, result)
        })
        .await
        .context("Recording cycle task was cancelled")?;
        let elapsed = start.elapsed();
        let tick = engine.ticks();
        let tracked = engine.pipeline().counters().len();
        self.engine = Some(engine);

        self.metrics.observe_cycle_latency(elapsed.as_secs_f64());
        self.metrics.set_tracked_counters(tracked);

        let result = match result {
            Ok(result) => result,
            Err(message) => {
                self.metrics.inc_cycle_aborts("panic");
                self.logger.log_cycle_aborted(tick, "panic", &message);
                for name in [components::SCHEMA, components::RECONCILER, components::PIPELINE] {
                    self.health
                        .set_degraded(name, format!("Recording cycle panicked: {}", message))
                        .await;
                }
                return Ok(TickOutcome::Panicked(message));
            }
        };

        match result {
            Ok(report) => {
                self.record_success(&report, elapsed).await;
                Ok(TickOutcome::Completed(Box::new(report)))
            }
            Err(e) => {
                let error = e.source.to_string();
                self.metrics.inc_cycle_aborts(e.phase.as_str());
                self.logger.log_cycle_aborted(tick, e.phase.as_str(), &error);
                self.health
                    .set_degraded(component_for(e.phase), format!("{}", e))
                    .await;
                Ok(TickOutcome::Aborted {
                    phase: e.phase,
                    error,
                })
            }
        }
    }

    async fn record_success(&mut self, report: &CycleReport, elapsed: Duration) {
        let totals = report.reconcile.totals();
        for (action, rows) in [
            ("inserted", totals.inserted),
            ("updated", totals.updated),
            ("disabled", totals.disabled),
            ("revived", totals.revived),
        ] {
            if rows > 0 {
                self.metrics.add_reference_rows(action, rows);
            }
        }
        for (family, rows) in &report.ingest.rows {
            self.metrics.add_metric_rows(family.base_name(), *rows);
        }
        self.metrics
            .add_entities_skipped(totals.skipped + report.ingest.skipped);
        self.metrics.inc_cycles_completed();

        self.logger.log_cycle_completed(
            report.tick,
            elapsed.as_millis(),
            totals.inserted,
            totals.disabled,
            report.ingest.total_rows(),
            totals.skipped + report.ingest.skipped,
        );

        if let Some(rollup) = &report.rollup {
            self.metrics
                .observe_rollup_latency(rollup.elapsed.as_secs_f64());
            self.logger.log_rollup(
                rollup.lower,
                rollup.upper,
                rollup.total_rows(),
                rollup.elapsed.as_millis(),
            );
            self.health.set_healthy(components::ROLLUP).await;
        }

        for name in [components::SCHEMA, components::RECONCILER, components::PIPELINE] {
            self.health.set_healthy(name).await;
        }
        self.health.set_ready(true).await;
        debug!(tick = report.tick, "Health updated after cycle");
    }
}

/// Builder for creating the recorder loop
pub struct RecorderLoopBuilder {
    engine: Option<CycleEngine>,
    source: Option<Arc<dyn SnapshotSource>>,
    interval: Option<Duration>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl RecorderLoopBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            source: None,
            interval: None,
            health: None,
            logger: None,
        }
    }

    pub fn engine(mut self, engine: CycleEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Tick interval; defaults to the engine's short interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<RecorderLoop> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("Cycle engine is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Snapshot source is required"))?;
        let interval = self.interval.unwrap_or(engine.config().short_interval);
        if interval.is_zero() {
            anyhow::bail!("Tick interval must be positive");
        }
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new(engine.config().cluster_name.clone()));

        Ok(RecorderLoop {
            engine: Some(engine),
            source,
            interval,
            health: self.health.unwrap_or_default(),
            metrics: RecorderMetrics::new(),
            logger,
        })
    }
}

impl Default for RecorderLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::health::ComponentStatus;
    use crate::models::{ClusterSnapshot, NamespaceInfo, NodeInfo};
    use crate::schema::SchemaCatalog;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed snapshot, failing on the configured calls
    struct MockSource {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl MockSource {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for MockSource {
        async fn fetch(&self) -> Result<ClusterSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_on {
                anyhow::bail!("poller unavailable");
            }
            Ok(snapshot())
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn snapshot() -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot {
            cluster_name: "test".to_string(),
            cluster_address: "10.0.0.1".to_string(),
            namespaces: vec![NamespaceInfo {
                name: "default".to_string(),
                phase: "Active".to_string(),
            }],
            ..ClusterSnapshot::default()
        };
        snapshot.nodes.insert(
            "node-a".to_string(),
            NodeInfo {
                uid: "uid-a".to_string(),
                name: "node-a".to_string(),
                cpu_count: 4,
                ..NodeInfo::default()
            },
        );
        snapshot
    }

    fn engine() -> CycleEngine {
        CycleEngine::new(
            Store::open_in_memory().unwrap(),
            SchemaCatalog::builtin().unwrap(),
            EngineConfig::default(),
        )
    }

    async fn recorder(source: MockSource) -> RecorderLoop {
        let health = HealthRegistry::new();
        health.register_all().await;
        RecorderLoopBuilder::new()
            .engine(engine())
            .source(Arc::new(source))
            .health(health)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_engine_and_source() {
        assert!(RecorderLoopBuilder::new()
            .source(Arc::new(MockSource::new(None)))
            .build()
            .is_err());
        assert!(RecorderLoopBuilder::new().engine(engine()).build().is_err());
        assert!(RecorderLoopBuilder::new()
            .engine(engine())
            .source(Arc::new(MockSource::new(None)))
            .interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_tick_records_snapshot_and_marks_ready() {
        let mut recorder = recorder(MockSource::new(None)).await;

        let report = match recorder.tick().await.unwrap() {
            TickOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        };
        assert_eq!(report.tick, 1);
        assert_eq!(report.reconcile.get(Phase::Node).inserted, 1);
        assert!(recorder.health().readiness().await.ready);
        assert!(recorder.engine().is_some());
    }

    #[tokio::test]
    async fn test_source_failure_degrades_and_counts_tick() {
        let mut recorder = recorder(MockSource::new(Some(0))).await;

        let outcome = recorder.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::SourceFailed(ref reason) if reason.contains("poller unavailable")));
        assert_eq!(
            recorder.health().status_of(components::SOURCE).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(recorder.engine().map(|e| e.ticks()), Some(1));

        // The next fetch succeeds and the source recovers
        assert!(matches!(recorder.tick().await.unwrap(), TickOutcome::Completed(_)));
        assert_eq!(
            recorder.health().status_of(components::SOURCE).await,
            Some(ComponentStatus::Healthy)
        );
    }

    #[test]
    fn test_catch_panic_returns_message() {
        assert_eq!(catch_panic(|| 7), Ok(7));
        assert_eq!(
            catch_panic(|| -> u32 { panic!("bad row") }),
            Err("bad row".to_string())
        );
        let id = 3;
        assert_eq!(
            catch_panic(|| -> u32 { panic!("bad row {}", id) }),
            Err("bad row 3".to_string())
        );
    }

    #[test]
    fn test_engine_survives_panicking_cycle() {
        let mut engine = engine();
        let caught = catch_panic(|| -> u64 {
            engine.skip_cycle();
            panic!("mid-cycle failure");
        });

        assert_eq!(caught, Err("mid-cycle failure".to_string()));
        assert_eq!(engine.ticks(), 1);
        let report = engine.run_cycle(&snapshot()).unwrap();
        assert_eq!(report.tick, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let recorder = recorder(MockSource::new(None)).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(recorder.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
