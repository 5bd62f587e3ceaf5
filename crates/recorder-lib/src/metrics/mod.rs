//! Metric ingestion
//!
//! Runs after reconciliation with the refreshed id maps and writes two
//! stages, each in its own transaction:
//! - the last-known table (`kubelastrealtimeperf`), one row per node
//! - the day's `realtime*` tables, one row per resolved entity
//!
//! Network counters go through the `CounterDeltaTracker`; baselines only
//! move once the stage that used them has committed.

pub mod counters;
pub mod derive;
pub mod rows;

pub use counters::{delta, CounterDeltaTracker, CounterGroup, StagedCounters};
pub use derive::FsUsage;
pub use rows::{
    insert_row, ContainerPerfRow, LastPerfRow, MetricRow, NodePerfRow, NodeSyscoRow, PodNetRow,
    PodPerfRow, PodVolRow, Usage,
};

use crate::error::{CycleError, Phase, PhaseContext, RecorderError};
use crate::models::{
    ClusterSnapshot, ContainerStats, CpuStats, MemoryStats, NodeStats, PodStats, SwapStats,
};
use crate::reconcile::{DeviceType, IdMaps};
use crate::schema::MetricFamily;
use crate::store::{read_clock, realtime_table, record_table_update, to_db, Clock};
use chrono::NaiveDate;
use rusqlite::{Connection, Transaction};
use std::collections::HashMap;
use tracing::debug;

/// Rows written by one ingest
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub last_known: usize,
    pub rows: HashMap<MetricFamily, usize>,
    /// Entities with stats that could not be resolved to an id
    pub skipped: usize,
}

impl IngestReport {
    pub fn rows_for(&self, family: MetricFamily) -> usize {
        self.rows.get(&family).copied().unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

/// CPU, memory and swap figures; CPU percent is relative to the node's cores
fn usage(
    cpu_cores: u32,
    cpu: Option<&CpuStats>,
    memory: Option<&MemoryStats>,
    swap: Option<&SwapStats>,
) -> Usage {
    Usage {
        cpu_percent: derive::cpu_percent(cpu, cpu_cores),
        memory_percent: derive::memory_percent(memory),
        swap_percent: derive::swap_percent(swap),
        memory_size: derive::memory_size(memory),
        memory_rss: derive::memory_rss(memory),
    }
}

fn node_usage(cpu_cores: u32, stats: &NodeStats) -> Usage {
    usage(cpu_cores, stats.cpu.as_ref(), stats.memory.as_ref(), stats.swap.as_ref())
}

fn container_usage(cpu_cores: u32, stats: &ContainerStats) -> Usage {
    usage(cpu_cores, stats.cpu.as_ref(), stats.memory.as_ref(), stats.swap.as_ref())
}

fn image_fs_percent(stats: &NodeStats) -> f64 {
    let image_fs = stats.runtime.as_ref().and_then(|r| r.image_fs.as_ref());
    FsUsage::from_stats(image_fs).percent
}

/// A node with both an id and a stats sample this tick
struct LiveNode<'a> {
    name: &'a str,
    id: i64,
    cpu_cores: u32,
    stats: &'a NodeStats,
}

fn live_nodes<'a>(snapshot: &'a ClusterSnapshot, maps: &IdMaps) -> Vec<LiveNode<'a>> {
    snapshot
        .nodes
        .iter()
        .filter_map(|(name, node)| {
            let id = *maps.nodes.get(name)?;
            let stats = snapshot.node_stats.get(name)?;
            Some(LiveNode {
                name: name.as_str(),
                id,
                cpu_cores: node.cpu_count,
                stats,
            })
        })
        .collect()
}

/// Converts one snapshot's stats into metric rows
#[derive(Debug, Default)]
pub struct MetricPipeline {
    counters: CounterDeltaTracker,
}

impl MetricPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &CounterDeltaTracker {
        &self.counters
    }

    /// Write the last-known rows, then the realtime rows for `day`
    pub fn ingest(
        &self,
        conn: &mut Connection,
        snapshot: &ClusterSnapshot,
        maps: &IdMaps,
        day: NaiveDate,
    ) -> Result<IngestReport, CycleError> {
        let nodes = live_nodes(snapshot, maps);

        let last_known = self
            .write_last_known(conn, &nodes)
            .in_phase(Phase::LastRealtimePerf)?;

        let mut report = self
            .write_realtime(conn, snapshot, maps, &nodes, day)
            .in_phase(Phase::Realtime)?;
        report.last_known = last_known;

        debug!(
            last_known = report.last_known,
            rows = report.total_rows(),
            skipped = report.skipped,
            "Metric ingest complete"
        );
        Ok(report)
    }

    fn write_last_known(&self, conn: &mut Connection, nodes: &[LiveNode<'_>]) -> Result<usize, RecorderError> {
        let tx = conn.transaction()?;
        let clock = read_clock(&tx)?;
        let mut staged = self.counters.stage();

        for node in nodes {
            let total = derive::network_totals(node.stats.interfaces())[0];
            let network = staged.advance(CounterGroup::LastRealtimePerf, node.name, vec![total])[0];
            let row = LastPerfRow {
                node_id: node.id,
                usage: node_usage(node.cpu_cores, node.stats),
                network,
                fs: FsUsage::from_stats(node.stats.fs.as_ref()),
                image_fs_percent: image_fs_percent(node.stats),
                process_count: to_db(
                    node.stats
                        .rlimit
                        .as_ref()
                        .and_then(|r| r.curproc)
                        .unwrap_or(0),
                ),
            };
            row.upsert(&tx, clock)?;
        }

        if !nodes.is_empty() {
            record_table_update(&tx, "kubelastrealtimeperf", clock.ontune_time)?;
        }
        tx.commit()?;
        staged.commit();
        Ok(nodes.len())
    }

    fn write_realtime(
        &self,
        conn: &mut Connection,
        snapshot: &ClusterSnapshot,
        maps: &IdMaps,
        nodes: &[LiveNode<'_>],
        day: NaiveDate,
    ) -> Result<IngestReport, RecorderError> {
        let tx = conn.transaction()?;
        let mut writer = RealtimeWriter {
            tx: &tx,
            clock: read_clock(&tx)?,
            day,
            // Pods absent from this tick's stats lose their baselines
            staged: self.counters.stage().pruning(&[CounterGroup::PodPerf, CounterGroup::PodNet]),
            report: IngestReport::default(),
        };

        for node in nodes {
            writer.node(maps, node)?;
            if let Some(pods) = snapshot.pod_stats.get(node.name) {
                for pod in pods {
                    writer.pod(maps, node, pod)?;
                }
            }
        }

        let RealtimeWriter {
            clock,
            staged,
            report,
            ..
        } = writer;
        for (family, rows) in &report.rows {
            if *rows > 0 {
                record_table_update(&tx, &realtime_table(family.base_name(), day), clock.ontune_time)?;
            }
        }
        tx.commit()?;
        staged.commit();
        Ok(report)
    }
}

/// State of one realtime write transaction
struct RealtimeWriter<'t, 'c, 's> {
    tx: &'t Transaction<'c>,
    clock: Clock,
    day: NaiveDate,
    staged: StagedCounters<'s>,
    report: IngestReport,
}

impl RealtimeWriter<'_, '_, '_> {
    fn write<R: MetricRow>(&mut self, row: &R) -> Result<(), RecorderError> {
        let table = realtime_table(R::FAMILY.base_name(), self.day);
        insert_row(self.tx, &table, self.clock, row)?;
        *self.report.rows.entry(R::FAMILY).or_insert(0) += 1;
        Ok(())
    }

    fn node(&mut self, maps: &IdMaps, node: &LiveNode<'_>) -> Result<(), RecorderError> {
        let stats = node.stats;
        let network = self.staged.advance(
            CounterGroup::NodePerf,
            node.name,
            derive::network_totals(stats.interfaces()),
        );
        let rlimit = stats.rlimit.as_ref();
        self.write(&NodePerfRow {
            node_id: node.id,
            usage: node_usage(node.cpu_cores, stats),
            network,
            fs: FsUsage::from_stats(stats.fs.as_ref()),
            image_fs_percent: image_fs_percent(stats),
            max_pid: to_db(rlimit.and_then(|r| r.maxpid).unwrap_or(0)),
            process_count: to_db(rlimit.and_then(|r| r.curproc).unwrap_or(0)),
        })?;

        for container in &stats.system_containers {
            let key = (node.id, container.name.clone());
            let Some(&system_container_id) = maps.system_containers.get(&key) else {
                self.report.skipped += 1;
                continue;
            };
            self.write(&NodeSyscoRow {
                node_id: node.id,
                system_container_id,
                usage: container_usage(node.cpu_cores, container),
            })?;
        }
        Ok(())
    }

    fn pod(&mut self, maps: &IdMaps, node: &LiveNode<'_>, pod: &PodStats) -> Result<(), RecorderError> {
        let Some(pod_id) = maps.pods.resolve(&pod.pod_ref.uid) else {
            debug!(pod = %pod.pod_ref.name, uid = %pod.pod_ref.uid, "Stats pod not resolved, metrics skipped");
            self.report.skipped += 1;
            return Ok(());
        };

        let network = self.staged.advance(
            CounterGroup::PodPerf,
            pod_id.to_string(),
            derive::network_totals(pod.interfaces()),
        );
        let volume_used = pod
            .volume
            .iter()
            .map(|v| to_db(v.fs.used_bytes.unwrap_or(0)))
            .fold(0i64, i64::saturating_add);
        let volume_inodes_used = pod
            .volume
            .iter()
            .map(|v| to_db(v.fs.inodes_used.unwrap_or(0)))
            .fold(0i64, i64::saturating_add);
        let ephemeral = FsUsage::from_stats(pod.ephemeral_storage.as_ref());
        self.write(&PodPerfRow {
            pod_id,
            usage: usage(
                node.cpu_cores,
                pod.cpu.as_ref(),
                pod.memory.as_ref(),
                pod.swap.as_ref(),
            ),
            network,
            volume_used,
            volume_inodes_used,
            ephemeral_used: ephemeral.used,
            ephemeral_inodes_used: ephemeral.inodes_used,
            process_count: to_db(
                pod.process_stats
                    .as_ref()
                    .and_then(|p| p.process_count)
                    .unwrap_or(0),
            ),
        })?;

        for container in &pod.containers {
            let key = (node.id, pod_id, container.name.clone());
            let Some(&container_id) = maps.containers.get(&key) else {
                // Recorded by the next cycle's reconciliation
                debug!(pod_id, container = %container.name, "Container instance not resolved, row skipped");
                self.report.skipped += 1;
                continue;
            };
            let rootfs = FsUsage::from_stats(container.rootfs.as_ref());
            let logs = FsUsage::from_stats(container.logs.as_ref());
            self.write(&ContainerPerfRow {
                container_id,
                usage: container_usage(node.cpu_cores, container),
                rootfs_used: rootfs.used,
                rootfs_inodes_used: rootfs.inodes_used,
                logs_used: logs.used,
                logs_inodes_used: logs.inodes_used,
            })?;
        }

        for interface in pod.interfaces() {
            let Some(device_id) = maps.device_id(DeviceType::Network, &interface.name) else {
                self.report.skipped += 1;
                continue;
            };
            let network = self.staged.advance(
                CounterGroup::PodNet,
                format!("{}_{}", pod_id, device_id),
                derive::network_totals(std::slice::from_ref(interface)),
            );
            self.write(&PodNetRow {
                pod_id,
                device_id,
                network,
            })?;
        }

        for volume in &pod.volume {
            let Some(device_id) = maps.device_id(DeviceType::Volume, &volume.name) else {
                self.report.skipped += 1;
                continue;
            };
            self.write(&PodVolRow {
                pod_id,
                device_id,
                used: to_db(volume.fs.used_bytes.unwrap_or(0)),
                inodes_used: to_db(volume.fs.inodes_used.unwrap_or(0)),
            })?;
        }
        Ok(())
    }
}
