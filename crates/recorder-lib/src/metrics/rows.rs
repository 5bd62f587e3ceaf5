//! Typed rows of the realtime metric tables

use super::derive::FsUsage;
use crate::error::RecorderError;
use crate::schema::MetricFamily;
use crate::store::Clock;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction};

/// A row of one metric family
///
/// Stored column order is the family's key columns, `_ontunetime`,
/// `_agenttime`, then `VALUE_COLUMNS`.
pub trait MetricRow {
    const FAMILY: MetricFamily;
    const VALUE_COLUMNS: &'static [&'static str];

    fn keys(&self) -> Vec<i64>;
    fn values(&self) -> Vec<Value>;
}

/// Append one row to a realtime table
pub fn insert_row<R: MetricRow>(
    tx: &Transaction<'_>,
    table: &str,
    clock: Clock,
    row: &R,
) -> Result<(), RecorderError> {
    let keys = R::FAMILY.key_columns();
    let columns: Vec<&str> = keys
        .iter()
        .copied()
        .chain(["_ontunetime", "_agenttime"])
        .chain(R::VALUE_COLUMNS.iter().copied())
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    );

    let mut values: Vec<Value> = row.keys().into_iter().map(Value::Integer).collect();
    values.push(Value::Integer(clock.ontune_time));
    values.push(Value::Integer(clock.agent_time));
    values.extend(row.values());

    tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    Ok(())
}

/// CPU and memory block shared by node, system-container, pod and container rows
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub swap_percent: f64,
    pub memory_size: i64,
    pub memory_rss: i64,
}

const USAGE_COLUMNS: [&str; 5] = ["_cpuusage", "_memoryused", "_swapused", "_memorysize", "_memoryrss"];

impl Usage {
    fn push(&self, values: &mut Vec<Value>) {
        values.push(Value::Real(self.cpu_percent));
        values.push(Value::Real(self.memory_percent));
        values.push(Value::Real(self.swap_percent));
        values.push(Value::Integer(self.memory_size));
        values.push(Value::Integer(self.memory_rss));
    }
}

fn push_network(network: &[i64], values: &mut Vec<Value>) {
    values.extend(network.iter().map(|v| Value::Integer(*v)));
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodePerfRow {
    pub node_id: i64,
    pub usage: Usage,
    /// Interval deltas: rx+tx, rx, tx, rx errors, tx errors
    pub network: Vec<i64>,
    pub fs: FsUsage,
    pub image_fs_percent: f64,
    pub max_pid: i64,
    pub process_count: i64,
}

impl MetricRow for NodePerfRow {
    const FAMILY: MetricFamily = MetricFamily::NodePerf;
    const VALUE_COLUMNS: &'static [&'static str] = &[
        USAGE_COLUMNS[0],
        USAGE_COLUMNS[1],
        USAGE_COLUMNS[2],
        USAGE_COLUMNS[3],
        USAGE_COLUMNS[4],
        "_netiorate",
        "_netirate",
        "_netorate",
        "_netierror",
        "_netoerror",
        "_fsusage",
        "_fssize",
        "_fsfree",
        "_fsiusage",
        "_fsisize",
        "_fsifree",
        "_imgfsusage",
        "_maxpid",
        "_proccount",
    ];

    fn keys(&self) -> Vec<i64> {
        vec![self.node_id]
    }

    fn values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(Self::VALUE_COLUMNS.len());
        self.usage.push(&mut values);
        push_network(&self.network, &mut values);
        values.extend([
            Value::Real(self.fs.percent),
            Value::Integer(self.fs.total),
            Value::Integer(self.fs.free),
            Value::Real(self.fs.inode_percent),
            Value::Integer(self.fs.inode_total),
            Value::Integer(self.fs.inode_free),
            Value::Real(self.image_fs_percent),
            Value::Integer(self.max_pid),
            Value::Integer(self.process_count),
        ]);
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSyscoRow {
    pub node_id: i64,
    pub system_container_id: i64,
    pub usage: Usage,
}

impl MetricRow for NodeSyscoRow {
    const FAMILY: MetricFamily = MetricFamily::NodeSysco;
    const VALUE_COLUMNS: &'static [&'static str] = &USAGE_COLUMNS;

    fn keys(&self) -> Vec<i64> {
        vec![self.node_id, self.system_container_id]
    }

    fn values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(Self::VALUE_COLUMNS.len());
        self.usage.push(&mut values);
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodPerfRow {
    pub pod_id: i64,
    pub usage: Usage,
    pub network: Vec<i64>,
    pub volume_used: i64,
    pub volume_inodes_used: i64,
    pub ephemeral_used: i64,
    pub ephemeral_inodes_used: i64,
    pub process_count: i64,
}

impl MetricRow for PodPerfRow {
    const FAMILY: MetricFamily = MetricFamily::PodPerf;
    const VALUE_COLUMNS: &'static [&'static str] = &[
        USAGE_COLUMNS[0],
        USAGE_COLUMNS[1],
        USAGE_COLUMNS[2],
        USAGE_COLUMNS[3],
        USAGE_COLUMNS[4],
        "_netiorate",
        "_netirate",
        "_netorate",
        "_netierror",
        "_netoerror",
        "_volused",
        "_voliused",
        "_epstused",
        "_epstiused",
        "_proccount",
    ];

    fn keys(&self) -> Vec<i64> {
        vec![self.pod_id]
    }

    fn values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(Self::VALUE_COLUMNS.len());
        self.usage.push(&mut values);
        push_network(&self.network, &mut values);
        values.extend([
            Value::Integer(self.volume_used),
            Value::Integer(self.volume_inodes_used),
            Value::Integer(self.ephemeral_used),
            Value::Integer(self.ephemeral_inodes_used),
            Value::Integer(self.process_count),
        ]);
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPerfRow {
    pub container_id: i64,
    pub usage: Usage,
    pub rootfs_used: i64,
    pub rootfs_inodes_used: i64,
    pub logs_used: i64,
    pub logs_inodes_used: i64,
}

impl MetricRow for ContainerPerfRow {
    const FAMILY: MetricFamily = MetricFamily::ContainerPerf;
    const VALUE_COLUMNS: &'static [&'static str] = &[
        USAGE_COLUMNS[0],
        USAGE_COLUMNS[1],
        USAGE_COLUMNS[2],
        USAGE_COLUMNS[3],
        USAGE_COLUMNS[4],
        "_rootfsused",
        "_rootfsiused",
        "_logfsused",
        "_logfsiused",
    ];

    fn keys(&self) -> Vec<i64> {
        vec![self.container_id]
    }

    fn values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(Self::VALUE_COLUMNS.len());
        self.usage.push(&mut values);
        values.extend([
            Value::Integer(self.rootfs_used),
            Value::Integer(self.rootfs_inodes_used),
            Value::Integer(self.logs_used),
            Value::Integer(self.logs_inodes_used),
        ]);
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodNetRow {
    pub pod_id: i64,
    pub device_id: i64,
    pub network: Vec<i64>,
}

impl MetricRow for PodNetRow {
    const FAMILY: MetricFamily = MetricFamily::PodNet;
    const VALUE_COLUMNS: &'static [&'static str] =
        &["_netiorate", "_netirate", "_netorate", "_netierror", "_netoerror"];

    fn keys(&self) -> Vec<i64> {
        vec![self.pod_id, self.device_id]
    }

    fn values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(Self::VALUE_COLUMNS.len());
        push_network(&self.network, &mut values);
        values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodVolRow {
    pub pod_id: i64,
    pub device_id: i64,
    pub used: i64,
    pub inodes_used: i64,
}

impl MetricRow for PodVolRow {
    const FAMILY: MetricFamily = MetricFamily::PodVol;
    const VALUE_COLUMNS: &'static [&'static str] = &["_used", "_iused"];

    fn keys(&self) -> Vec<i64> {
        vec![self.pod_id, self.device_id]
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Integer(self.used), Value::Integer(self.inodes_used)]
    }
}

/// The single per-node row of `kubelastrealtimeperf`
#[derive(Debug, Clone, PartialEq)]
pub struct LastPerfRow {
    pub node_id: i64,
    pub usage: Usage,
    /// rx+tx delta since the previous tick
    pub network: i64,
    pub fs: FsUsage,
    pub image_fs_percent: f64,
    pub process_count: i64,
}

impl LastPerfRow {
    /// Replace the node's row
    pub fn upsert(&self, tx: &Transaction<'_>, clock: Clock) -> Result<(), RecorderError> {
        tx.prepare_cached("DELETE FROM kubelastrealtimeperf WHERE _nodeid = ?1")?
            .execute([self.node_id])?;
        tx.prepare_cached(
            "INSERT INTO kubelastrealtimeperf (
                _nodeid, _ontunetime, _cpuusage, _memoryused, _swapused, _memorysize,
                _memoryrss, _netusage, _fsusage, _fssize, _fsiusage, _imgfsusage, _proccount
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?
        .execute(rusqlite::params![
            self.node_id,
            clock.ontune_time,
            self.usage.cpu_percent,
            self.usage.memory_percent,
            self.usage.swap_percent,
            self.usage.memory_size,
            self.usage.memory_rss,
            self.network,
            self.fs.percent,
            self.fs.total,
            self.fs.inode_percent,
            self.image_fs_percent,
            self.process_count,
        ])?;
        Ok(())
    }
}
