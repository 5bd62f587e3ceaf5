//! Reference-table reconciliation
//!
//! Each cycle diffs the live snapshot against the stored reference rows, one
//! kind at a time in dependency order:
//!
//! manager → cluster → namespace → node → node system container → service →
//! deployment → statefulset → daemonset → replicaset → pod → container spec →
//! container instance → device
//!
//! Every kind runs in its own transaction. After its writes the kind's
//! key → surrogate-id map is reloaded from storage so later kinds resolve
//! foreign keys against committed ids. The first failing kind stops the
//! cycle; kinds before it stay committed.

mod catalog;
mod diff;
mod topology;
mod workloads;

pub use diff::{plan, Plan};

use crate::error::{CycleError, Phase, PhaseContext, RecorderError};
use crate::models::{ClusterSnapshot, ObjectKind};
use crate::store::{read_clock, record_table_update, set_enabled, RefTable, StoredRef};
use rusqlite::{Connection, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// Device catalog partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Network,
    Volume,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Network => "network",
            DeviceType::Volume => "volume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "network" => Some(DeviceType::Network),
            "volume" => Some(DeviceType::Volume),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural identity of a container template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecKey {
    pub kind: ObjectKind,
    pub name: String,
    pub image: String,
}

/// Resolves a stats-feed pod UID to a surrogate pod id
///
/// The stats feed reports static pods under their config hash, which the
/// API server exposes only as an annotation. Lookups try the pod's own UID
/// first, then the annotation UID.
#[derive(Debug, Clone, Default)]
pub struct PodIndex {
    by_uid: HashMap<String, i64>,
    by_annotation: HashMap<String, i64>,
}

impl PodIndex {
    pub fn new(by_uid: HashMap<String, i64>, by_annotation: HashMap<String, i64>) -> Self {
        Self {
            by_uid,
            by_annotation,
        }
    }

    pub fn resolve(&self, uid: &str) -> Option<i64> {
        self.by_uid
            .get(uid)
            .or_else(|| self.by_annotation.get(uid))
            .copied()
    }

    /// Lookup by API server UID only
    pub fn by_uid(&self, uid: &str) -> Option<i64> {
        self.by_uid.get(uid).copied()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

/// Key → surrogate-id maps refreshed during one cycle
#[derive(Debug, Clone, Default)]
pub struct IdMaps {
    pub manager_id: i64,
    pub cluster_id: i64,
    /// By namespace name
    pub namespaces: HashMap<String, i64>,
    /// By node name
    pub nodes: HashMap<String, i64>,
    /// By (node id, container name)
    pub system_containers: HashMap<(i64, String), i64>,
    pub services: HashMap<String, i64>,
    pub deployments: HashMap<String, i64>,
    pub statefulsets: HashMap<String, i64>,
    pub daemonsets: HashMap<String, i64>,
    pub replicasets: HashMap<String, i64>,
    pub pods: PodIndex,
    pub container_specs: HashMap<SpecKey, i64>,
    /// By (node id, pod id, container name)
    pub containers: HashMap<(i64, i64, String), i64>,
    pub devices: HashMap<(DeviceType, String), i64>,
}

impl IdMaps {
    /// Id of a controller referenced by an owner reference
    pub fn owner_id(&self, kind: ObjectKind, uid: &str) -> Option<i64> {
        match kind {
            ObjectKind::Pod => self.pods.by_uid(uid),
            ObjectKind::Deployment => self.deployments.get(uid).copied(),
            ObjectKind::StatefulSet => self.statefulsets.get(uid).copied(),
            ObjectKind::DaemonSet => self.daemonsets.get(uid).copied(),
            ObjectKind::ReplicaSet => self.replicasets.get(uid).copied(),
        }
    }

    pub fn device_id(&self, device_type: DeviceType, name: &str) -> Option<i64> {
        self.devices.get(&(device_type, name.to_string())).copied()
    }
}

/// Row counts written by one kind's pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub disabled: usize,
    pub revived: usize,
    /// Entities left out because a parent could not be resolved
    pub skipped: usize,
}

impl KindOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.disabled + self.revived > 0
    }

    fn absorb(&mut self, other: &KindOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.disabled += other.disabled;
        self.revived += other.revived;
        self.skipped += other.skipped;
    }
}

/// Per-kind outcomes of one reconciliation, in execution order
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub kinds: Vec<(Phase, KindOutcome)>,
}

impl ReconcileReport {
    pub fn get(&self, phase: Phase) -> KindOutcome {
        self.kinds
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, outcome)| *outcome)
            .unwrap_or_default()
    }

    pub fn totals(&self) -> KindOutcome {
        let mut total = KindOutcome::default();
        for (_, outcome) in &self.kinds {
            total.absorb(outcome);
        }
        total
    }

    fn push(&mut self, phase: Phase, outcome: KindOutcome) {
        if outcome.changed() {
            info!(
                kind = %phase,
                inserted = outcome.inserted,
                updated = outcome.updated,
                disabled = outcome.disabled,
                revived = outcome.revived,
                skipped = outcome.skipped,
                "Reference table reconciled"
            );
        } else {
            debug!(kind = %phase, skipped = outcome.skipped, "Reference table unchanged");
        }
        self.kinds.push((phase, outcome));
    }
}

/// Identity of the collector writing the data
#[derive(Debug, Clone)]
pub struct ManagerIdentity {
    pub name: String,
    pub ip: String,
}

/// Synchronizes the reference tables with a snapshot
#[derive(Debug, Clone)]
pub struct ReferenceReconciler {
    manager: ManagerIdentity,
    /// Used when the snapshot carries no cluster name
    default_cluster_name: String,
}

impl ReferenceReconciler {
    pub fn new(manager: ManagerIdentity, default_cluster_name: impl Into<String>) -> Self {
        Self {
            manager,
            default_cluster_name: default_cluster_name.into(),
        }
    }

    /// Run every kind in dependency order, stopping at the first failure
    pub fn reconcile(
        &self,
        conn: &mut Connection,
        snapshot: &ClusterSnapshot,
    ) -> Result<(IdMaps, ReconcileReport), CycleError> {
        let mut maps = IdMaps::default();
        let mut report = ReconcileReport::default();

        maps.manager_id = topology::manager(conn, &self.manager).in_phase(Phase::Manager)?;

        let cluster_name = if snapshot.cluster_name.is_empty() {
            self.default_cluster_name.as_str()
        } else {
            snapshot.cluster_name.as_str()
        };
        maps.cluster_id = topology::cluster(
            conn,
            maps.manager_id,
            cluster_name,
            &snapshot.cluster_address,
        )
        .in_phase(Phase::Cluster)?;

        let (outcome, map) =
            topology::namespaces(conn, &maps, &snapshot.namespaces).in_phase(Phase::Namespace)?;
        maps.namespaces = map;
        report.push(Phase::Namespace, outcome);

        let (outcome, map) =
            topology::nodes(conn, &maps, &snapshot.nodes).in_phase(Phase::Node)?;
        maps.nodes = map;
        report.push(Phase::Node, outcome);

        let (outcome, map) = topology::system_containers(conn, &maps, &snapshot.node_stats)
            .in_phase(Phase::NodeSystemContainer)?;
        maps.system_containers = map;
        report.push(Phase::NodeSystemContainer, outcome);

        let (outcome, map) =
            workloads::services(conn, &maps, &snapshot.services).in_phase(Phase::Service)?;
        maps.services = map;
        report.push(Phase::Service, outcome);

        let (outcome, map) = workloads::deployments(conn, &maps, &snapshot.deployments)
            .in_phase(Phase::Deployment)?;
        maps.deployments = map;
        report.push(Phase::Deployment, outcome);

        let (outcome, map) = workloads::statefulsets(conn, &maps, &snapshot.statefulsets)
            .in_phase(Phase::StatefulSet)?;
        maps.statefulsets = map;
        report.push(Phase::StatefulSet, outcome);

        let (outcome, map) =
            workloads::daemonsets(conn, &maps, &snapshot.daemonsets).in_phase(Phase::DaemonSet)?;
        maps.daemonsets = map;
        report.push(Phase::DaemonSet, outcome);

        let (outcome, map) = workloads::replicasets(conn, &maps, &snapshot.replicasets)
            .in_phase(Phase::ReplicaSet)?;
        maps.replicasets = map;
        report.push(Phase::ReplicaSet, outcome);

        let (outcome, index) = workloads::pods(conn, &maps, &snapshot.pods).in_phase(Phase::Pod)?;
        maps.pods = index;
        report.push(Phase::Pod, outcome);

        let (outcome, map) =
            catalog::container_specs(conn, &maps, snapshot).in_phase(Phase::ContainerSpec)?;
        maps.container_specs = map;
        report.push(Phase::ContainerSpec, outcome);

        let (outcome, map) = catalog::container_instances(conn, &maps, &snapshot.pod_stats)
            .in_phase(Phase::ContainerInstance)?;
        maps.containers = map;
        report.push(Phase::ContainerInstance, outcome);

        let (outcome, map) =
            catalog::devices(conn, &snapshot.pod_stats).in_phase(Phase::Device)?;
        maps.devices = map;
        report.push(Phase::Device, outcome);

        Ok((maps, report))
    }
}

/// Apply a plan: disable vanished rows, revive returning ones, insert new
///
/// `insert` returns `false` when the entity had to be skipped.
fn apply_plan<K, T, F>(
    tx: &Transaction<'_>,
    table: &RefTable,
    live: &BTreeMap<K, T>,
    stored: &[StoredRef<K>],
    mut insert: F,
) -> Result<KindOutcome, RecorderError>
where
    K: Ord + Clone,
    F: FnMut(&K, &T) -> Result<bool, RecorderError>,
{
    let plan = plan(live, stored);
    let mut outcome = KindOutcome {
        disabled: set_enabled(tx, table, &plan.vanished, false)?,
        revived: set_enabled(tx, table, &plan.revived, true)?,
        ..KindOutcome::default()
    };

    for key in &plan.new {
        if let Some(item) = live.get(key) {
            if insert(key, item)? {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
    }

    touch(tx, table, &outcome)?;
    Ok(outcome)
}

/// Stamp the bookkeeping row of a table that changed in this pass
fn touch(tx: &Transaction<'_>, table: &RefTable, outcome: &KindOutcome) -> Result<(), RecorderError> {
    if outcome.changed() {
        let clock = read_clock(tx)?;
        record_table_update(tx, table.name, clock.ontune_time)?;
    }
    Ok(())
}
