//! Namespace-scoped workload passes: services, controllers and pods

use super::{apply_plan, IdMaps, KindOutcome, PodIndex};
use crate::error::RecorderError;
use crate::models::{
    unix_seconds, DaemonSetInfo, DeploymentInfo, ObjectKind, OwnerRef, PodInfo, ReplicaSetInfo,
    ServiceInfo, StatefulSetInfo,
};
use crate::store::{
    id_map, load_cluster_refs, RefTable, StoredRef, DAEMONSETS, DEPLOYMENTS, PODS, REPLICASETS,
    SERVICES, STATEFULSETS,
};
use rusqlite::{params, Connection, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type KindResult = Result<(KindOutcome, HashMap<String, i64>), RecorderError>;

/// How an owner reference maps onto the `_refkind`/`_refid` columns
enum OwnerLink<'a> {
    /// No owner, or an owner kind the table does not link (Job, Node, ...)
    Unlinked(Option<&'a str>),
    Resolved(ObjectKind, i64),
    /// A linkable owner that has no stored row yet
    Missing,
}

impl<'a> OwnerLink<'a> {
    fn columns(&self) -> (Option<&'a str>, Option<i64>) {
        match self {
            OwnerLink::Unlinked(kind) => (*kind, None),
            OwnerLink::Resolved(kind, id) => (Some(kind.as_str()), Some(*id)),
            OwnerLink::Missing => (None, None),
        }
    }
}

fn owner_link<'a>(maps: &IdMaps, owner: Option<&'a OwnerRef>, linked: &[ObjectKind]) -> OwnerLink<'a> {
    let Some(owner) = owner else {
        return OwnerLink::Unlinked(None);
    };
    match ObjectKind::from_api(&owner.kind) {
        Some(kind) if linked.contains(&kind) => match maps.owner_id(kind, &owner.uid) {
            Some(id) => OwnerLink::Resolved(kind, id),
            None => OwnerLink::Missing,
        },
        _ => OwnerLink::Unlinked(Some(owner.kind.as_str())),
    }
}

fn namespace_id(maps: &IdMaps, table: &RefTable, name: &str, namespace: &str) -> Option<i64> {
    let id = maps.namespaces.get(namespace).copied();
    if id.is_none() {
        debug!(table = table.name, object = %name, namespace = %namespace, "Namespace not resolved, skipped");
    }
    id
}

/// Reload a UID-keyed table into its id map and commit
fn finish(tx: Transaction<'_>, table: &RefTable, cluster_id: i64) -> Result<HashMap<String, i64>, RecorderError> {
    let map = id_map(&load_cluster_refs(&tx, table, cluster_id)?);
    tx.commit()?;
    Ok(map)
}

pub(super) fn services(conn: &mut Connection, maps: &IdMaps, live: &BTreeMap<String, ServiceInfo>) -> KindResult {
    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &SERVICES, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &SERVICES, live, &stored, |uid, svc| {
        let Some(nsid) = namespace_id(maps, &SERVICES, &svc.name, &svc.namespace) else {
            return Ok(false);
        };
        tx.execute(
            "INSERT INTO kubesvcinfo (
                _clusterid, _nsid, _svcname, _uid, _starttime, _servicetype, _clusterip,
                _ports, _selector, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                maps.cluster_id,
                nsid,
                svc.name,
                uid,
                unix_seconds(svc.created_at.as_ref()),
                svc.service_type,
                svc.cluster_ip,
                svc.ports,
                svc.selector,
            ],
        )?;
        Ok(true)
    })?;
    Ok((outcome, finish(tx, &SERVICES, maps.cluster_id)?))
}

pub(super) fn deployments(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, DeploymentInfo>,
) -> KindResult {
    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &DEPLOYMENTS, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &DEPLOYMENTS, live, &stored, |uid, deploy| {
        let Some(nsid) = namespace_id(maps, &DEPLOYMENTS, &deploy.name, &deploy.namespace) else {
            return Ok(false);
        };
        tx.execute(
            "INSERT INTO kubedeployinfo (
                _clusterid, _nsid, _deployname, _uid, _starttime, _serviceaccount, _replicas,
                _updatedrs, _readyrs, _availablers, _observedgen, _selector, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)",
            params![
                maps.cluster_id,
                nsid,
                deploy.name,
                uid,
                unix_seconds(deploy.created_at.as_ref()),
                deploy.service_account,
                deploy.replicas,
                deploy.updated_replicas,
                deploy.ready_replicas,
                deploy.available_replicas,
                deploy.observed_generation,
                deploy.selector,
            ],
        )?;
        Ok(true)
    })?;
    Ok((outcome, finish(tx, &DEPLOYMENTS, maps.cluster_id)?))
}

pub(super) fn statefulsets(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, StatefulSetInfo>,
) -> KindResult {
    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &STATEFULSETS, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &STATEFULSETS, live, &stored, |uid, sts| {
        let Some(nsid) = namespace_id(maps, &STATEFULSETS, &sts.name, &sts.namespace) else {
            return Ok(false);
        };
        tx.execute(
            "INSERT INTO kubestsinfo (
                _clusterid, _nsid, _stsname, _uid, _starttime, _serviceaccount, _replicas,
                _readyrs, _availablers, _selector, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
            params![
                maps.cluster_id,
                nsid,
                sts.name,
                uid,
                unix_seconds(sts.created_at.as_ref()),
                sts.service_account,
                sts.replicas,
                sts.ready_replicas,
                sts.available_replicas,
                sts.selector,
            ],
        )?;
        Ok(true)
    })?;
    Ok((outcome, finish(tx, &STATEFULSETS, maps.cluster_id)?))
}

pub(super) fn daemonsets(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, DaemonSetInfo>,
) -> KindResult {
    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &DAEMONSETS, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &DAEMONSETS, live, &stored, |uid, ds| {
        let Some(nsid) = namespace_id(maps, &DAEMONSETS, &ds.name, &ds.namespace) else {
            return Ok(false);
        };
        tx.execute(
            "INSERT INTO kubedsinfo (
                _clusterid, _nsid, _dsname, _uid, _starttime, _serviceaccount, _current,
                _desired, _ready, _updated, _available, _selector, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)",
            params![
                maps.cluster_id,
                nsid,
                ds.name,
                uid,
                unix_seconds(ds.created_at.as_ref()),
                ds.service_account,
                ds.current_scheduled,
                ds.desired_scheduled,
                ds.ready,
                ds.updated_scheduled,
                ds.available,
                ds.selector,
            ],
        )?;
        Ok(true)
    })?;
    Ok((outcome, finish(tx, &DAEMONSETS, maps.cluster_id)?))
}

/// ReplicaSets link to their Deployment or StatefulSet owner
pub(super) fn replicasets(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, ReplicaSetInfo>,
) -> KindResult {
    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &REPLICASETS, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &REPLICASETS, live, &stored, |uid, rs| {
        let Some(nsid) = namespace_id(maps, &REPLICASETS, &rs.name, &rs.namespace) else {
            return Ok(false);
        };
        let owner = owner_link(
            maps,
            rs.owner.as_ref(),
            &[ObjectKind::Deployment, ObjectKind::StatefulSet],
        );
        if matches!(owner, OwnerLink::Missing) {
            debug!(replicaset = %rs.name, "Owner controller not resolved, skipped");
            return Ok(false);
        }
        let (ref_kind, ref_id) = owner.columns();

        tx.execute(
            "INSERT INTO kubersinfo (
                _clusterid, _nsid, _rsname, _uid, _starttime, _replicas, _fullylabeledrs,
                _readyrs, _availablers, _observedgen, _selector, _refkind, _refid, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1)",
            params![
                maps.cluster_id,
                nsid,
                rs.name,
                uid,
                unix_seconds(rs.created_at.as_ref()),
                rs.replicas,
                rs.fully_labeled_replicas,
                rs.ready_replicas,
                rs.available_replicas,
                rs.observed_generation,
                rs.selector,
                ref_kind,
                ref_id,
            ],
        )?;
        Ok(true)
    })?;
    Ok((outcome, finish(tx, &REPLICASETS, maps.cluster_id)?))
}

#[derive(Debug, Clone)]
struct StoredPod {
    id: i64,
    uid: String,
    annotation_uid: String,
    enabled: bool,
}

fn load_pods(tx: &Transaction<'_>, cluster_id: i64) -> Result<Vec<StoredPod>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT _podid, _uid, COALESCE(_annotationuid, ''), _enabled FROM kubepodinfo
         WHERE _clusterid = ?1 ORDER BY _podid",
    )?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok(StoredPod {
            id: row.get(0)?,
            uid: row.get(1)?,
            annotation_uid: row.get(2)?,
            enabled: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn pod_index(rows: &[StoredPod]) -> PodIndex {
    let by_uid: Vec<StoredRef<String>> = rows
        .iter()
        .map(|row| StoredRef {
            id: row.id,
            key: row.uid.clone(),
            enabled: row.enabled,
        })
        .collect();
    let by_annotation: Vec<StoredRef<String>> = rows
        .iter()
        .filter(|row| !row.annotation_uid.is_empty())
        .map(|row| StoredRef {
            id: row.id,
            key: row.annotation_uid.clone(),
            enabled: row.enabled,
        })
        .collect();
    PodIndex::new(id_map(&by_uid), id_map(&by_annotation))
}

/// Pods need a resolved node; unscheduled or orphaned pods wait for a later cycle
pub(super) fn pods(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, PodInfo>,
) -> Result<(KindOutcome, PodIndex), RecorderError> {
    let tx = conn.transaction()?;
    let stored: Vec<StoredRef<String>> = load_pods(&tx, maps.cluster_id)?
        .into_iter()
        .map(|row| StoredRef {
            id: row.id,
            key: row.uid,
            enabled: row.enabled,
        })
        .collect();

    let outcome = apply_plan(&tx, &PODS, live, &stored, |uid, pod| {
        let Some(&nodeid) = maps.nodes.get(&pod.node_name) else {
            debug!(pod = %pod.name, node = %pod.node_name, "Pod node not resolved, dropped for this cycle");
            return Ok(false);
        };
        let Some(nsid) = namespace_id(maps, &PODS, &pod.name, &pod.namespace) else {
            return Ok(false);
        };
        let owner = owner_link(
            maps,
            pod.owner.as_ref(),
            &[ObjectKind::DaemonSet, ObjectKind::ReplicaSet, ObjectKind::StatefulSet],
        );
        if matches!(owner, OwnerLink::Missing) {
            debug!(pod = %pod.name, "Owner controller not resolved, skipped");
            return Ok(false);
        }
        let (ref_kind, ref_id) = owner.columns();

        tx.execute(
            "INSERT INTO kubepodinfo (
                _clusterid, _nodeid, _nsid, _uid, _annotationuid, _podname, _starttime,
                _restartpolicy, _serviceaccount, _status, _hostip, _podip, _restartcount,
                _restarttime, _condition, _refkind, _refid, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, 1)",
            params![
                maps.cluster_id,
                nodeid,
                nsid,
                uid,
                pod.annotation_uid,
                pod.name,
                unix_seconds(pod.created_at.as_ref()),
                pod.restart_policy,
                pod.service_account,
                pod.phase,
                pod.host_ip,
                pod.pod_ip,
                pod.restart_count,
                unix_seconds(pod.restart_time.as_ref()),
                pod.condition,
                ref_kind,
                ref_id,
            ],
        )?;
        Ok(true)
    })?;

    let index = pod_index(&load_pods(&tx, maps.cluster_id)?);
    tx.commit()?;
    Ok((outcome, index))
}
