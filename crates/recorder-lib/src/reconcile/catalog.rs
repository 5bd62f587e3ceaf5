//! Container template catalog, container instances and the device catalog

use super::{apply_plan, touch, DeviceType, IdMaps, KindOutcome, SpecKey};
use crate::error::RecorderError;
use crate::models::{unix_seconds, ClusterSnapshot, ContainerSpec, ObjectKind, PodStats};
use crate::store::{id_map, StoredRef, CONTAINERS, CONTAINER_SPECS, DEVICES};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Objects reporting a template, in gathering order
///
/// The first owner that resolves supplies `_objid`; the first reporter
/// supplies the descriptive columns.
struct SpecSource<'a> {
    owner_uids: Vec<&'a str>,
    spec: &'a ContainerSpec,
}

fn collect<'a>(
    live: &mut BTreeMap<SpecKey, SpecSource<'a>>,
    kind: ObjectKind,
    owner_uid: &'a str,
    containers: &'a [ContainerSpec],
) {
    for spec in containers {
        let key = SpecKey {
            kind,
            name: spec.name.clone(),
            image: spec.image.clone(),
        };
        live.entry(key)
            .or_insert_with(|| SpecSource {
                owner_uids: Vec::new(),
                spec,
            })
            .owner_uids
            .push(owner_uid);
    }
}

/// Deduplicated templates, gathered pods first, then deployments,
/// statefulsets, daemonsets and replicasets
fn live_specs(snapshot: &ClusterSnapshot) -> BTreeMap<SpecKey, SpecSource<'_>> {
    let mut live = BTreeMap::new();
    for (uid, pod) in &snapshot.pods {
        collect(&mut live, ObjectKind::Pod, uid, &pod.containers);
    }
    for (uid, deploy) in &snapshot.deployments {
        collect(&mut live, ObjectKind::Deployment, uid, &deploy.containers);
    }
    for (uid, sts) in &snapshot.statefulsets {
        collect(&mut live, ObjectKind::StatefulSet, uid, &sts.containers);
    }
    for (uid, ds) in &snapshot.daemonsets {
        collect(&mut live, ObjectKind::DaemonSet, uid, &ds.containers);
    }
    for (uid, rs) in &snapshot.replicasets {
        collect(&mut live, ObjectKind::ReplicaSet, uid, &rs.containers);
    }
    live
}

fn load_specs(tx: &Transaction<'_>, cluster_id: i64) -> Result<Vec<StoredRef<SpecKey>>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT _refcontainerid, _refobjkind, _refcontainername, _image, _enabled
         FROM kuberefcontainerinfo WHERE _clusterid = ?1 ORDER BY _refcontainerid",
    )?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, bool>(4)?,
        ))
    })?;

    let mut stored = Vec::new();
    for row in rows {
        let (id, kind, name, image, enabled) = row?;
        match ObjectKind::from_api(&kind) {
            Some(kind) => stored.push(StoredRef {
                id,
                key: SpecKey { kind, name, image },
                enabled,
            }),
            None => debug!(id, kind = %kind, "Ignoring container template with unknown owner kind"),
        }
    }
    Ok(stored)
}

/// Templates are diffed by (owner kind, name, image), not by UID
pub(super) fn container_specs(
    conn: &mut Connection,
    maps: &IdMaps,
    snapshot: &ClusterSnapshot,
) -> Result<(KindOutcome, HashMap<SpecKey, i64>), RecorderError> {
    let live = live_specs(snapshot);

    let tx = conn.transaction()?;
    let stored = load_specs(&tx, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &CONTAINER_SPECS, &live, &stored, |key, source| {
        let Some(objid) = source
            .owner_uids
            .iter()
            .find_map(|uid| maps.owner_id(key.kind, uid))
        else {
            debug!(kind = %key.kind, container = %key.name, owners = source.owner_uids.len(), "No template owner resolved, skipped");
            return Ok(false);
        };
        tx.execute(
            "INSERT INTO kuberefcontainerinfo (
                _clusterid, _refobjkind, _objid, _refcontainername, _image, _ports, _env,
                _resources, _volumemounts, _enabled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                maps.cluster_id,
                key.kind.as_str(),
                objid,
                key.name,
                key.image,
                source.spec.ports,
                source.spec.env,
                source.spec.resources,
                source.spec.volume_mounts,
            ],
        )?;
        Ok(true)
    })?;

    let map = id_map(&load_specs(&tx, maps.cluster_id)?);
    tx.commit()?;
    Ok((outcome, map))
}

type InstanceKey = (i64, i64, String);

fn load_instances(tx: &Transaction<'_>, cluster_id: i64) -> Result<Vec<StoredRef<InstanceKey>>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT c._containerid, p._nodeid, c._podid, c._containername, c._enabled
         FROM kubecontainerinfo c JOIN kubepodinfo p ON p._podid = c._podid
         WHERE p._clusterid = ?1 ORDER BY c._containerid",
    )?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok(StoredRef {
            id: row.get(0)?,
            key: (row.get(1)?, row.get(2)?, row.get(3)?),
            enabled: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Running containers from the stats feed, keyed by (node id, pod id, name)
pub(super) fn container_instances(
    conn: &mut Connection,
    maps: &IdMaps,
    pod_stats: &BTreeMap<String, Vec<PodStats>>,
) -> Result<(KindOutcome, HashMap<InstanceKey, i64>), RecorderError> {
    let mut live: BTreeMap<InstanceKey, Option<DateTime<Utc>>> = BTreeMap::new();
    let mut unresolved = 0;

    for (node_name, pods) in pod_stats {
        let Some(&node_id) = maps.nodes.get(node_name) else {
            unresolved += pods.iter().map(|p| p.containers.len()).sum::<usize>();
            continue;
        };
        for pod in pods {
            let Some(pod_id) = maps.pods.resolve(&pod.pod_ref.uid) else {
                debug!(pod = %pod.pod_ref.name, uid = %pod.pod_ref.uid, "Stats pod not resolved, containers skipped");
                unresolved += pod.containers.len();
                continue;
            };
            for container in &pod.containers {
                live.insert((node_id, pod_id, container.name.clone()), container.start_time);
            }
        }
    }

    let tx = conn.transaction()?;
    let stored = load_instances(&tx, maps.cluster_id)?;
    let mut outcome = apply_plan(&tx, &CONTAINERS, &live, &stored, |(_, pod_id, name), started| {
        tx.execute(
            "INSERT INTO kubecontainerinfo (_podid, _containername, _starttime, _enabled)
             VALUES (?1, ?2, ?3, 1)",
            params![pod_id, name, unix_seconds(started.as_ref())],
        )?;
        Ok(true)
    })?;
    outcome.skipped += unresolved;

    let map = id_map(&load_instances(&tx, maps.cluster_id)?);
    tx.commit()?;
    Ok((outcome, map))
}

fn load_devices(tx: &Transaction<'_>) -> Result<Vec<StoredRef<(DeviceType, String)>>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT _deviceid, _devicetype, _devicename FROM kubepoddeviceinfo ORDER BY _deviceid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut stored = Vec::new();
    for row in rows {
        let (id, device_type, name) = row?;
        if let Some(device_type) = DeviceType::parse(&device_type) {
            stored.push(StoredRef {
                id,
                key: (device_type, name),
                enabled: true,
            });
        }
    }
    Ok(stored)
}

/// Global network and volume device names; devices are never retired
pub(super) fn devices(
    conn: &mut Connection,
    pod_stats: &BTreeMap<String, Vec<PodStats>>,
) -> Result<(KindOutcome, HashMap<(DeviceType, String), i64>), RecorderError> {
    let mut live: BTreeSet<(DeviceType, String)> = BTreeSet::new();
    for pod in pod_stats.values().flatten() {
        for interface in pod.interfaces() {
            live.insert((DeviceType::Network, interface.name.clone()));
        }
        for volume in &pod.volume {
            live.insert((DeviceType::Volume, volume.name.clone()));
        }
    }
    live.retain(|(_, name)| !name.is_empty());

    let tx = conn.transaction()?;
    let known: BTreeSet<(DeviceType, String)> =
        load_devices(&tx)?.into_iter().map(|row| row.key).collect();

    let mut outcome = KindOutcome::default();
    for (device_type, name) in live.difference(&known) {
        tx.execute(
            "INSERT INTO kubepoddeviceinfo (_devicename, _devicetype) VALUES (?1, ?2)",
            params![name, device_type.as_str()],
        )?;
        outcome.inserted += 1;
    }
    touch(&tx, &DEVICES, &outcome)?;

    let map = id_map(&load_devices(&tx)?);
    tx.commit()?;
    Ok((outcome, map))
}
