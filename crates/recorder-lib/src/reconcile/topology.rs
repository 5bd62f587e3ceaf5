//! Manager, cluster, namespace, node and node system container passes

use super::{apply_plan, touch, IdMaps, KindOutcome, ManagerIdentity};
use crate::error::RecorderError;
use crate::models::{unix_seconds, NamespaceInfo, NodeInfo, NodeStats};
use crate::store::{
    id_map, load_cluster_refs, read_clock, record_table_update, set_enabled, StoredRef, CLUSTERS,
    MANAGERS, NAMESPACES, NODES, NODE_SYSTEM_CONTAINERS,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

fn find_manager(tx: &Transaction<'_>, identity: &ManagerIdentity) -> Result<Option<i64>, RecorderError> {
    Ok(tx
        .query_row(
            "SELECT _managerid FROM kubemanagerinfo
             WHERE _managername = ?1 AND _ip = ?2
             ORDER BY _managerid LIMIT 1",
            params![identity.name, identity.ip],
            |row| row.get(0),
        )
        .optional()?)
}

/// Resolve the manager row, inserting it on first run
pub(super) fn manager(conn: &mut Connection, identity: &ManagerIdentity) -> Result<i64, RecorderError> {
    let tx = conn.transaction()?;
    let id = match find_manager(&tx, identity)? {
        Some(id) => id,
        None => {
            tx.execute(
                "INSERT INTO kubemanagerinfo (_managername, _description, _ip) VALUES (?1, ?1, ?2)",
                params![identity.name, identity.ip],
            )?;
            let clock = read_clock(&tx)?;
            record_table_update(&tx, MANAGERS.name, clock.ontune_time)?;
            info!(manager = %identity.name, ip = %identity.ip, "Registered manager");

            find_manager(&tx, identity)?.ok_or_else(|| RecorderError::Unresolved {
                table: MANAGERS.name,
                key: identity.ip.clone(),
            })?
        }
    };
    tx.commit()?;
    Ok(id)
}

fn find_cluster(tx: &Transaction<'_>, manager_id: i64, address: &str) -> Result<Option<i64>, RecorderError> {
    Ok(tx
        .query_row(
            "SELECT _clusterid FROM kubeclusterinfo
             WHERE _ip = ?1 AND _managerid = ?2
             ORDER BY _clusterid LIMIT 1",
            params![address, manager_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Resolve the cluster row under its manager, inserting it on first run
pub(super) fn cluster(
    conn: &mut Connection,
    manager_id: i64,
    name: &str,
    address: &str,
) -> Result<i64, RecorderError> {
    let tx = conn.transaction()?;
    let id = match find_cluster(&tx, manager_id, address)? {
        Some(id) => id,
        None => {
            tx.execute(
                "INSERT INTO kubeclusterinfo (_managerid, _clustername, _description, _ip)
                 VALUES (?1, ?2, ?2, ?3)",
                params![manager_id, name, address],
            )?;
            let clock = read_clock(&tx)?;
            record_table_update(&tx, CLUSTERS.name, clock.ontune_time)?;
            info!(cluster = %name, address = %address, "Registered cluster");

            find_cluster(&tx, manager_id, address)?.ok_or_else(|| RecorderError::Unresolved {
                table: CLUSTERS.name,
                key: address.to_string(),
            })?
        }
    };
    tx.commit()?;
    Ok(id)
}

pub(super) fn namespaces(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &[NamespaceInfo],
) -> Result<(KindOutcome, HashMap<String, i64>), RecorderError> {
    let live: BTreeMap<String, &NamespaceInfo> =
        live.iter().map(|ns| (ns.name.clone(), ns)).collect();

    let tx = conn.transaction()?;
    let stored = load_cluster_refs(&tx, &NAMESPACES, maps.cluster_id)?;
    let outcome = apply_plan(&tx, &NAMESPACES, &live, &stored, |name, ns| {
        tx.execute(
            "INSERT INTO kubensinfo (_clusterid, _nsname, _status, _enabled) VALUES (?1, ?2, ?3, 1)",
            params![maps.cluster_id, name, ns.phase],
        )?;
        Ok(true)
    })?;

    let map = id_map(&load_cluster_refs(&tx, &NAMESPACES, maps.cluster_id)?);
    tx.commit()?;
    Ok((outcome, map))
}

/// Stored node identity, decoded at the query boundary
#[derive(Debug, Clone)]
struct StoredNode {
    id: i64,
    name: String,
    uid: String,
    enabled: bool,
}

fn load_nodes(tx: &Transaction<'_>, cluster_id: i64) -> Result<Vec<StoredNode>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT _nodeid, _nodename, _nodeuid, _enabled FROM kubenodeinfo
         WHERE _clusterid = ?1 ORDER BY _nodeid",
    )?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok(StoredNode {
            id: row.get(0)?,
            name: row.get(1)?,
            uid: row.get(2)?,
            enabled: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn insert_node(tx: &Transaction<'_>, maps: &IdMaps, node: &NodeInfo) -> Result<(), RecorderError> {
    tx.execute(
        "INSERT INTO kubenodeinfo (
            _managerid, _clusterid, _nodeuid, _nodename, _nodenameext, _enabled, _state,
            _connected, _starttime, _kernelversion, _osimage, _osname, _containerruntimever,
            _kubeletver, _kubeproxyver, _cpuarch, _cpucount, _ephemeralstorage, _memorysize,
            _pods, _ip
        ) VALUES (?1, ?2, ?3, ?4, ?4, 1, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            maps.manager_id,
            maps.cluster_id,
            node.uid,
            node.name,
            node.connected,
            unix_seconds(node.created_at.as_ref()),
            node.kernel_version,
            node.os_image,
            node.os_name,
            node.container_runtime_version,
            node.kubelet_version,
            node.kube_proxy_version,
            node.cpu_arch,
            node.cpu_count,
            node.ephemeral_storage_bytes,
            node.memory_bytes,
            node.pod_capacity,
            node.ip,
        ],
    )?;
    Ok(())
}

/// Overwrite every descriptive field of a re-provisioned node
fn update_node(tx: &Transaction<'_>, id: i64, node: &NodeInfo) -> Result<(), RecorderError> {
    tx.execute(
        "UPDATE kubenodeinfo SET
            _nodeuid = ?2, _nodenameext = ?3, _enabled = 1, _state = 1, _connected = ?4,
            _starttime = ?5, _kernelversion = ?6, _osimage = ?7, _osname = ?8,
            _containerruntimever = ?9, _kubeletver = ?10, _kubeproxyver = ?11, _cpuarch = ?12,
            _cpucount = ?13, _ephemeralstorage = ?14, _memorysize = ?15, _pods = ?16, _ip = ?17
         WHERE _nodeid = ?1",
        params![
            id,
            node.uid,
            node.name,
            node.connected,
            unix_seconds(node.created_at.as_ref()),
            node.kernel_version,
            node.os_image,
            node.os_name,
            node.container_runtime_version,
            node.kubelet_version,
            node.kube_proxy_version,
            node.cpu_arch,
            node.cpu_count,
            node.ephemeral_storage_bytes,
            node.memory_bytes,
            node.pod_capacity,
            node.ip,
        ],
    )?;
    Ok(())
}

/// Nodes are keyed by name; a changed UID updates the row in place
///
/// Fails with `EmptyNodeCatalog` when no live node ends up with an id.
/// The pass is committed first, so vanished nodes are still disabled.
pub(super) fn nodes(
    conn: &mut Connection,
    maps: &IdMaps,
    live: &BTreeMap<String, NodeInfo>,
) -> Result<(KindOutcome, HashMap<String, i64>), RecorderError> {
    let tx = conn.transaction()?;
    let stored = load_nodes(&tx, maps.cluster_id)?;

    // Preferred row per name: enabled first, then the newest
    let mut current: HashMap<&str, &StoredNode> = HashMap::new();
    for row in &stored {
        current
            .entry(row.name.as_str())
            .and_modify(|best| {
                if (row.enabled, row.id) > (best.enabled, best.id) {
                    *best = row;
                }
            })
            .or_insert(row);
    }

    let mut outcome = KindOutcome::default();
    let mut revive = Vec::new();
    for (name, node) in live {
        match current.get(name.as_str()) {
            None => {
                insert_node(&tx, maps, node)?;
                outcome.inserted += 1;
            }
            Some(row) if row.uid != node.uid => {
                update_node(&tx, row.id, node)?;
                info!(node = %name, old_uid = %row.uid, new_uid = %node.uid, "Node re-provisioned, updated in place");
                outcome.updated += 1;
            }
            Some(row) if !row.enabled => revive.push(row.id),
            Some(_) => {}
        }
    }

    let vanished: Vec<i64> = stored
        .iter()
        .filter(|row| row.enabled && !live.contains_key(&row.name))
        .map(|row| row.id)
        .collect();
    outcome.disabled = set_enabled(&tx, &NODES, &vanished, false)?;
    outcome.revived = set_enabled(&tx, &NODES, &revive, true)?;
    touch(&tx, &NODES, &outcome)?;

    let refreshed: Vec<StoredRef<String>> = load_nodes(&tx, maps.cluster_id)?
        .into_iter()
        .map(|row| StoredRef {
            id: row.id,
            key: row.name,
            enabled: row.enabled,
        })
        .collect();
    // Later kinds resolve against live nodes only
    let mut map = id_map(&refreshed);
    map.retain(|name, _| live.contains_key(name));

    // Disables of vanished nodes stand even when the cycle stops here
    tx.commit()?;
    if map.is_empty() {
        return Err(RecorderError::EmptyNodeCatalog(maps.cluster_id));
    }
    Ok((outcome, map))
}

fn load_system_containers(
    tx: &Transaction<'_>,
    cluster_id: i64,
) -> Result<Vec<StoredRef<(i64, String)>>, RecorderError> {
    let mut stmt = tx.prepare_cached(
        "SELECT s._syscontainerid, s._nodeid, s._containername, s._enabled
         FROM kubenodesyscoinfo s JOIN kubenodeinfo n ON n._nodeid = s._nodeid
         WHERE n._clusterid = ?1 ORDER BY s._syscontainerid",
    )?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok(StoredRef {
            id: row.get(0)?,
            key: (row.get(1)?, row.get(2)?),
            enabled: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// System containers are keyed by (node id, container name)
pub(super) fn system_containers(
    conn: &mut Connection,
    maps: &IdMaps,
    node_stats: &BTreeMap<String, NodeStats>,
) -> Result<(KindOutcome, HashMap<(i64, String), i64>), RecorderError> {
    let mut live: BTreeMap<(i64, String), ()> = BTreeMap::new();
    let mut unresolved = 0;
    for (node_name, stats) in node_stats {
        match maps.nodes.get(node_name) {
            Some(&node_id) => {
                for container in &stats.system_containers {
                    live.insert((node_id, container.name.clone()), ());
                }
            }
            None => unresolved += stats.system_containers.len(),
        }
    }

    let tx = conn.transaction()?;
    let stored = load_system_containers(&tx, maps.cluster_id)?;
    let mut outcome = apply_plan(&tx, &NODE_SYSTEM_CONTAINERS, &live, &stored, |(node_id, name), _| {
        tx.execute(
            "INSERT INTO kubenodesyscoinfo (_nodeid, _containername, _enabled) VALUES (?1, ?2, 1)",
            params![node_id, name],
        )?;
        Ok(true)
    })?;
    outcome.skipped += unresolved;

    let map = id_map(&load_system_containers(&tx, maps.cluster_id)?);
    tx.commit()?;
    Ok((outcome, map))
}
