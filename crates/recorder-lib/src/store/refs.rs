//! Typed access to reference-table identities

use crate::error::RecorderError;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::hash::Hash;

/// Maximum number of ids bound into one `IN (...)` list
const ID_CHUNK: usize = 500;

/// Identity columns of a reference table
#[derive(Debug, Clone, Copy)]
pub struct RefTable {
    pub name: &'static str,
    pub id_column: &'static str,
    /// Natural key column (UID or name) for cluster-scoped kinds
    pub key_column: &'static str,
}

pub const MANAGERS: RefTable = RefTable {
    name: "kubemanagerinfo",
    id_column: "_managerid",
    key_column: "_ip",
};

pub const CLUSTERS: RefTable = RefTable {
    name: "kubeclusterinfo",
    id_column: "_clusterid",
    key_column: "_ip",
};

pub const NAMESPACES: RefTable = RefTable {
    name: "kubensinfo",
    id_column: "_nsid",
    key_column: "_nsname",
};

pub const NODES: RefTable = RefTable {
    name: "kubenodeinfo",
    id_column: "_nodeid",
    key_column: "_nodename",
};

pub const NODE_SYSTEM_CONTAINERS: RefTable = RefTable {
    name: "kubenodesyscoinfo",
    id_column: "_syscontainerid",
    key_column: "_containername",
};

pub const SERVICES: RefTable = RefTable {
    name: "kubesvcinfo",
    id_column: "_svcid",
    key_column: "_uid",
};

pub const DEPLOYMENTS: RefTable = RefTable {
    name: "kubedeployinfo",
    id_column: "_deployid",
    key_column: "_uid",
};

pub const STATEFULSETS: RefTable = RefTable {
    name: "kubestsinfo",
    id_column: "_stsid",
    key_column: "_uid",
};

pub const DAEMONSETS: RefTable = RefTable {
    name: "kubedsinfo",
    id_column: "_dsid",
    key_column: "_uid",
};

pub const REPLICASETS: RefTable = RefTable {
    name: "kubersinfo",
    id_column: "_rsid",
    key_column: "_uid",
};

pub const PODS: RefTable = RefTable {
    name: "kubepodinfo",
    id_column: "_podid",
    key_column: "_uid",
};

pub const CONTAINER_SPECS: RefTable = RefTable {
    name: "kuberefcontainerinfo",
    id_column: "_refcontainerid",
    key_column: "_refcontainername",
};

pub const CONTAINERS: RefTable = RefTable {
    name: "kubecontainerinfo",
    id_column: "_containerid",
    key_column: "_containername",
};

pub const DEVICES: RefTable = RefTable {
    name: "kubepoddeviceinfo",
    id_column: "_deviceid",
    key_column: "_devicename",
};

/// One stored reference row, decoded at the query boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRef<K> {
    pub id: i64,
    pub key: K,
    pub enabled: bool,
}

/// Load `(id, key, enabled)` for every row of a cluster-scoped table
pub fn load_cluster_refs(
    conn: &Connection,
    table: &RefTable,
    cluster_id: i64,
) -> Result<Vec<StoredRef<String>>, RecorderError> {
    let sql = format!(
        "SELECT {id}, {key}, _enabled FROM {table} WHERE _clusterid = ?1 ORDER BY {id}",
        id = table.id_column,
        key = table.key_column,
        table = table.name,
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![cluster_id], |row| {
        Ok(StoredRef {
            id: row.get(0)?,
            key: row.get(1)?,
            enabled: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Flip `_enabled` for a batch of ids; returns the number of rows touched
pub fn set_enabled(
    conn: &Connection,
    table: &RefTable,
    ids: &[i64],
    enabled: bool,
) -> Result<usize, RecorderError> {
    let mut touched = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = (2..chunk.len() + 2)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE {table} SET _enabled = ?1 WHERE {id} IN ({placeholders})",
            table = table.name,
            id = table.id_column,
        );
        let values = std::iter::once(i64::from(enabled)).chain(chunk.iter().copied());
        touched += conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(touched)
}

/// Key → id map preferring the enabled row, else the newest disabled one
pub fn id_map<K: Eq + Hash + Clone>(rows: &[StoredRef<K>]) -> HashMap<K, i64> {
    let mut chosen: HashMap<K, (bool, i64)> = HashMap::with_capacity(rows.len());
    for row in rows {
        let candidate = (row.enabled, row.id);
        chosen
            .entry(row.key.clone())
            .and_modify(|current| {
                if candidate > *current {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }
    chosen.into_iter().map(|(k, (_, id))| (k, id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, key: &str, enabled: bool) -> StoredRef<String> {
        StoredRef {
            id,
            key: key.to_string(),
            enabled,
        }
    }

    #[test]
    fn test_id_map_prefers_enabled_row() {
        let rows = vec![
            stored(1, "a", true),
            stored(2, "a", false),
            stored(3, "b", false),
            stored(4, "b", false),
        ];
        let map = id_map(&rows);

        assert_eq!(map["a"], 1);
        assert_eq!(map["b"], 4);
    }

    #[test]
    fn test_set_enabled_batches_ids() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE kubensinfo (_nsid INTEGER PRIMARY KEY AUTOINCREMENT,
                _clusterid INTEGER, _nsname TEXT, _enabled INTEGER);",
        )
        .unwrap();
        for i in 0..1200 {
            conn.execute(
                "INSERT INTO kubensinfo (_clusterid, _nsname, _enabled) VALUES (1, ?1, 1)",
                params![format!("ns-{}", i)],
            )
            .unwrap();
        }

        let ids: Vec<i64> = (1..=1100).collect();
        assert_eq!(set_enabled(&conn, &NAMESPACES, &ids, false).unwrap(), 1100);

        let rows = load_cluster_refs(&conn, &NAMESPACES, 1).unwrap();
        assert_eq!(rows.iter().filter(|r| r.enabled).count(), 100);
        assert_eq!(set_enabled(&conn, &NAMESPACES, &[], false).unwrap(), 0);
    }
}
