//! Recording-cycle scenarios against an in-memory store

use super::*;
use crate::metrics::CounterGroup;
use crate::models::{
    ContainerSpec, ContainerStats, CpuStats, InterfaceStats, NamespaceInfo, NetworkStats,
    NodeInfo, NodeStats, OwnerRef, PodInfo, PodReference, PodStats, ReplicaSetInfo,
};
use crate::schema::MetricFamily;
use crate::store::realtime_table;
use chrono::TimeZone;
use rusqlite::params;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

fn at(tick: i64) -> DateTime<Utc> {
    start() + chrono::Duration::seconds(10 * tick)
}

fn engine() -> CycleEngine {
    let store = Store::open_in_memory().unwrap();
    // The seeded clock is wall time; the fixed tick times must be able to advance it
    store.set_clock(0, 0).unwrap();
    CycleEngine::new(
        store,
        SchemaCatalog::builtin().unwrap(),
        EngineConfig {
            short_interval: Duration::from_secs(10),
            long_interval: Duration::from_secs(30),
            ..EngineConfig::default()
        },
    )
}

fn node(name: &str, uid: &str) -> NodeInfo {
    NodeInfo {
        uid: uid.to_string(),
        name: name.to_string(),
        cpu_count: 4,
        connected: true,
        ..NodeInfo::default()
    }
}

fn pod(uid: &str, name: &str, node_name: &str) -> PodInfo {
    PodInfo {
        uid: uid.to_string(),
        name: name.to_string(),
        namespace: "default".to_string(),
        node_name: node_name.to_string(),
        phase: "Running".to_string(),
        containers: vec![web_container()],
        ..PodInfo::default()
    }
}

fn web_container() -> ContainerSpec {
    ContainerSpec {
        name: "web".to_string(),
        image: "nginx:1.25".to_string(),
        ..ContainerSpec::default()
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
    snapshot
        .nodes
        .insert("node-a".to_string(), node("node-a", "node-uid-1"));
    snapshot
}

fn with_pod(mut snapshot: ClusterSnapshot, pod: PodInfo) -> ClusterSnapshot {
    snapshot.pods.insert(pod.uid.clone(), pod);
    snapshot
}

fn interface(rx: u64) -> NetworkStats {
    NetworkStats {
        interfaces: vec![InterfaceStats {
            name: "eth0".to_string(),
            rx_bytes: Some(rx),
            tx_bytes: Some(0),
            ..InterfaceStats::default()
        }],
    }
}

fn with_node_traffic(mut snapshot: ClusterSnapshot, rx: u64) -> ClusterSnapshot {
    snapshot.node_stats.insert(
        "node-a".to_string(),
        NodeStats {
            node_name: "node-a".to_string(),
            network: Some(interface(rx)),
            ..NodeStats::default()
        },
    );
    snapshot
}

fn pod_stats(uid: &str, name: &str) -> PodStats {
    PodStats {
        pod_ref: PodReference {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uid.to_string(),
        },
        containers: vec![ContainerStats {
            name: "web".to_string(),
            cpu: Some(CpuStats {
                usage_nano_cores: Some(1_000_000_000),
                usage_core_nano_seconds: None,
            }),
            ..ContainerStats::default()
        }],
        network: Some(interface(10)),
        ..PodStats::default()
    }
}

fn count(engine: &CycleEngine, sql: &str) -> i64 {
    engine
        .store()
        .connection()
        .query_row(sql, [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_unchanged_snapshot_is_idempotent() {
    let mut engine = engine();
    let snapshot = with_pod(snapshot(), pod("pod-1", "web-1", "node-a"));

    let first = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert!(first.reconcile.totals().inserted > 0);

    let second = engine.run_cycle_at(&snapshot, at(1)).unwrap();
    let totals = second.reconcile.totals();
    assert_eq!(totals.inserted, 0);
    assert_eq!(totals.disabled, 0);
    assert_eq!(totals.updated, 0);
    assert_eq!(totals.revived, 0);
    assert!(second.schema.created.is_empty());
}

#[test]
fn test_new_namespace_scenario() {
    let mut engine = engine();
    let mut snapshot = snapshot();
    snapshot.namespaces = vec![NamespaceInfo {
        name: "ns-a".to_string(),
        phase: "Active".to_string(),
    }];

    let first = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(first.reconcile.get(Phase::Namespace).inserted, 1);

    let (status, enabled): (String, bool) = engine
        .store()
        .connection()
        .query_row(
            "SELECT _status, _enabled FROM kubensinfo WHERE _nsname = ?1",
            params!["ns-a"],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "Active");
    assert!(enabled);

    let second = engine.run_cycle_at(&snapshot, at(1)).unwrap();
    assert_eq!(second.reconcile.get(Phase::Namespace).inserted, 0);
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubensinfo"), 1);
}

#[test]
fn test_vanished_pod_is_disabled_then_revived_with_same_id() {
    let mut engine = engine();
    let present = with_pod(snapshot(), pod("pod-1", "web-1", "node-a"));

    engine.run_cycle_at(&present, at(0)).unwrap();
    let id = count(&engine, "SELECT _podid FROM kubepodinfo WHERE _uid = 'pod-1'");

    let gone = engine.run_cycle_at(&snapshot(), at(1)).unwrap();
    assert_eq!(gone.reconcile.get(Phase::Pod).disabled, 1);
    assert_eq!(
        count(&engine, "SELECT _enabled FROM kubepodinfo WHERE _uid = 'pod-1'"),
        0
    );
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubepodinfo"), 1);

    let back = engine.run_cycle_at(&present, at(2)).unwrap();
    assert_eq!(back.reconcile.get(Phase::Pod).revived, 1);
    assert_eq!(back.reconcile.get(Phase::Pod).inserted, 0);
    assert_eq!(
        count(&engine, "SELECT _podid FROM kubepodinfo WHERE _enabled = 1"),
        id
    );
}

#[test]
fn test_identical_container_specs_are_stored_once() {
    let mut engine = engine();
    let mut snapshot = snapshot();
    snapshot.replicasets.insert(
        "rs-1".to_string(),
        ReplicaSetInfo {
            uid: "rs-1".to_string(),
            name: "web-5d8f".to_string(),
            namespace: "default".to_string(),
            containers: vec![web_container()],
            ..ReplicaSetInfo::default()
        },
    );
    for (uid, name) in [("pod-1", "web-5d8f-a"), ("pod-2", "web-5d8f-b")] {
        let mut replica = pod(uid, name, "node-a");
        replica.owner = Some(OwnerRef {
            kind: "ReplicaSet".to_string(),
            uid: "rs-1".to_string(),
        });
        snapshot = with_pod(snapshot, replica);
    }

    let report = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(report.reconcile.get(Phase::Pod).inserted, 2);
    assert_eq!(report.reconcile.get(Phase::ContainerSpec).inserted, 2);
    assert_eq!(
        count(
            &engine,
            "SELECT COUNT(*) FROM kuberefcontainerinfo WHERE _refobjkind = 'Pod'"
        ),
        1
    );
    assert_eq!(
        count(
            &engine,
            "SELECT COUNT(*) FROM kubepodinfo WHERE _refkind = 'ReplicaSet' AND _refid IS NOT NULL"
        ),
        2
    );
}

#[test]
fn test_pod_on_unknown_node_is_dropped() {
    let mut engine = engine();
    let snapshot = with_pod(snapshot(), pod("pod-1", "stray", "node-x"));

    let report = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(report.reconcile.get(Phase::Pod).inserted, 0);
    assert_eq!(report.reconcile.get(Phase::Pod).skipped, 1);
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubepodinfo"), 0);
}

#[test]
fn test_stats_resolve_static_pod_through_annotation_uid() {
    let mut engine = engine();
    let mut static_pod = pod("api-uid", "etcd-node-a", "node-a");
    static_pod.annotation_uid = "config-hash".to_string();
    let mut snapshot = with_node_traffic(with_pod(snapshot(), static_pod), 0);
    snapshot
        .pod_stats
        .insert("node-a".to_string(), vec![pod_stats("config-hash", "etcd-node-a")]);

    let report = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(report.reconcile.get(Phase::ContainerInstance).inserted, 1);
    assert_eq!(report.ingest.rows_for(MetricFamily::PodPerf), 1);
    assert_eq!(report.ingest.rows_for(MetricFamily::ContainerPerf), 1);
    assert_eq!(report.ingest.rows_for(MetricFamily::PodNet), 1);
    assert_eq!(report.ingest.skipped, 0);

    let pod_id = count(&engine, "SELECT _podid FROM kubepodinfo WHERE _uid = 'api-uid'");
    let table = realtime_table("kubepodperf", at(0).date_naive());
    assert_eq!(
        count(&engine, &format!("SELECT _podid FROM {}", table)),
        pod_id
    );

    // 1e9 nano cores on a 4 core node
    let cpu: f64 = engine
        .store()
        .connection()
        .query_row(
            &format!(
                "SELECT _cpuusage FROM {}",
                realtime_table("kubecontainerperf", at(0).date_naive())
            ),
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!((cpu - 25.0).abs() < 1e-9);
}

#[test]
fn test_unresolved_stats_pod_is_skipped() {
    let mut engine = engine();
    let mut snapshot = with_node_traffic(snapshot(), 0);
    snapshot
        .pod_stats
        .insert("node-a".to_string(), vec![pod_stats("unknown", "ghost")]);

    let report = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(report.ingest.rows_for(MetricFamily::PodPerf), 0);
    assert_eq!(report.ingest.rows_for(MetricFamily::NodePerf), 1);
    assert!(report.ingest.skipped > 0);
}

#[test]
fn test_node_uid_change_updates_row_in_place() {
    let mut engine = engine();
    engine.run_cycle_at(&snapshot(), at(0)).unwrap();
    let id = count(&engine, "SELECT _nodeid FROM kubenodeinfo");

    let mut reprovisioned = snapshot();
    reprovisioned
        .nodes
        .insert("node-a".to_string(), node("node-a", "node-uid-2"));
    let report = engine.run_cycle_at(&reprovisioned, at(1)).unwrap();

    assert_eq!(report.reconcile.get(Phase::Node).updated, 1);
    assert_eq!(report.reconcile.get(Phase::Node).inserted, 0);
    let (stored_id, uid): (i64, String) = engine
        .store()
        .connection()
        .query_row("SELECT _nodeid, _nodeuid FROM kubenodeinfo", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!((stored_id, uid.as_str()), (id, "node-uid-2"));
}

#[test]
fn test_empty_node_catalog_aborts_cycle() {
    let mut engine = engine();
    let mut snapshot = with_pod(snapshot(), pod("pod-1", "web-1", "node-a"));
    snapshot.nodes.clear();

    let err = engine.run_cycle_at(&snapshot, at(0)).unwrap_err();
    assert_eq!(err.phase, Phase::Node);
    assert!(matches!(err.source, crate::error::RecorderError::EmptyNodeCatalog(_)));

    // Earlier kinds stay committed, later kinds never ran
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubensinfo"), 1);
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubepodinfo"), 0);
    assert_eq!(engine.ticks(), 1);
}

#[test]
fn test_empty_snapshot_still_disables_vanished_nodes() {
    let mut engine = engine();
    engine.run_cycle_at(&snapshot(), at(0)).unwrap();

    let mut empty = snapshot();
    empty.nodes.clear();
    let err = engine.run_cycle_at(&empty, at(1)).unwrap_err();
    assert_eq!(err.phase, Phase::Node);

    assert_eq!(
        count(&engine, "SELECT _enabled FROM kubenodeinfo WHERE _nodename = 'node-a'"),
        0
    );

    // The node comes back under the same id
    let report = engine.run_cycle_at(&snapshot(), at(2)).unwrap();
    assert_eq!(report.reconcile.get(Phase::Node).revived, 1);
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubenodeinfo"), 1);
}

#[test]
fn test_template_owner_falls_back_to_resolved_pod() {
    let mut engine = engine();
    // "pod-0" is gathered first but its node is unknown
    let snapshot = with_pod(
        with_pod(snapshot(), pod("pod-0", "stray", "node-x")),
        pod("pod-1", "web-1", "node-a"),
    );

    let report = engine.run_cycle_at(&snapshot, at(0)).unwrap();
    assert_eq!(report.reconcile.get(Phase::Pod).skipped, 1);
    assert_eq!(report.reconcile.get(Phase::ContainerSpec).inserted, 1);
    assert_eq!(report.reconcile.get(Phase::ContainerSpec).skipped, 0);

    let pod_id = count(&engine, "SELECT _podid FROM kubepodinfo WHERE _uid = 'pod-1'");
    assert_eq!(
        count(&engine, "SELECT _objid FROM kuberefcontainerinfo WHERE _refobjkind = 'Pod'"),
        pod_id
    );
}

#[test]
fn test_vanished_pod_counters_are_evicted() {
    let mut engine = engine();
    let mut present = with_pod(with_node_traffic(snapshot(), 100), pod("pod-1", "web-1", "node-a"));
    present
        .pod_stats
        .insert("node-a".to_string(), vec![pod_stats("pod-1", "web-1")]);
    engine.run_cycle_at(&present, at(0)).unwrap();

    let pod_id = count(&engine, "SELECT _podid FROM kubepodinfo WHERE _uid = 'pod-1'").to_string();
    let device_id = count(&engine, "SELECT _deviceid FROM kubepoddeviceinfo WHERE _devicename = 'eth0'");
    let net_key = format!("{}_{}", pod_id, device_id);
    let counters = engine.pipeline().counters();
    assert!(counters.get(CounterGroup::PodPerf, &pod_id).is_some());
    assert!(counters.get(CounterGroup::PodNet, &net_key).is_some());

    engine
        .run_cycle_at(&with_node_traffic(snapshot(), 200), at(1))
        .unwrap();

    let counters = engine.pipeline().counters();
    assert!(counters.get(CounterGroup::PodPerf, &pod_id).is_none());
    assert!(counters.get(CounterGroup::PodNet, &net_key).is_none());
    assert!(counters.get(CounterGroup::NodePerf, "node-a").is_some());
}

#[test]
fn test_node_counter_deltas_across_cycles() {
    let mut engine = engine();
    for (tick, rx) in [100, 250, 250, 400].into_iter().enumerate() {
        engine
            .run_cycle_at(&with_node_traffic(snapshot(), rx), at(tick as i64))
            .unwrap();
    }

    let table = realtime_table("kubenodeperf", start().date_naive());
    let mut stmt = engine
        .store()
        .connection()
        .prepare(&format!("SELECT _netiorate FROM {} ORDER BY _ontunetime", table))
        .unwrap();
    let deltas: Vec<i64> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(deltas, vec![0, 150, 0, 150]);

    assert_eq!(
        count(&engine, "SELECT _netusage FROM kubelastrealtimeperf"),
        150
    );
    assert_eq!(count(&engine, "SELECT COUNT(*) FROM kubelastrealtimeperf"), 1);
}

#[test]
fn test_rollup_runs_when_gate_opens() {
    let mut engine = engine();
    let mut reports = Vec::new();
    for tick in 0..3 {
        reports.push(
            engine
                .run_cycle_at(&with_node_traffic(snapshot(), 100), at(tick))
                .unwrap(),
        );
    }

    assert!(reports[0].rollup.is_none());
    assert!(reports[1].rollup.is_none());
    let rollup = reports[2].rollup.as_ref().unwrap();
    assert_eq!(rollup.rows.get("kubenodeperf"), Some(&1));
    assert_eq!(rollup.upper, at(2).timestamp());
}

#[test]
fn test_skipped_ticks_advance_the_rollup_gate() {
    let mut engine = engine();
    engine.skip_cycle();
    engine.skip_cycle();

    let report = engine.run_cycle_at(&snapshot(), at(2)).unwrap();
    assert_eq!(report.tick, 3);
    assert!(report.rollup.is_some());
}

#[test]
fn test_failed_realtime_phase_keeps_counter_baseline() {
    let mut engine = engine();
    let mut first = with_pod(with_node_traffic(snapshot(), 100), pod("pod-1", "web-1", "node-a"));
    first
        .pod_stats
        .insert("node-a".to_string(), vec![pod_stats("pod-1", "web-1")]);
    engine.run_cycle_at(&first, at(0)).unwrap();

    let table = realtime_table("kubepodperf", start().date_naive());
    engine
        .store()
        .connection()
        .execute_batch(&format!("DROP TABLE {};", table))
        .unwrap();

    let mut second = with_pod(with_node_traffic(snapshot(), 250), pod("pod-1", "web-1", "node-a"));
    second
        .pod_stats
        .insert("node-a".to_string(), vec![pod_stats("pod-1", "web-1")]);
    let err = engine.run_cycle_at(&second, at(1)).unwrap_err();
    assert_eq!(err.phase, Phase::Realtime);

    let counters = engine.pipeline().counters();
    assert_eq!(
        counters.get(CounterGroup::NodePerf, "node-a"),
        Some(vec![100, 100, 0, 0, 0])
    );
    // The last-known stage committed before the failure
    assert_eq!(counters.get(CounterGroup::LastRealtimePerf, "node-a"), Some(vec![250]));

    let node_rows = realtime_table("kubenodeperf", start().date_naive());
    assert_eq!(count(&engine, &format!("SELECT COUNT(*) FROM {}", node_rows)), 1);
}

#[test]
fn test_manage_clock_stamps_rows_with_tick_time() {
    let mut engine = engine();
    engine
        .run_cycle_at(&with_node_traffic(snapshot(), 5), at(0))
        .unwrap();

    let clock = engine.store().clock().unwrap();
    assert_eq!(clock.ontune_time, at(0).timestamp());
    let table = realtime_table("kubenodeperf", start().date_naive());
    assert_eq!(
        count(&engine, &format!("SELECT _ontunetime FROM {}", table)),
        at(0).timestamp()
    );
}
