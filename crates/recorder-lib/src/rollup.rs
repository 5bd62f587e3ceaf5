//! Windowed averages of the raw metric partitions
//!
//! Every long interval the rollup averages the raw rows of the window
//! `(now - interval, now]` per entity and appends one row per entity to the
//! day's `avg*` table. Yesterday's partition joins the source while it
//! exists so a window spanning midnight is complete.

use crate::error::{CycleError, Phase, PhaseContext, RecorderError};
use crate::schema::SchemaCatalog;
use crate::store::{average_table, read_clock, realtime_table, record_table_update, table_exists};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Decides which ticks run the rollup
///
/// The elapsed counter advances by the short interval on every tick,
/// aborted ones included, and the rollup is due whenever it lands on a
/// non-zero multiple of the long interval.
#[derive(Debug, Clone)]
pub struct RollupGate {
    short: u64,
    long: u64,
    elapsed: u64,
}

impl RollupGate {
    pub fn new(short_interval: Duration, long_interval: Duration) -> Self {
        Self {
            short: short_interval.as_secs(),
            long: long_interval.as_secs(),
            elapsed: 0,
        }
    }

    /// Account for one tick; true when the rollup is due on it
    pub fn advance(&mut self) -> bool {
        self.elapsed = self.elapsed.saturating_add(self.short);
        self.long > 0 && self.elapsed > 0 && self.elapsed % self.long == 0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs(self.elapsed)
    }
}

/// Result of one rollup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReport {
    /// Exclusive lower bound of the window
    pub lower: i64,
    /// Inclusive upper bound, the ontune time of the pass
    pub upper: i64,
    /// Average rows written per metric base
    pub rows: BTreeMap<String, usize>,
    pub elapsed: Duration,
}

impl RollupReport {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

/// Writes average rows for every metric family of the catalog
#[derive(Debug, Clone)]
pub struct AverageRollupScheduler {
    interval: Duration,
}

impl AverageRollupScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn rollup(
        &self,
        conn: &mut Connection,
        catalog: &SchemaCatalog,
        today: NaiveDate,
    ) -> Result<RollupReport, CycleError> {
        let start = Instant::now();
        let clock = read_clock(conn).in_phase(Phase::Rollup)?;
        let window = i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX);
        let mut report = RollupReport {
            lower: clock.ontune_time.saturating_sub(window),
            upper: clock.ontune_time,
            rows: BTreeMap::new(),
            elapsed: Duration::ZERO,
        };
        let yesterday = today.pred_opt();

        for base in catalog.metric_bases() {
            let (Some(keys), Some(columns)) = (catalog.metric_keys(base), catalog.metric_columns(base))
            else {
                continue;
            };
            let written = average_family(conn, base, &keys, &columns, today, yesterday, &report)
                .in_phase(Phase::Rollup)?;
            report.rows.insert(base.to_string(), written);
        }
        report.elapsed = start.elapsed();

        info!(
            lower = report.lower,
            upper = report.upper,
            rows = report.total_rows(),
            "Average rollup complete"
        );
        Ok(report)
    }
}

fn average_family(
    conn: &mut Connection,
    base: &str,
    keys: &[&str],
    columns: &[&str],
    today: NaiveDate,
    yesterday: Option<NaiveDate>,
    window: &RollupReport,
) -> Result<usize, RecorderError> {
    let tx = conn.transaction()?;
    let raw = realtime_table(base, today);
    let avg = average_table(base, today);
    if !table_exists(&tx, &raw)? || !table_exists(&tx, &avg)? {
        debug!(base, "Metric partition missing, rollup skipped");
        return Ok(0);
    }

    let selected = keys
        .iter()
        .chain(["_ontunetime"].iter())
        .chain(columns.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    let mut source = format!("SELECT {} FROM {}", selected, raw);
    if let Some(day) = yesterday {
        let previous = realtime_table(base, day);
        if table_exists(&tx, &previous)? {
            source = format!("SELECT {} FROM {} UNION ALL {}", selected, previous, source);
        }
    }

    let key_list = keys.join(", ");
    let averages = columns
        .iter()
        .map(|c| format!("AVG({})", c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {avg} ({key_list}, _ontunetime, _agenttime, {cols})
         SELECT {key_list}, ?1, ?2, {averages} FROM ({source})
         WHERE _ontunetime > ?3 AND _ontunetime <= ?1
         GROUP BY {key_list}",
        cols = columns.join(", "),
    );

    let clock = read_clock(&tx)?;
    let written = tx.execute(&sql, params![window.upper, clock.agent_time, window.lower])?;
    if written > 0 {
        record_table_update(&tx, &avg, clock.ontune_time)?;
    }
    tx.commit()?;

    debug!(table = %avg, rows = written, "Averaged metric family");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn prepared(now: i64) -> (Store, SchemaCatalog) {
        let mut store = Store::open_in_memory().unwrap();
        store.set_clock(now, 0).unwrap();
        let mut catalog = SchemaCatalog::builtin().unwrap();
        catalog.ensure(store.connection_mut(), day()).unwrap();
        (store, catalog)
    }

    fn insert_node_perf(conn: &Connection, table: &str, node_id: i64, time: i64, cpu: f64) {
        conn.execute(
            &format!(
                "INSERT INTO {} (_nodeid, _ontunetime, _agenttime, _cpuusage) VALUES (?1, ?2, ?2, ?3)",
                table
            ),
            params![node_id, time, cpu],
        )
        .unwrap();
    }

    #[test]
    fn test_gate_fires_on_multiples_only() {
        let mut gate = RollupGate::new(Duration::from_secs(10), Duration::from_secs(30));
        let fired: Vec<bool> = (0..7).map(|_| gate.advance()).collect();

        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
        assert_eq!(gate.elapsed(), Duration::from_secs(70));
    }

    #[test]
    fn test_gate_with_non_multiple_intervals() {
        let mut gate = RollupGate::new(Duration::from_secs(7), Duration::from_secs(10));
        let first = (1..=10).position(|_| gate.advance());

        // 7 * 10 = 70 is the first multiple of 10
        assert_eq!(first, Some(9));
    }

    #[test]
    fn test_window_excludes_future_and_boundary_rows() {
        let t = 10_000;
        let (mut store, catalog) = prepared(t);
        let raw = realtime_table("kubenodeperf", day());
        {
            let conn = store.connection();
            insert_node_perf(conn, &raw, 1, t - 600, 90.0);
            insert_node_perf(conn, &raw, 1, t - 5, 10.0);
            insert_node_perf(conn, &raw, 1, t, 30.0);
            insert_node_perf(conn, &raw, 1, t + 1, 70.0);
        }

        let scheduler = AverageRollupScheduler::new(Duration::from_secs(600));
        let report = scheduler.rollup(store.connection_mut(), &catalog, day()).unwrap();

        assert_eq!((report.lower, report.upper), (t - 600, t));
        assert_eq!(report.rows.get("kubenodeperf"), Some(&1));
        assert_eq!(report.rows.get("kubepodperf"), Some(&0));

        let (node, time, cpu): (i64, i64, f64) = store
            .connection()
            .query_row(
                &format!(
                    "SELECT _nodeid, _ontunetime, _cpuusage FROM {}",
                    average_table("kubenodeperf", day())
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((node, time), (1, t));
        assert!((cpu - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_reads_yesterdays_partition() {
        let t = 20_000;
        let (mut store, catalog) = prepared(t);
        let yesterday = day().pred_opt().unwrap();
        let mut previous_catalog = SchemaCatalog::builtin().unwrap();
        previous_catalog
            .ensure(store.connection_mut(), yesterday)
            .unwrap();

        insert_node_perf(store.connection(), &realtime_table("kubenodeperf", yesterday), 4, t - 100, 40.0);
        insert_node_perf(store.connection(), &realtime_table("kubenodeperf", day()), 4, t - 10, 60.0);

        let scheduler = AverageRollupScheduler::new(Duration::from_secs(600));
        let report = scheduler.rollup(store.connection_mut(), &catalog, day()).unwrap();
        assert_eq!(report.total_rows(), 1);

        let cpu: f64 = store
            .connection()
            .query_row(
                &format!("SELECT _cpuusage FROM {}", average_table("kubenodeperf", day())),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((cpu - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_groups_by_composite_key() {
        let t = 5_000;
        let (mut store, catalog) = prepared(t);
        let raw = realtime_table("kubepodnet", day());
        for (pod, device, rate) in [(1, 1, 10), (1, 1, 30), (1, 2, 5), (2, 1, 7)] {
            store
                .connection()
                .execute(
                    &format!(
                        "INSERT INTO {} (_podid, _deviceid, _ontunetime, _agenttime, _netiorate)
                         VALUES (?1, ?2, ?3, ?3, ?4)",
                        raw
                    ),
                    params![pod, device, t - 1, rate],
                )
                .unwrap();
        }

        let scheduler = AverageRollupScheduler::new(Duration::from_secs(600));
        let report = scheduler.rollup(store.connection_mut(), &catalog, day()).unwrap();
        assert_eq!(report.rows.get("kubepodnet"), Some(&3));
    }
}
