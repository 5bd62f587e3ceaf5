//! Relational store access
//!
//! Wraps the SQLite connection and the two infrastructure tables every
//! cycle depends on:
//! - `kubetableinfo`: which tables exist and when they were last written
//! - `ontuneinfo`: the shared tick counter ("ontune time") and time bias

mod refs;

pub use refs::{
    id_map, load_cluster_refs, set_enabled, RefTable, StoredRef, CLUSTERS, CONTAINERS,
    CONTAINER_SPECS, DAEMONSETS, DEPLOYMENTS, DEVICES, MANAGERS, NAMESPACES, NODES,
    NODE_SYSTEM_CONTAINERS, PODS, REPLICASETS, SERVICES, STATEFULSETS,
};

use crate::error::RecorderError;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Bookkeeping table recording table creation and last write
pub const TABLE_INFO: &str = "kubetableinfo";

/// Time-synchronization table
pub const CLOCK_TABLE: &str = "ontuneinfo";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamps stamped on every row of a write batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    /// Monotonic tick counter shared by all writers
    pub ontune_time: i64,
    /// Base time shifted by the configured bias
    pub agent_time: i64,
}

/// Owner of the database connection
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RecorderError::Schema(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = wal;")?;
        info!(path = %path.display(), "Opened recorder database");

        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, RecorderError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RecorderError> {
        let store = Self { conn };
        store.bootstrap()?;
        Ok(store)
    }

    /// Create the bookkeeping and clock tables when absent
    fn bootstrap(&self) -> Result<(), RecorderError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kubetableinfo (
                _tablename TEXT PRIMARY KEY,
                _createdtime INTEGER NOT NULL,
                _updatetime INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ontuneinfo (
                _time INTEGER NOT NULL,
                _bias INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        let rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ontuneinfo", [], |row| row.get(0))?;
        if rows == 0 {
            let now = chrono::Utc::now().timestamp();
            self.conn.execute(
                "INSERT INTO ontuneinfo (_time, _bias) VALUES (?1, 0)",
                params![now],
            )?;
            debug!(ontune_time = now, "Seeded time synchronization record");
        }

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Read the current clock
    pub fn clock(&self) -> Result<Clock, RecorderError> {
        read_clock(&self.conn)
    }

    /// Overwrite the clock record
    pub fn set_clock(&self, time: i64, bias_minutes: i64) -> Result<(), RecorderError> {
        self.conn.execute(
            "UPDATE ontuneinfo SET _time = ?1, _bias = ?2",
            params![time, bias_minutes],
        )?;
        Ok(())
    }

    /// Move the tick counter forward to `now`, never backwards
    pub fn advance_clock(&self, now: i64, bias_minutes: i64) -> Result<Clock, RecorderError> {
        self.conn.execute(
            "UPDATE ontuneinfo SET _time = MAX(_time, ?1), _bias = ?2",
            params![now, bias_minutes],
        )?;
        read_clock(&self.conn)
    }
}

/// Read the clock record; absence is a named error, not a zero clock
pub fn read_clock(conn: &Connection) -> Result<Clock, RecorderError> {
    let row: Option<(i64, i64)> = conn
        .query_row("SELECT _time, _bias FROM ontuneinfo LIMIT 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;

    let (time, bias) = row.ok_or(RecorderError::MissingClock)?;
    Ok(Clock {
        ontune_time: time,
        agent_time: time + bias * 60,
    })
}

/// Whether a table exists in the database
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, RecorderError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Record that a table was created or written at `ontune_time`
pub fn record_table_update(
    conn: &Connection,
    table: &str,
    ontune_time: i64,
) -> Result<(), RecorderError> {
    conn.execute(
        "INSERT INTO kubetableinfo (_tablename, _createdtime, _updatetime)
         VALUES (?1, ?2, ?2)
         ON CONFLICT(_tablename) DO UPDATE SET _updatetime = excluded._updatetime",
        params![table, ontune_time],
    )?;
    Ok(())
}

/// Date code shared by a day's realtime and avg partitions, e.g. `24031500`
pub fn partition_suffix(day: NaiveDate) -> String {
    format!("{}00", day.format("%y%m%d"))
}

pub fn realtime_table(base: &str, day: NaiveDate) -> String {
    format!("realtime{}{}", base, partition_suffix(day))
}

pub fn average_table(base: &str, day: NaiveDate) -> String {
    format!("avg{}{}", base, partition_suffix(day))
}

/// Clamp an unsigned counter into SQLite's integer range
pub fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
