//! Declarative table catalog
//!
//! Holds the reference, metric and index definitions and makes sure every
//! table a cycle writes to exists before the reconciler runs. Metric tables
//! are partitioned per day: each base name gets a `realtime` and an `avg`
//! table sharing one date suffix, plus an index on the raw table.

mod definitions;

pub use definitions::default_entries;

use crate::error::RecorderError;
use crate::store::{average_table, read_clock, realtime_table, record_table_update, table_exists};
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Kind of a schema definition row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Reference,
    Metric,
    Index,
}

/// One row of the schema definition
///
/// `columns` holds full column definitions for reference and metric
/// entries, and bare column names for index entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub kind: TableKind,
    pub name: String,
    pub columns: Vec<String>,
}

/// Metric table families written by the pipeline and averaged by the rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    NodePerf,
    NodeSysco,
    PodPerf,
    ContainerPerf,
    PodNet,
    PodVol,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 6] = [
        MetricFamily::NodePerf,
        MetricFamily::NodeSysco,
        MetricFamily::PodPerf,
        MetricFamily::ContainerPerf,
        MetricFamily::PodNet,
        MetricFamily::PodVol,
    ];

    pub fn base_name(&self) -> &'static str {
        match self {
            MetricFamily::NodePerf => "kubenodeperf",
            MetricFamily::NodeSysco => "kubenodesysco",
            MetricFamily::PodPerf => "kubepodperf",
            MetricFamily::ContainerPerf => "kubecontainerperf",
            MetricFamily::PodNet => "kubepodnet",
            MetricFamily::PodVol => "kubepodvol",
        }
    }

    /// Columns identifying the entity a row belongs to
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            MetricFamily::NodePerf => &["_nodeid"],
            MetricFamily::NodeSysco => &["_nodeid", "_syscontainerid"],
            MetricFamily::PodPerf => &["_podid"],
            MetricFamily::ContainerPerf => &["_containerid"],
            MetricFamily::PodNet => &["_podid", "_deviceid"],
            MetricFamily::PodVol => &["_podid", "_deviceid"],
        }
    }
}

#[derive(Debug, Clone)]
struct TableDef {
    name: String,
    columns: Vec<String>,
}

#[derive(Debug, Clone)]
struct MetricDef {
    base: String,
    columns: Vec<String>,
    index_columns: Vec<String>,
}

/// Outcome of one `ensure` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureReport {
    /// Tables served from the existence cache
    pub cached: usize,
    /// Tables created during this pass, in creation order
    pub created: Vec<String>,
}

/// Validated schema definition plus the table-existence cache
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    references: Vec<TableDef>,
    metrics: Vec<MetricDef>,
    known: HashSet<String>,
}

impl SchemaCatalog {
    /// Catalog describing every table the recorder writes
    pub fn builtin() -> Result<Self, RecorderError> {
        Self::from_entries(default_entries())
    }

    /// Validate a definition list into a catalog
    pub fn from_entries(entries: Vec<SchemaEntry>) -> Result<Self, RecorderError> {
        let mut references: Vec<TableDef> = Vec::new();
        let mut metrics: Vec<MetricDef> = Vec::new();
        let mut indexes: Vec<(String, Vec<String>)> = Vec::new();

        for entry in entries {
            check_identifier(&entry.name)?;
            if entry.columns.is_empty() {
                return Err(RecorderError::Schema(format!(
                    "{} has no columns",
                    entry.name
                )));
            }

            match entry.kind {
                TableKind::Reference => {
                    if references.iter().any(|t| t.name == entry.name) {
                        return Err(duplicate(&entry.name));
                    }
                    for column in &entry.columns {
                        column_name(column)?;
                    }
                    references.push(TableDef {
                        name: entry.name,
                        columns: entry.columns,
                    });
                }
                TableKind::Metric => {
                    if metrics.iter().any(|m| m.base == entry.name) {
                        return Err(duplicate(&entry.name));
                    }
                    for column in &entry.columns {
                        column_name(column)?;
                    }
                    metrics.push(MetricDef {
                        base: entry.name,
                        columns: entry.columns,
                        index_columns: Vec::new(),
                    });
                }
                TableKind::Index => {
                    for column in &entry.columns {
                        check_identifier(column)?;
                    }
                    indexes.push((entry.name, entry.columns));
                }
            }
        }

        for (name, columns) in indexes {
            let metric = metrics
                .iter_mut()
                .find(|m| m.base == name)
                .ok_or_else(|| {
                    RecorderError::Schema(format!("index declared for unknown metric {}", name))
                })?;
            metric.index_columns = columns;
        }

        if let Some(metric) = metrics.iter().find(|m| m.index_columns.is_empty()) {
            return Err(RecorderError::Schema(format!(
                "metric {} has no index entry",
                metric.base
            )));
        }

        Ok(Self {
            references,
            metrics,
            known: HashSet::new(),
        })
    }

    /// Parse a JSON array of schema entries
    pub fn from_json_str(json: &str) -> Result<Self, RecorderError> {
        let entries: Vec<SchemaEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    /// Load a JSON schema definition file
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        let catalog = Self::from_json_str(&json)
            .with_context(|| format!("invalid schema file {}", path.display()))?;
        info!(
            path = %path.display(),
            references = catalog.references.len(),
            metrics = catalog.metrics.len(),
            "Loaded schema definition"
        );
        Ok(catalog)
    }

    pub fn reference_tables(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|t| t.name.as_str())
    }

    pub fn metric_bases(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.base.as_str())
    }

    /// Declared value columns of a metric family, in declaration order
    ///
    /// Excludes the index (key) columns and both time columns.
    pub fn metric_columns(&self, base: &str) -> Option<Vec<&str>> {
        let metric = self.metrics.iter().find(|m| m.base == base)?;
        let columns = metric
            .columns
            .iter()
            .filter_map(|definition| column_name(definition).ok())
            .filter(|name| {
                *name != "_ontunetime"
                    && *name != "_agenttime"
                    && !metric.index_columns.iter().any(|k| k == name)
            })
            .collect();
        Some(columns)
    }

    /// Grouping keys of a metric family: its index columns without `_ontunetime`
    pub fn metric_keys(&self, base: &str) -> Option<Vec<&str>> {
        let metric = self.metrics.iter().find(|m| m.base == base)?;
        Some(
            metric
                .index_columns
                .iter()
                .map(String::as_str)
                .filter(|name| *name != "_ontunetime")
                .collect(),
        )
    }

    /// Create every missing reference table and the day's metric partitions
    ///
    /// Runs in one transaction; the existence cache is only extended once
    /// the transaction commits.
    pub fn ensure(
        &mut self,
        conn: &mut Connection,
        day: NaiveDate,
    ) -> Result<EnsureReport, RecorderError> {
        let mut report = EnsureReport::default();
        let mut confirmed = Vec::new();

        let tx = conn.transaction()?;
        let clock = read_clock(&tx)?;

        for table in &self.references {
            if self.known.contains(&table.name) {
                report.cached += 1;
                continue;
            }
            if !table_exists(&tx, &table.name)? {
                tx.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} ({});",
                    table.name,
                    table.columns.join(", ")
                ))?;
                record_table_update(&tx, &table.name, clock.ontune_time)?;
                info!(table = %table.name, "Created reference table");
                report.created.push(table.name.clone());
            }
            confirmed.push(table.name.clone());
        }

        for metric in &self.metrics {
            let raw = realtime_table(&metric.base, day);
            let avg = average_table(&metric.base, day);
            if self.known.contains(&raw) && self.known.contains(&avg) {
                report.cached += 2;
                continue;
            }

            for table in [&raw, &avg] {
                if table_exists(&tx, table)? {
                    continue;
                }
                tx.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} ({});",
                    table,
                    metric.columns.join(", ")
                ))?;
                record_table_update(&tx, table, clock.ontune_time)?;
                info!(table = %table, "Created metric table");
                report.created.push(table.clone());
            }

            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS i{raw} ON {raw} ({});",
                metric.index_columns.join(", ")
            ))?;
            confirmed.push(raw);
            confirmed.push(avg);
        }

        tx.commit()?;
        self.known.extend(confirmed);

        debug!(
            cached = report.cached,
            created = report.created.len(),
            "Schema check complete"
        );
        Ok(report)
    }
}

fn duplicate(name: &str) -> RecorderError {
    RecorderError::Schema(format!("{} is declared twice", name))
}

fn check_identifier(name: &str) -> Result<(), RecorderError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(RecorderError::Schema(format!(
            "{:?} is not a valid identifier",
            name
        )))
    }
}

/// Column name of a definition such as `_nodeid INTEGER NOT NULL`
fn column_name(definition: &str) -> Result<&str, RecorderError> {
    if definition.contains(';') || definition.contains("--") {
        return Err(RecorderError::Schema(format!(
            "column definition {:?} contains a statement separator",
            definition
        )));
    }
    let name = definition.split_whitespace().next().unwrap_or("");
    check_identifier(name)?;
    Ok(name)
}
