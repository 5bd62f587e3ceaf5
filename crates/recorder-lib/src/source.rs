//! Snapshot sources
//!
//! The recorder does not poll the cluster API itself; a `SnapshotSource`
//! hands it one `ClusterSnapshot` per tick.

use crate::models::ClusterSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supplies the snapshot recorded on each tick
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<ClusterSnapshot>;

    /// Short label for logs and health messages
    fn describe(&self) -> String;
}

/// Reads a JSON snapshot file on every fetch
///
/// An external poller rewrites the file between ticks.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn fetch(&self) -> Result<ClusterSnapshot> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", self.path.display()))?;
        let snapshot: ClusterSnapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse snapshot {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            nodes = snapshot.nodes.len(),
            pods = snapshot.pods.len(),
            "Loaded snapshot"
        );
        Ok(snapshot)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
