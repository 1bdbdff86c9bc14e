//! Dependency graph persisted as a JSON snapshot.
//!
//! The whole graph is rewritten after every mutation using a temp file and a
//! rename, so a crash leaves either the old or the new snapshot on disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{DependencyManager, MemoryDependencyGraph};
use crate::core::DinghyError;
use crate::utils::atomic_write;

/// On-disk representation of a dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

/// [`MemoryDependencyGraph`] that survives restarts.
pub struct SnapshotDependencyGraph {
    graph: MemoryDependencyGraph,
    path: PathBuf,
    /// Serializes mutate-then-write so snapshots land in mutation order.
    write_lock: Mutex<()>,
}

impl SnapshotDependencyGraph {
    /// Load the snapshot at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let graph = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let snapshot: GraphSnapshot = serde_json::from_str(&content).with_context(|| {
                    format!("Failed to parse graph snapshot: {}", path.display())
                })?;
                let count = snapshot.nodes.len();
                tracing::info!("loaded {} graph nodes from {}", count, path.display());
                MemoryDependencyGraph::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryDependencyGraph::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read graph snapshot: {}", path.display()));
            }
        };
        Ok(Self {
            graph,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory graph behind the snapshot.
    pub fn graph(&self) -> &MemoryDependencyGraph {
        &self.graph
    }

    async fn persist(&self) -> Result<(), DinghyError> {
        let snapshot = self.graph.snapshot();
        let content = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| DinghyError::Config(format!("failed to serialize graph snapshot: {e}")))?;
        atomic_write(&self.path, &content).await.map_err(|e| {
            let path = self.path.display();
            DinghyError::Config(format!("failed to write graph snapshot {path}: {e:#}"))
        })
    }
}

#[async_trait]
impl DependencyManager for SnapshotDependencyGraph {
    async fn set_deps(&self, parent: &str, deps: &[String]) -> Result<(), DinghyError> {
        let _guard = self.write_lock.lock().await;
        self.graph.set_deps_sync(parent, deps);
        self.persist().await
    }

    async fn upstream_urls(&self, url: &str) -> Result<(Vec<String>, Vec<String>), DinghyError> {
        self.graph.upstream_urls(url).await
    }

    async fn children(&self, url: &str) -> Result<Vec<String>, DinghyError> {
        self.graph.children(url).await
    }

    async fn set_raw_data(&self, url: &str, raw: &str) -> Result<(), DinghyError> {
        let _guard = self.write_lock.lock().await;
        self.graph.set_raw_data_sync(url, raw);
        self.persist().await
    }

    async fn get_raw_data(&self, url: &str) -> Result<Option<String>, DinghyError> {
        self.graph.get_raw_data(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("graph.json");

        let graph = SnapshotDependencyGraph::open(&path).await.unwrap();
        assert!(graph.graph().is_empty());
        graph.set_deps("df", &["m1".to_string(), "m2".to_string()]).await.unwrap();
        graph.set_raw_data("df", r#"{"after":"abc"}"#).await.unwrap();
        assert!(path.exists());

        let reopened = SnapshotDependencyGraph::open(&path).await.unwrap();
        assert_eq!(
            reopened.children("df").await.unwrap(),
            vec!["m1".to_string(), "m2".to_string()]
        );
        assert_eq!(reopened.get_roots("m2").await.unwrap(), vec!["df".to_string()]);
        let raw = reopened.get_raw_data("df").await.unwrap();
        assert_eq!(raw.as_deref(), Some(r#"{"after":"abc"}"#));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(SnapshotDependencyGraph::open(&path).await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_writes_keep_the_last_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        let graph = std::sync::Arc::new(SnapshotDependencyGraph::open(&path).await.unwrap());

        let writes = (0..8).map(|i| {
            let graph = graph.clone();
            tokio::spawn(async move { graph.set_deps(&format!("df{i}"), &["m".to_string()]).await })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let reopened = SnapshotDependencyGraph::open(&path).await.unwrap();
        assert_eq!(reopened.get_roots("m").await.unwrap().len(), 8);
    }
}
