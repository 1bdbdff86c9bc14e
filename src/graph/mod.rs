//! Dependency graph between dinghyfiles and the modules they include.
//!
//! Nodes are encoded file URLs (see [`crate::vcs::Downloader::encode_url`]).
//! An edge runs from a parent template to every module its last render
//! called. Roots, nodes without parents, are dinghyfiles; when a module
//! changes, [`DependencyManager::get_roots`] yields the dinghyfiles that must
//! be rebuilt.
//!
//! # Backends
//!
//! - [`MemoryDependencyGraph`]: petgraph store for a single process
//! - [`SnapshotDependencyGraph`]: the memory store persisted to a JSON file
//! - [`ReadOnlyDependencyManager`]: validation surrogate that drops writes

mod memory;
mod snapshot;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::DinghyError;

pub use memory::MemoryDependencyGraph;
pub use snapshot::{GraphSnapshot, SnapshotDependencyGraph, SnapshotNode};

/// Store of parent → child edges plus raw push payloads per dinghyfile.
#[async_trait]
pub trait DependencyManager: Send + Sync {
    /// Replace the children of `parent` with exactly `deps`.
    ///
    /// Creates `parent` and any new child as needed. Children that are no
    /// longer listed lose their back-edge to `parent`. Calling twice with the
    /// same arguments leaves the graph unchanged.
    async fn set_deps(&self, parent: &str, deps: &[String]) -> Result<(), DinghyError>;

    /// Transitive parents of `url` in breadth-first order, and the subset of
    /// them that have no parents. `url` itself is never included.
    async fn upstream_urls(&self, url: &str) -> Result<(Vec<String>, Vec<String>), DinghyError>;

    /// Dinghyfiles that (transitively) include `child`.
    async fn get_roots(&self, child: &str) -> Result<Vec<String>, DinghyError> {
        Ok(self.upstream_urls(child).await?.1)
    }

    /// Direct children of `url`, sorted.
    async fn children(&self, url: &str) -> Result<Vec<String>, DinghyError>;

    /// Store the push payload that last rendered the dinghyfile at `url`.
    async fn set_raw_data(&self, url: &str, raw: &str) -> Result<(), DinghyError>;

    /// Payload stored by [`set_raw_data`](Self::set_raw_data), if any.
    async fn get_raw_data(&self, url: &str) -> Result<Option<String>, DinghyError>;
}

/// Wraps a graph so that reads pass through and writes are discarded.
///
/// Validation runs render against this so a branch that is never merged
/// cannot rewire the production graph.
pub struct ReadOnlyDependencyManager {
    inner: Arc<dyn DependencyManager>,
}

impl ReadOnlyDependencyManager {
    pub fn new(inner: Arc<dyn DependencyManager>) -> Self {
        Self {
            inner,
        }
    }
}

#[async_trait]
impl DependencyManager for ReadOnlyDependencyManager {
    async fn set_deps(&self, parent: &str, deps: &[String]) -> Result<(), DinghyError> {
        tracing::debug!(
            "read-only graph: skipping set_deps for {} ({} children)",
            parent,
            deps.len()
        );
        Ok(())
    }

    async fn upstream_urls(&self, url: &str) -> Result<(Vec<String>, Vec<String>), DinghyError> {
        self.inner.upstream_urls(url).await
    }

    async fn children(&self, url: &str) -> Result<Vec<String>, DinghyError> {
        self.inner.children(url).await
    }

    async fn set_raw_data(&self, url: &str, _raw: &str) -> Result<(), DinghyError> {
        tracing::debug!("read-only graph: skipping raw data for {}", url);
        Ok(())
    }

    async fn get_raw_data(&self, url: &str) -> Result<Option<String>, DinghyError> {
        self.inner.get_raw_data(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_only_drops_writes() {
        let inner = Arc::new(MemoryDependencyGraph::new());
        inner.set_deps("df", &["m1".to_string()]).await.unwrap();
        let read_only = ReadOnlyDependencyManager::new(inner.clone());

        read_only.set_deps("df", &["m2".to_string()]).await.unwrap();
        read_only.set_raw_data("df", "{}").await.unwrap();

        assert_eq!(read_only.children("df").await.unwrap(), vec!["m1".to_string()]);
        assert_eq!(inner.get_raw_data("df").await.unwrap(), None);
        assert_eq!(read_only.get_roots("m1").await.unwrap(), vec!["df".to_string()]);
    }
}
