//! In-process dependency graph backed by petgraph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use super::DependencyManager;
use super::snapshot::{GraphSnapshot, SnapshotNode};
use crate::core::DinghyError;

#[derive(Debug, Default)]
struct Inner {
    /// Edges run parent → child.
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    raw_data: HashMap<String, String>,
}

impl Inner {
    fn ensure_node(&mut self, url: &str) -> NodeIndex {
        if let Some(&index) = self.node_map.get(url) {
            return index;
        }
        let index = self.graph.add_node(url.to_string());
        self.node_map.insert(url.to_string(), index);
        index
    }

    fn sorted_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        neighbors.dedup();
        neighbors
    }

    fn set_deps(&mut self, parent: &str, deps: &[String]) {
        let parent_idx = self.ensure_node(parent);
        let wanted: BTreeSet<&str> = deps.iter().map(String::as_str).collect();

        let current: Vec<NodeIndex> =
            self.graph.neighbors_directed(parent_idx, Direction::Outgoing).collect();
        for child_idx in current {
            if wanted.contains(self.graph[child_idx].as_str()) {
                continue;
            }
            while let Some(edge) = self.graph.find_edge(parent_idx, child_idx) {
                self.graph.remove_edge(edge);
            }
        }

        for child in wanted {
            let child_idx = self.ensure_node(child);
            if self.graph.find_edge(parent_idx, child_idx).is_none() {
                self.graph.add_edge(parent_idx, child_idx, ());
            }
        }
    }

    fn upstream_urls(&self, url: &str) -> (Vec<String>, Vec<String>) {
        let Some(&start) = self.node_map.get(url) else {
            return (Vec::new(), Vec::new());
        };

        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut upstreams = Vec::new();
        let mut roots = Vec::new();
        while let Some(current) = queue.pop_front() {
            for parent in self.sorted_neighbors(current, Direction::Incoming) {
                if !visited.insert(parent) {
                    continue;
                }
                let parent_url = self.graph[parent].clone();
                if self.graph.neighbors_directed(parent, Direction::Incoming).next().is_none() {
                    roots.push(parent_url.clone());
                }
                upstreams.push(parent_url);
                queue.push_back(parent);
            }
        }
        (upstreams, roots)
    }

    fn children(&self, url: &str) -> Vec<String> {
        self.node_map
            .get(url)
            .map(|&index| {
                self.sorted_neighbors(index, Direction::Outgoing)
                    .into_iter()
                    .map(|child| self.graph[child].clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Dependency graph held entirely in memory.
///
/// One lock guards nodes, edges and raw data, so every `set_deps` is observed
/// either completely or not at all.
#[derive(Debug, Default)]
pub struct MemoryDependencyGraph {
    inner: RwLock<Inner>,
}

impl MemoryDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parents of `url`, sorted.
    pub fn parents(&self, url: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .node_map
            .get(url)
            .map(|&index| {
                inner
                    .sorted_neighbors(index, Direction::Incoming)
                    .into_iter()
                    .map(|parent| inner.graph[parent].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of known URLs.
    pub fn len(&self) -> usize {
        self.inner.read().node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializable copy of the whole graph, nodes sorted by URL.
    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        let mut urls: Vec<&String> = inner.node_map.keys().collect();
        urls.sort();
        let nodes = urls
            .into_iter()
            .map(|url| SnapshotNode {
                url: url.clone(),
                children: inner.children(url),
                raw_data: inner.raw_data.get(url).cloned(),
            })
            .collect();
        GraphSnapshot {
            nodes,
        }
    }

    /// Rebuild a graph from a snapshot.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut inner = Inner::default();
        for node in snapshot.nodes {
            inner.ensure_node(&node.url);
            inner.set_deps(&node.url, &node.children);
            if let Some(raw) = node.raw_data {
                inner.raw_data.insert(node.url, raw);
            }
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub(super) fn set_deps_sync(&self, parent: &str, deps: &[String]) {
        self.inner.write().set_deps(parent, deps);
    }

    pub(super) fn set_raw_data_sync(&self, url: &str, raw: &str) {
        let mut inner = self.inner.write();
        inner.ensure_node(url);
        inner.raw_data.insert(url.to_string(), raw.to_string());
    }
}

#[async_trait]
impl DependencyManager for MemoryDependencyGraph {
    async fn set_deps(&self, parent: &str, deps: &[String]) -> Result<(), DinghyError> {
        self.set_deps_sync(parent, deps);
        Ok(())
    }

    async fn upstream_urls(&self, url: &str) -> Result<(Vec<String>, Vec<String>), DinghyError> {
        Ok(self.inner.read().upstream_urls(url))
    }

    async fn children(&self, url: &str) -> Result<Vec<String>, DinghyError> {
        Ok(self.inner.read().children(url))
    }

    async fn set_raw_data(&self, url: &str, raw: &str) -> Result<(), DinghyError> {
        self.set_raw_data_sync(url, raw);
        Ok(())
    }

    async fn get_raw_data(&self, url: &str) -> Result<Option<String>, DinghyError> {
        Ok(self.inner.read().raw_data.get(url).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_deps_replaces_children() {
        let graph = MemoryDependencyGraph::new();
        graph.set_deps("df", &urls(&["m1", "m2"])).await.unwrap();
        graph.set_deps("df", &urls(&["m2", "m3"])).await.unwrap();

        assert_eq!(graph.children("df").await.unwrap(), urls(&["m2", "m3"]));
        assert!(graph.parents("m1").is_empty());
        assert_eq!(graph.parents("m2"), urls(&["df"]));
        assert_eq!(graph.upstream_urls("m2").await.unwrap(), (urls(&["df"]), urls(&["df"])));
        assert_eq!(graph.upstream_urls("m1").await.unwrap(), (vec![], vec![]));
    }

    #[tokio::test]
    async fn test_set_deps_is_idempotent() {
        let graph = MemoryDependencyGraph::new();
        graph.set_deps("df", &urls(&["m1", "m2", "m1"])).await.unwrap();
        let first = graph.snapshot();
        graph.set_deps("df", &urls(&["m1", "m2", "m1"])).await.unwrap();
        assert_eq!(graph.snapshot(), first);
        assert_eq!(graph.children("df").await.unwrap(), urls(&["m1", "m2"]));
    }

    #[tokio::test]
    async fn test_upstream_roots_are_deduplicated() {
        let graph = MemoryDependencyGraph::new();
        graph.set_deps("df1", &urls(&["m1", "m2"])).await.unwrap();
        graph.set_deps("m1", &urls(&["m3"])).await.unwrap();
        graph.set_deps("m2", &urls(&["m3"])).await.unwrap();

        let (upstreams, roots) = graph.upstream_urls("m3").await.unwrap();
        assert_eq!(upstreams, urls(&["m1", "m2", "df1"]));
        assert_eq!(roots, urls(&["df1"]));
        assert_eq!(graph.get_roots("m3").await.unwrap(), urls(&["df1"]));
    }

    #[tokio::test]
    async fn test_traversal_terminates_on_cycles() {
        let graph = MemoryDependencyGraph::new();
        graph.set_deps("a", &urls(&["b"])).await.unwrap();
        graph.set_deps("b", &urls(&["c"])).await.unwrap();
        graph.set_deps("c", &urls(&["a"])).await.unwrap();

        let (upstreams, roots) = graph.upstream_urls("a").await.unwrap();
        assert_eq!(upstreams, urls(&["c", "b"]));
        assert!(roots.is_empty());
        assert!(!upstreams.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_url_has_no_upstreams() {
        let graph = MemoryDependencyGraph::new();
        assert_eq!(graph.upstream_urls("nowhere").await.unwrap(), (vec![], vec![]));
        assert!(graph.children("nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_raw_data() {
        let graph = MemoryDependencyGraph::new();
        graph.set_raw_data("df", r#"{"ref":"refs/heads/master"}"#).await.unwrap();
        let raw = graph.get_raw_data("df").await.unwrap();
        assert_eq!(raw.as_deref(), Some(r#"{"ref":"refs/heads/master"}"#));
        assert_eq!(graph.get_raw_data("other").await.unwrap(), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let graph = MemoryDependencyGraph::new();
        graph.set_deps_sync("df", &urls(&["m1"]));
        graph.set_raw_data_sync("df", "{}");
        let restored = MemoryDependencyGraph::from_snapshot(graph.snapshot());
        assert_eq!(restored.snapshot(), graph.snapshot());
        assert_eq!(restored.parents("m1"), urls(&["df"]));
    }
}
