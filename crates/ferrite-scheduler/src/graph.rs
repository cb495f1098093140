//! Pipeline dependency graph construction.
//!
//! Built fresh from the current configuration snapshot on every resolution,
//! never cached across resolutions and never mutated in place. A visited set
//! keyed by pipeline name tolerates configuration that (incorrectly)
//! declares a cycle: a revisit adds an edge at most, never recursion, and an
//! edge that would close a cycle is dropped.

use ferrite_core::config::PipelineConfig;
use ferrite_core::ids::{Fingerprint, PipelineName};
use ferrite_core::material::Material;
use ferrite_core::ports::ConfigProvider;
use ferrite_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug)]
pub struct GraphNode {
    pub config: PipelineConfig,
}

/// Dependency graph rooted at one pipeline, children pointing upstream.
#[derive(Debug)]
pub struct PipelineDependencyGraph {
    graph: DiGraph<GraphNode, ()>,
    name_to_index: HashMap<PipelineName, NodeIndex>,
    root: NodeIndex,
}

impl PipelineDependencyGraph {
    pub async fn build(
        target: &PipelineName,
        configs: &dyn ConfigProvider,
    ) -> Result<Self> {
        let root_config = configs.pipeline_config(target).await?;
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        let root = graph.add_node(GraphNode {
            config: root_config.clone(),
        });
        name_to_index.insert(root_config.name.clone(), root);

        let mut queue = VecDeque::new();
        queue.push_back(root);

        while let Some(idx) = queue.pop_front() {
            let upstreams: Vec<PipelineName> = graph[idx]
                .config
                .dependency_materials()
                .filter_map(|m| m.dependency_pipeline().cloned())
                .collect();

            for upstream in upstreams {
                let upstream_idx = match name_to_index.get(&upstream) {
                    Some(&existing) => existing,
                    None => {
                        let config = match configs.pipeline_config(&upstream).await {
                            Ok(config) => config,
                            Err(Error::PipelineNotFound(name)) => {
                                debug!(pipeline = %name, "upstream vanished from configuration, skipping");
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                        let new_idx = graph.add_node(GraphNode { config });
                        name_to_index.insert(upstream.clone(), new_idx);
                        queue.push_back(new_idx);
                        new_idx
                    }
                };
                let edge = graph.add_edge(idx, upstream_idx, ());
                if is_cyclic_directed(&graph) {
                    graph.remove_edge(edge);
                    debug!(
                        pipeline = %graph[idx].config.name,
                        upstream = %upstream,
                        "dependency declares a cycle, ignoring edge"
                    );
                }
            }
        }

        Ok(Self {
            graph,
            name_to_index,
            root,
        })
    }

    pub fn root(&self) -> &GraphNode {
        &self.graph[self.root]
    }

    pub fn node(&self, name: &PipelineName) -> Option<&GraphNode> {
        self.name_to_index.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn contains(&self, name: &PipelineName) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn upstream_nodes(&self) -> Vec<&GraphNode> {
        self.graph
            .node_indices()
            .filter(|&idx| idx != self.root)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Every distinct root-to-node path, root first. Prefixes are recorded,
    /// so a node reachable two ways contributes two paths ending at it.
    pub fn dependency_paths(&self) -> Vec<Vec<PipelineName>> {
        let mut out = Vec::new();
        let mut current = vec![self.root];
        self.collect_paths(&mut current, &mut out);
        out
    }

    fn collect_paths(&self, current: &mut Vec<NodeIndex>, out: &mut Vec<Vec<PipelineName>>) {
        out.push(
            current
                .iter()
                .map(|&idx| self.graph[idx].config.name.clone())
                .collect(),
        );
        let Some(&last) = current.last() else {
            return;
        };
        for child in self.graph.neighbors_directed(last, Direction::Outgoing) {
            if current.contains(&child) {
                continue;
            }
            current.push(child);
            self.collect_paths(current, out);
            current.pop();
        }
    }

    pub fn paths_containing(&self, name: &PipelineName) -> Vec<Vec<PipelineName>> {
        self.dependency_paths()
            .into_iter()
            .filter(|path| path.iter().any(|n| n == name))
            .collect()
    }

    fn path_counts(&self) -> HashMap<PipelineName, usize> {
        let mut counts = HashMap::new();
        for path in self.dependency_paths() {
            if let Some(last) = path.last() {
                *counts.entry(last.clone()).or_insert(0usize) += 1;
            }
        }
        counts
    }

    /// Nodes whose configuration consumes the material directly.
    pub fn consumers_of(&self, fingerprint: &Fingerprint) -> Vec<&GraphNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph[idx]
                    .config
                    .materials
                    .iter()
                    .any(|m| &m.fingerprint == fingerprint)
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Fingerprints reachable through more than one dependency path, the
    /// ones that need consistency resolution.
    pub fn shared_fingerprints(&self) -> HashSet<Fingerprint> {
        let counts = self.path_counts();
        let mut totals: HashMap<Fingerprint, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let reach = counts.get(&node.config.name).copied().unwrap_or(0);
            for material in &node.config.materials {
                *totals.entry(material.fingerprint.clone()).or_insert(0) += reach;
            }
        }
        totals
            .into_iter()
            .filter(|(_, n)| *n >= 2)
            .map(|(fingerprint, _)| fingerprint)
            .collect()
    }

    /// Materials of the root pipeline no other path reaches.
    pub fn unshared_root_materials(&self) -> Vec<&Material> {
        let shared = self.shared_fingerprints();
        self.root()
            .config
            .materials
            .iter()
            .filter(|m| !shared.contains(&m.fingerprint))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dep_material, git_material, pipeline_config, InMemoryConfig};
    use std::sync::Arc;

    fn diamond() -> InMemoryConfig {
        // p -> a -> u, p -> b -> u, u consumes git material "m1"
        let configs = InMemoryConfig::new();
        configs.add(pipeline_config(
            "p",
            vec![dep_material("a", "dist"), dep_material("b", "dist")],
            vec!["build"],
        ));
        configs.add(pipeline_config(
            "a",
            vec![dep_material("u", "dist")],
            vec!["dist"],
        ));
        configs.add(pipeline_config(
            "b",
            vec![dep_material("u", "dist")],
            vec!["dist"],
        ));
        configs.add(pipeline_config("u", vec![git_material("m1")], vec!["dist"]));
        configs
    }

    #[tokio::test]
    async fn test_diamond_paths() {
        let configs = Arc::new(diamond());
        let graph = PipelineDependencyGraph::build(&"p".into(), configs.as_ref())
            .await
            .unwrap();

        assert_eq!(graph.upstream_nodes().len(), 3);
        // u is reachable via a and via b
        let through_u = graph.paths_containing(&"u".into());
        assert_eq!(through_u.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_fingerprint_detected_through_diamond() {
        let configs = Arc::new(diamond());
        let graph = PipelineDependencyGraph::build(&"p".into(), configs.as_ref())
            .await
            .unwrap();

        let shared = graph.shared_fingerprints();
        assert!(shared.contains(&Fingerprint::new("m1")));
    }

    #[tokio::test]
    async fn test_directly_shared_material() {
        let configs = InMemoryConfig::new();
        configs.add(pipeline_config(
            "p",
            vec![git_material("m1"), dep_material("u", "dist")],
            vec!["build"],
        ));
        configs.add(pipeline_config("u", vec![git_material("m1")], vec!["dist"]));

        let graph = PipelineDependencyGraph::build(&"p".into(), &configs)
            .await
            .unwrap();
        assert!(graph.shared_fingerprints().contains(&Fingerprint::new("m1")));
        // only the dependency material itself stays unshared
        let unshared = graph.unshared_root_materials();
        assert!(unshared.iter().all(|m| m.is_dependency()));
    }

    #[tokio::test]
    async fn test_cycle_in_configuration_is_tolerated() {
        let configs = InMemoryConfig::new();
        configs.add(pipeline_config(
            "p",
            vec![dep_material("u", "dist")],
            vec!["build"],
        ));
        // u incorrectly depends back on p
        configs.add(pipeline_config(
            "u",
            vec![dep_material("p", "build")],
            vec!["dist"],
        ));

        let graph = PipelineDependencyGraph::build(&"p".into(), &configs)
            .await
            .unwrap();
        // traversal terminates and the back edge is dropped
        assert_eq!(graph.dependency_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_upstream_is_skipped() {
        let configs = InMemoryConfig::new();
        configs.add(pipeline_config(
            "p",
            vec![dep_material("gone", "dist")],
            vec!["build"],
        ));

        let graph = PipelineDependencyGraph::build(&"p".into(), &configs)
            .await
            .unwrap();
        assert!(graph.upstream_nodes().is_empty());
    }
}
