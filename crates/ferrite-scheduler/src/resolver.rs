//! Revision resolution for shared upstream materials.
//!
//! Turns a freshly observed material-revision snapshot into the set of
//! revisions a new run should actually pin, resolving conflicts when several
//! dependency paths reconverge on the same material. Two modes exist behind
//! a global compatibility switch: the triangle mode only overrides shared
//! materials along changed dependency paths; the fan-in mode computes one
//! revision per shared material consistent with every path that reaches it.
//!
//! Resolution never mutates configuration and is idempotent: the same
//! snapshot against the same configuration and history always yields the
//! same output. No modification is ever synthesized: every override comes
//! from a revision some reachable upstream instance actually exhibited, and
//! a fingerprint with no reachable instance falls back to the literal
//! incoming revision.

use crate::config::ResolutionMode;
use crate::graph::PipelineDependencyGraph;
use ferrite_core::Result;
use ferrite_core::ids::{Fingerprint, PipelineName};
use ferrite_core::material::{MaterialRevisions, Modification};
use ferrite_core::ports::{ConfigProvider, PipelineStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Upper bound on how far back one refinement step scans upstream history.
const HISTORY_SCAN_LIMIT: usize = 50;

pub struct RevisionResolver {
    configs: Arc<dyn ConfigProvider>,
    pipelines: Arc<dyn PipelineStore>,
    mode: ResolutionMode,
}

impl RevisionResolver {
    pub fn new(
        configs: Arc<dyn ConfigProvider>,
        pipelines: Arc<dyn PipelineStore>,
        mode: ResolutionMode,
    ) -> Self {
        Self {
            configs,
            pipelines,
            mode,
        }
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    /// Computes the authoritative revisions for a new run of `pipeline`.
    ///
    /// `Ok(None)` means resolution decided no new build cause is warranted
    /// (triangle mode only: nothing relevant changed).
    pub async fn resolve(
        &self,
        pipeline: &PipelineName,
        incoming: &MaterialRevisions,
    ) -> Result<Option<MaterialRevisions>> {
        let graph = PipelineDependencyGraph::build(pipeline, self.configs.as_ref()).await?;
        if graph.upstream_nodes().is_empty() {
            return Ok(Some(incoming.clone()));
        }
        match self.mode {
            ResolutionMode::Triangle => self.resolve_triangle(&graph, incoming).await,
            ResolutionMode::FanIn => self.resolve_fan_in(&graph, incoming).await.map(Some),
        }
    }

    async fn resolve_triangle(
        &self,
        graph: &PipelineDependencyGraph,
        incoming: &MaterialRevisions,
    ) -> Result<Option<MaterialRevisions>> {
        let shared = graph.shared_fingerprints();

        let unshared_changed = incoming
            .iter()
            .any(|r| r.changed && !shared.contains(r.fingerprint()));
        if !unshared_changed && self.shared_revisions_consistent(graph, incoming, &shared).await? {
            debug!(pipeline = %graph.root().config.name, "no relevant changes, skipping resolution");
            return Ok(None);
        }

        let root_fingerprints: HashSet<&Fingerprint> = graph
            .root()
            .config
            .materials
            .iter()
            .map(|m| &m.fingerprint)
            .collect();

        let mut overrides: HashMap<Fingerprint, Vec<Modification>> = HashMap::new();
        for revision in incoming.iter() {
            if !revision.changed {
                continue;
            }
            let Some(dep) = revision.dependency_revision() else {
                continue;
            };
            if graph.paths_containing(&dep.pipeline).is_empty() {
                continue;
            }
            let Some(upstream) = graph.node(&dep.pipeline) else {
                continue;
            };
            for material in &upstream.config.materials {
                if material.is_dependency() {
                    continue;
                }
                if !root_fingerprints.contains(&material.fingerprint) {
                    continue;
                }
                let used = self
                    .pipelines
                    .material_revision_used(
                        &dep.pipeline,
                        dep.pipeline_counter,
                        &material.fingerprint,
                    )
                    .await?;
                if let Some(used) = used {
                    overrides.insert(material.fingerprint.clone(), used.modifications);
                }
            }
        }

        Ok(Some(apply_overrides(incoming, &overrides)))
    }

    /// Whether every shared material's incoming revision agrees with what
    /// the upstream instances named by the incoming dependency revisions
    /// actually built with.
    async fn shared_revisions_consistent(
        &self,
        graph: &PipelineDependencyGraph,
        incoming: &MaterialRevisions,
        shared: &HashSet<Fingerprint>,
    ) -> Result<bool> {
        for revision in incoming.iter() {
            let Some(dep) = revision.dependency_revision() else {
                continue;
            };
            let Some(upstream) = graph.node(&dep.pipeline) else {
                continue;
            };
            for material in &upstream.config.materials {
                if material.is_dependency() || !shared.contains(&material.fingerprint) {
                    continue;
                }
                let Some(ours) = incoming.find_by_fingerprint(&material.fingerprint) else {
                    continue;
                };
                let used = self
                    .pipelines
                    .material_revision_used(
                        &dep.pipeline,
                        dep.pipeline_counter,
                        &material.fingerprint,
                    )
                    .await?;
                if let Some(used) = used {
                    if used.latest_revision() != ours.latest_revision() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn resolve_fan_in(
        &self,
        graph: &PipelineDependencyGraph,
        incoming: &MaterialRevisions,
    ) -> Result<MaterialRevisions> {
        let shared = graph.shared_fingerprints();
        if shared.is_empty() {
            return Ok(incoming.clone());
        }

        // Candidate instance per upstream node, seeded from the incoming
        // dependency revision where present, else the latest passed run.
        let mut candidates: HashMap<PipelineName, u32> = HashMap::new();
        for node in graph.upstream_nodes() {
            let name = node.config.name.clone();
            let seeded = incoming.iter().find_map(|r| {
                r.dependency_revision()
                    .filter(|d| d.pipeline == name)
                    .map(|d| d.pipeline_counter)
            });
            let counter = match seeded {
                Some(counter) => Some(counter),
                None => self.pipelines.latest_passed_counter(&name).await?,
            };
            if let Some(counter) = counter {
                candidates.insert(name, counter);
            }
        }

        let root_name = graph.root().config.name.clone();
        let mut fallback: HashSet<Fingerprint> = HashSet::new();

        // Fixed point: for each shared material take the oldest proposed
        // revision and step newer upstream candidates down until every path
        // agrees. Counters only ever decrease, so this terminates; the round
        // count is bounded by the number of distinct dependency paths.
        let max_rounds = graph.dependency_paths().len().max(1);
        for _ in 0..max_rounds {
            let mut refined = false;
            for fingerprint in &shared {
                if self.is_dependency_fingerprint(graph, fingerprint) {
                    continue;
                }
                let proposals = self
                    .proposals_for(graph, incoming, &candidates, &root_name, fingerprint)
                    .await?;
                if proposals.len() < 2 {
                    continue;
                }
                let Some(target) = proposals
                    .iter()
                    .map(|(_, m)| m)
                    .min_by(|a, b| (a.modified_at, &a.revision).cmp(&(b.modified_at, &b.revision)))
                    .cloned()
                else {
                    continue;
                };
                for (proposer, modification) in &proposals {
                    if modification.revision == target.revision {
                        continue;
                    }
                    // the root's literal revision yields to upstream
                    // instances without refinement
                    let Some(name) = proposer else {
                        continue;
                    };
                    let Some(&current) = candidates.get(name) else {
                        continue;
                    };
                    match self.step_down(name, current, fingerprint, &target).await? {
                        Some(new_counter) => {
                            candidates.insert(name.clone(), new_counter);
                            refined = true;
                        }
                        None => {
                            fallback.insert(fingerprint.clone());
                        }
                    }
                }
            }
            if !refined {
                break;
            }
        }

        // Materialize the agreed selection, restoring original material
        // identity and ordering from the incoming snapshot.
        let mut overrides: HashMap<Fingerprint, Vec<Modification>> = HashMap::new();
        for revision in incoming.iter() {
            let fingerprint = revision.fingerprint();
            if let Some(dep) = revision.dependency_revision() {
                let Some(&counter) = candidates.get(&dep.pipeline) else {
                    continue;
                };
                if counter == dep.pipeline_counter {
                    continue;
                }
                let pinned = self
                    .pipelines
                    .dependency_modification(&dep.pipeline, counter)
                    .await?;
                if let Some(modification) = pinned {
                    overrides.insert(fingerprint.clone(), vec![modification]);
                }
                continue;
            }
            if !shared.contains(fingerprint) || fallback.contains(fingerprint) {
                continue;
            }
            for consumer in graph.consumers_of(fingerprint) {
                let name = &consumer.config.name;
                if name == &root_name {
                    continue;
                }
                let Some(&counter) = candidates.get(name) else {
                    continue;
                };
                let used = self
                    .pipelines
                    .material_revision_used(name, counter, fingerprint)
                    .await?;
                if let Some(used) = used {
                    if used.latest_revision() != revision.latest_revision() {
                        overrides.insert(fingerprint.clone(), used.modifications);
                    }
                    break;
                }
            }
        }

        Ok(apply_overrides(incoming, &overrides))
    }

    fn is_dependency_fingerprint(
        &self,
        graph: &PipelineDependencyGraph,
        fingerprint: &Fingerprint,
    ) -> bool {
        graph.consumers_of(fingerprint).iter().any(|n| {
            n.config
                .materials
                .iter()
                .any(|m| &m.fingerprint == fingerprint && m.is_dependency())
        })
    }

    /// One revision proposal per path-reachable consumer of the material:
    /// the root contributes its literal incoming revision, upstream nodes
    /// contribute whatever their candidate instance built with.
    async fn proposals_for(
        &self,
        graph: &PipelineDependencyGraph,
        incoming: &MaterialRevisions,
        candidates: &HashMap<PipelineName, u32>,
        root_name: &PipelineName,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<(Option<PipelineName>, Modification)>> {
        let mut proposals = Vec::new();
        for consumer in graph.consumers_of(fingerprint) {
            let name = &consumer.config.name;
            if name == root_name {
                if let Some(revision) = incoming.find_by_fingerprint(fingerprint) {
                    if let Some(modification) = revision.latest_modification() {
                        proposals.push((None, modification.clone()));
                    }
                }
            } else if let Some(&counter) = candidates.get(name) {
                let used = self
                    .pipelines
                    .material_revision_used(name, counter, fingerprint)
                    .await?;
                if let Some(used) = used {
                    if let Some(modification) = used.latest_modification() {
                        proposals.push((Some(name.clone()), modification.clone()));
                    }
                }
            }
        }
        Ok(proposals)
    }

    /// Finds the newest passed instance of `name` below `below` whose
    /// revision of the material is consistent with (equal to, or older
    /// than) `target`. `None` means no reachable instance exists.
    async fn step_down(
        &self,
        name: &PipelineName,
        below: u32,
        fingerprint: &Fingerprint,
        target: &Modification,
    ) -> Result<Option<u32>> {
        let counters = self
            .pipelines
            .passed_counters_descending(name, Some(below), HISTORY_SCAN_LIMIT)
            .await?;
        for counter in counters {
            let used = self
                .pipelines
                .material_revision_used(name, counter, fingerprint)
                .await?;
            if let Some(used) = used {
                if let Some(modification) = used.latest_modification() {
                    if modification.revision == target.revision
                        || modification.modified_at < target.modified_at
                    {
                        return Ok(Some(counter));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn apply_overrides(
    incoming: &MaterialRevisions,
    overrides: &HashMap<Fingerprint, Vec<Modification>>,
) -> MaterialRevisions {
    incoming
        .iter()
        .map(|revision| match overrides.get(revision.fingerprint()) {
            Some(modifications) => revision.with_modifications(modifications.clone()),
            None => revision.clone(),
        })
        .collect()
}
