//! DAG resolution. Run this before scheduling a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. The directed graph must be acyclic. Cycles are found with a
//!    three-colour depth-first walk so the error can name the exact loop.
//!
//! On success the resolver hands back per-node dependency sets; the scheduler
//! works from readiness rather than a single global order. All collections
//! are ordered so identical graphs always resolve identically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::ValidationError;
use crate::models::{NodeSpec, WorkflowGraph};

/// Validates graphs and computes their dependency structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphResolver;

impl GraphResolver {
    pub fn new() -> Self {
        Self
    }

    /// Validate `graph` and return its dependency structure.
    ///
    /// # Errors
    /// - [`ValidationError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`ValidationError::DependencyUnresolved`] if an edge references a missing node.
    /// - [`ValidationError::CycleDetected`] if the graph is not acyclic.
    pub fn resolve(&self, graph: &WorkflowGraph) -> Result<ResolvedGraph, ValidationError> {
        let mut nodes: BTreeMap<String, NodeSpec> = BTreeMap::new();
        for node in &graph.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(ValidationError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut dependencies: BTreeMap<String, BTreeSet<String>> =
            nodes.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        let mut dependents = dependencies.clone();

        for edge in &graph.edges {
            if !nodes.contains_key(&edge.source) {
                return Err(ValidationError::DependencyUnresolved {
                    node_id: edge.source.clone(),
                    side: "source",
                });
            }
            if !nodes.contains_key(&edge.target) {
                return Err(ValidationError::DependencyUnresolved {
                    node_id: edge.target.clone(),
                    side: "target",
                });
            }
            dependents
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.target.clone());
            dependencies
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.source.clone());
        }

        if let Some(cycle) = find_cycle(&dependents) {
            return Err(ValidationError::CycleDetected { cycle });
        }

        Ok(ResolvedGraph {
            nodes,
            dependencies,
            dependents,
        })
    }
}

/// Validate the workflow's DAG and return nodes in a topological order.
pub fn validate_dag(graph: &WorkflowGraph) -> Result<Vec<String>, ValidationError> {
    Ok(GraphResolver::new().resolve(graph)?.topological_order())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    Unvisited,
    InProgress,
    Done,
}

/// Iterative three-colour DFS. Returns the first cycle found, as the path
/// from the revisited node back to itself.
fn find_cycle(adjacency: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut colour: HashMap<&str, Colour> =
        adjacency.keys().map(|id| (id.as_str(), Colour::Unvisited)).collect();

    for start in adjacency.keys() {
        if colour[start.as_str()] != Colour::Unvisited {
            continue;
        }

        // Current DFS path and, per frame, the neighbours still to explore.
        let mut path: Vec<&str> = vec![start.as_str()];
        let mut frames = vec![adjacency[start].iter()];
        colour.insert(start.as_str(), Colour::InProgress);

        while let Some(frame) = frames.last_mut() {
            match frame.next() {
                Some(next) => match colour[next.as_str()] {
                    Colour::Unvisited => {
                        colour.insert(next.as_str(), Colour::InProgress);
                        path.push(next.as_str());
                        frames.push(adjacency[next].iter());
                    }
                    Colour::InProgress => {
                        let from = path.iter().position(|id| *id == next.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|id| id.to_string()).collect();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Colour::Done => {}
                },
                None => {
                    frames.pop();
                    if let Some(done) = path.pop() {
                        colour.insert(done, Colour::Done);
                    }
                }
            }
        }
    }

    None
}

/// A validated graph: node specs plus direct dependency and dependent sets.
#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    nodes: BTreeMap<String, NodeSpec>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ResolvedGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Node IDs in lexicographic order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Direct dependencies of `id` (sources of its incoming edges).
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies.get(id).into_iter().flatten().map(String::as_str)
    }

    /// Direct dependents of `id` (targets of its outgoing edges).
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents.get(id).into_iter().flatten().map(String::as_str)
    }

    /// Nodes with no dependencies, lexicographically.
    pub fn roots(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Every node reachable from `id` along outgoing edges, excluding `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<&str> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents_of(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen
    }

    /// Kahn's algorithm with a lexicographic tie-break.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();
        let mut ready: BTreeSet<&str> = self.roots().into_iter().collect();
        let mut emitted: HashSet<&str> = HashSet::with_capacity(self.len());
        let mut sorted = Vec::with_capacity(self.len());

        while let Some(id) = ready.pop_first() {
            emitted.insert(id);
            sorted.push(id.to_owned());
            for dependent in self.dependents_of(id) {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 && !emitted.contains(dependent) {
                        ready.insert(dependent);
                    }
                }
            }
        }

        sorted
    }
}
