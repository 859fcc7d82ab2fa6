//! Workspace graph
//!
//! Immutable view of package dependency edges, used for topological
//! (`^task`) expansion. Edges point dependent → dependency.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tach_repo::Workspace;

pub struct WorkspaceGraph {
    graph: DiGraph<String, ()>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl WorkspaceGraph {
    pub fn new(workspaces: &BTreeMap<String, Workspace>) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();

        for name in workspaces.keys() {
            let idx = graph.add_node(name.clone());
            nodes.insert(name.clone(), idx);
        }
        for workspace in workspaces.values() {
            let from = nodes[&workspace.name];
            for dep in &workspace.internal_deps {
                if let Some(&to) = nodes.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self { graph, nodes }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Every package reachable through internal dependency edges,
    /// excluding `name` itself.
    pub fn transitive_deps(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.nodes.get(name) else {
            return out;
        };
        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();
        while let Some(idx) = stack.pop() {
            let dep_name = &self.graph[idx];
            if out.insert(dep_name.clone()) {
                stack.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
            }
        }
        out
    }

    /// Direct dependents of `name` (packages that list it as a
    /// dependency).
    pub fn direct_dependents(&self, name: &str) -> BTreeSet<String> {
        let Some(&idx) = self.nodes.get(name) else {
            return BTreeSet::new();
        };
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dependent| self.graph[dependent].clone())
            .collect()
    }
}
