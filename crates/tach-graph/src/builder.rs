//! Task graph construction
//!
//! Expands `package#task` targets against the workspace graph and the
//! pipeline into a frozen DAG with a deterministic linear order.
//! Dependency references pull in nodes beyond the target set: a task's
//! `^build` reaches every transitive internal dependency's `build`, and
//! those nodes' own references expand recursively.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use petgraph::graph::DiGraph;
use serde::Serialize;
use tach_repo::{Workspace, ROOT_WORKSPACE_NAME};
use tracing::debug;

use crate::pipeline::{DepRef, Pipeline, TaskDefinition};
use crate::{GraphError, WorkspaceGraph};

/// `package#task`, the identity of a task node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(package: &str, task: &str) -> Self {
        Self(format!("{package}#{task}"))
    }

    pub fn package(&self) -> &str {
        self.0.split_once('#').map(|(p, _)| p).unwrap_or("")
    }

    pub fn task(&self) -> &str {
        self.0.split_once('#').map(|(_, t)| t).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// One node of the frozen task graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub package: String,
    pub task: String,
    pub definition: TaskDefinition,
    pub deps: BTreeSet<TaskId>,
    pub dependents: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskGraphOpts {
    /// Drop every dependency edge except those anchoring to a root
    /// (`//#task`) node; topology is otherwise disabled.
    pub parallel: bool,
    /// Keep only nodes whose task name was requested.
    pub only: bool,
}

/// The frozen task graph plus its stable linear ordering.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: BTreeMap<TaskId, TaskNode>,
    execution_order: Vec<TaskId>,
}

impl TaskGraph {
    pub fn build(
        workspaces: &BTreeMap<String, Workspace>,
        workspace_graph: &WorkspaceGraph,
        pipeline: &Pipeline,
        targets: &[String],
        scope: &BTreeSet<String>,
        opts: TaskGraphOpts,
    ) -> Result<Self, GraphError> {
        if targets.is_empty() {
            return Err(GraphError::NoTargets);
        }
        for target in targets {
            if !pipeline.defines_task(target) {
                return Err(GraphError::UnknownTask {
                    task: target.clone(),
                });
            }
        }

        let runnable = |package: &str, task: &str| -> bool {
            pipeline.definition(package, task).is_some()
                && workspaces
                    .get(package)
                    .is_some_and(|ws| ws.scripts.contains_key(task))
        };

        // Seed with targets over the in-scope packages; packages without
        // a matching script are skipped for that target.
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        for target in targets {
            for package in scope {
                if runnable(package, target) {
                    queue.push_back(TaskId::new(package, target));
                }
            }
        }

        // Expand references breadth-first; nodes materialize as they are
        // reached, in or out of the original scope.
        let mut nodes: BTreeMap<TaskId, TaskNode> = BTreeMap::new();
        while let Some(id) = queue.pop_front() {
            if nodes.contains_key(&id) {
                continue;
            }
            let package = id.package().to_string();
            let task = id.task().to_string();
            let definition = pipeline
                .definition(&package, &task)
                .expect("only runnable ids are queued")
                .clone();

            let mut deps = BTreeSet::new();
            for dep_ref in definition.dep_refs() {
                match dep_ref {
                    DepRef::Task(name) => {
                        if runnable(&package, &name) {
                            deps.insert(TaskId::new(&package, &name));
                        }
                    }
                    DepRef::Topological(name) => {
                        for dep_package in workspace_graph.transitive_deps(&package) {
                            if runnable(&dep_package, &name) {
                                deps.insert(TaskId::new(&dep_package, &name));
                            }
                        }
                    }
                    DepRef::Explicit {
                        package: dep_package,
                        task: dep_task,
                    } => {
                        if !workspaces.contains_key(&dep_package) {
                            return Err(GraphError::UnknownPackage {
                                task: id.to_string(),
                                package: dep_package,
                            });
                        }
                        if runnable(&dep_package, &dep_task) {
                            deps.insert(TaskId::new(&dep_package, &dep_task));
                        }
                    }
                }
            }

            for dep in &deps {
                queue.push_back(dep.clone());
            }
            nodes.insert(
                id.clone(),
                TaskNode {
                    id,
                    package,
                    task,
                    definition,
                    deps,
                    dependents: BTreeSet::new(),
                },
            );
        }

        if opts.parallel {
            // Root-anchored edges survive: a `//#task` still gates its
            // dependents even with topology disabled.
            for node in nodes.values_mut() {
                node.deps
                    .retain(|dep| dep.package() == ROOT_WORKSPACE_NAME);
            }
        }

        if opts.only {
            let keep: BTreeSet<TaskId> = nodes
                .values()
                .filter(|node| targets.iter().any(|t| t == &node.task))
                .map(|node| node.id.clone())
                .collect();
            nodes.retain(|id, _| keep.contains(id));
            for node in nodes.values_mut() {
                node.deps.retain(|dep| keep.contains(dep));
            }
        }

        // Back-fill dependents now that the node set is final.
        let edges: Vec<(TaskId, TaskId)> = nodes
            .values()
            .flat_map(|node| {
                node.deps
                    .iter()
                    .map(|dep| (dep.clone(), node.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(dep_node) = nodes.get_mut(&dep) {
                dep_node.dependents.insert(dependent);
            }
        }

        // With topology live, a persistent task can never be waited on.
        // Under `--parallel` the scheduler instead treats a running
        // persistent dependency as satisfied.
        if !opts.parallel {
            for node in nodes.values() {
                if node.definition.persistent {
                    if let Some(dependent) = node.dependents.iter().next() {
                        return Err(GraphError::PersistentDependent {
                            persistent: node.id.to_string(),
                            dependent: dependent.to_string(),
                        });
                    }
                }
            }
        }

        let execution_order = linearize(&nodes)?;
        debug!(tasks = nodes.len(), "task graph frozen");

        Ok(Self {
            nodes,
            execution_order,
        })
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    /// Topological order, ties broken by task id.
    pub fn execution_order(&self) -> &[TaskId] {
        &self.execution_order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Graphviz rendering for `--graph`. Edges read
    /// dependent → dependency.
    pub fn dot(&self) -> String {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices = BTreeMap::new();
        for id in self.nodes.keys() {
            indices.insert(id.clone(), graph.add_node(id.as_str()));
        }
        for node in self.nodes.values() {
            for dep in &node.deps {
                graph.add_edge(indices[&node.id], indices[dep], ());
            }
        }
        format!(
            "{:?}",
            petgraph::dot::Dot::with_config(&graph, &[petgraph::dot::Config::EdgeNoLabel])
        )
    }
}

/// Kahn's algorithm with a sorted ready set: among simultaneously ready
/// nodes, the smallest id goes first, so two runs over the same graph
/// produce the same order on any host.
fn linearize(nodes: &BTreeMap<TaskId, TaskNode>) -> Result<Vec<TaskId>, GraphError> {
    let mut remaining: BTreeMap<&TaskId, usize> = nodes
        .iter()
        .map(|(id, node)| (id, node.deps.len()))
        .collect();
    let mut ready: BTreeSet<&TaskId> = remaining
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(&id) = ready.iter().next() {
        ready.remove(id);
        order.push(id.clone());
        for dependent in &nodes[id].dependents {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<String> = nodes
            .keys()
            .filter(|id| !order.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}
