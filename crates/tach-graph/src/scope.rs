//! Package scope resolution
//!
//! Narrows the workspace set a run operates on. Filters match package
//! names or directories (exact or glob). `--since` needs to know what
//! changed in version control, which is not this crate's business: the
//! caller injects a [`ChangeDetector`] or the flag is rejected.

use std::collections::{BTreeMap, BTreeSet};

use glob::Pattern;
use tach_repo::Workspace;

use crate::{GraphError, WorkspaceGraph};

/// Provides the set of packages touched since a VCS ref.
pub trait ChangeDetector {
    fn changed_packages(&self, since: &str) -> Result<BTreeSet<String>, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ScopeOpts {
    /// `--filter` / `--scope` patterns; empty means everything.
    pub filter: Vec<String>,
    /// `--ignore` patterns, subtracted after filtering.
    pub ignore: Vec<String>,
    /// `--since=<ref>`.
    pub since: Option<String>,
}

/// Resolve the in-scope package set.
pub fn resolve_scope(
    workspaces: &BTreeMap<String, Workspace>,
    graph: &WorkspaceGraph,
    opts: &ScopeOpts,
    detector: Option<&dyn ChangeDetector>,
) -> Result<BTreeSet<String>, GraphError> {
    let mut scope: BTreeSet<String> = workspaces.keys().cloned().collect();

    if let Some(since) = &opts.since {
        let detector = detector.ok_or(GraphError::ChangeDetectionUnavailable)?;
        let changed = detector
            .changed_packages(since)
            .map_err(GraphError::ChangeDetection)?;
        // Changed packages invalidate their dependents too.
        let mut affected = changed.clone();
        for name in &changed {
            let mut stack: Vec<String> = graph.direct_dependents(name).into_iter().collect();
            while let Some(dependent) = stack.pop() {
                if affected.insert(dependent.clone()) {
                    stack.extend(graph.direct_dependents(&dependent));
                }
            }
        }
        scope.retain(|name| affected.contains(name));
    }

    if !opts.filter.is_empty() {
        let patterns = compile(&opts.filter)?;
        scope.retain(|name| {
            let workspace = &workspaces[name];
            patterns
                .iter()
                .any(|p| p.matches(name) || p.matches(workspace.dir.as_str()))
        });
        if scope.is_empty() {
            return Err(GraphError::EmptyScope);
        }
    }

    if !opts.ignore.is_empty() {
        let patterns = compile(&opts.ignore)?;
        scope.retain(|name| {
            let workspace = &workspaces[name];
            !patterns
                .iter()
                .any(|p| p.matches(name) || p.matches(workspace.dir.as_str()))
        });
    }

    Ok(scope)
}

fn compile(raw: &[String]) -> Result<Vec<Pattern>, GraphError> {
    raw.iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|source| GraphError::InvalidFilter {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}
