//! Pipeline configuration and task graph construction
//!
//! Two graphs with distinct invariants live here. The workspace graph is
//! immutable input: packages and their dependency edges, as discovered.
//! The task graph is derived per run from the pipeline and the target
//! list, then validated (acyclic, persistent tasks leaf-only) and given
//! a deterministic linear order.

mod builder;
mod pipeline;
mod scope;
mod workspace;

use tach_path::AbsoluteSystemPathBuf;
use thiserror::Error;

pub use builder::{TaskGraph, TaskGraphOpts, TaskId, TaskNode};
pub use pipeline::{
    DepRef, OutputMode, Pipeline, RootConfig, TaskDefinition, TaskOutputs, CONFIG_FILE_NAME,
};
pub use scope::{resolve_scope, ChangeDetector, ScopeOpts};
pub use workspace::WorkspaceGraph;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("could not find {CONFIG_FILE_NAME} at {0}")]
    MissingConfig(AbsoluteSystemPathBuf),

    #[error("failed to read {path}: {source}")]
    ConfigRead {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ConfigParse {
        path: AbsoluteSystemPathBuf,
        source: serde_json::Error,
    },

    #[error(
        "environment variables should be declared in \"env\", not prefixed with '$' in \"dependsOn\" ({0:?})"
    )]
    DollarDependency(String),

    #[error("task {task:?} was requested but is not defined in the pipeline")]
    UnknownTask { task: String },

    #[error("task {task} depends on unknown package {package:?}")]
    UnknownPackage { task: String, package: String },

    #[error("cyclic task dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("persistent task {persistent} cannot have dependent task {dependent}")]
    PersistentDependent {
        persistent: String,
        dependent: String,
    },

    #[error("invalid filter pattern {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("--since requires change detection, which is not available here")]
    ChangeDetectionUnavailable,

    #[error("change detection failed: {0}")]
    ChangeDetection(String),

    #[error("no packages matched the requested filters")]
    EmptyScope,

    #[error("no tasks were requested")]
    NoTargets,
}
