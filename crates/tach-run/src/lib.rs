//! Scheduler, executor, and log pipeline
//!
//! The run crate drives a frozen task graph to completion: a single
//! driver owns the graph and the run-state ledger, workers execute tasks
//! under a semaphore of `concurrency` permits, and all coordination
//! happens over channels. Per task, a worker computes the fingerprint,
//! consults the cache façade, and either replays a hit or spawns the
//! package manager and tees its output to the terminal and the task log.

mod exec;
mod global;
mod logs;
mod scheduler;
mod state;

use tach_env::EnvMode;
use tach_graph::OutputMode;
use tach_path::{AbsoluteSystemPathBuf, AnchoredUnixPathBuf, PathError};
use tach_repo::PackageManager;
use thiserror::Error;

pub use exec::{build_child_env, ChildOutcome, CommandSpec};
pub use global::{compute_global_hash, GlobalHash};
pub use logs::{sink_to_writer, stdout_sink, TaskLogger, TerminalSink};
pub use scheduler::{RunOutcome, Visitor};
pub use state::{FailureKind, RunTracker, TaskStatus};

/// Name of the per-package state directory and log file pattern.
pub const TASK_LOG_DIR: &str = ".tach";

/// The env var carrying the task fingerprint into the child process.
pub const HASH_ENV_VAR: &str = "TACH_HASH";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Env(#[from] tach_env::EnvError),

    #[error(transparent)]
    Scan(#[from] tach_scan::ScanError),

    #[error(transparent)]
    Cache(#[from] tach_cache::CacheError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("failed to open {path}: {source}")]
    Io {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error(
        "{count} persistent tasks cannot run with concurrency {concurrency}; raise --concurrency"
    )]
    PersistentStarvation { count: usize, concurrency: usize },

    #[error("blocking task panicked")]
    Join,
}

/// Run-wide configuration assembled by the caller from the CLI surface
/// and the root config file.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub repo_root: AbsoluteSystemPathBuf,
    pub package_manager: PackageManager,
    /// Test and embedding hook: run this binary instead of the detected
    /// package manager.
    pub package_manager_binary: Option<String>,
    /// Worker pool size; 1 means fully serial.
    pub concurrency: usize,
    /// `--continue`: keep dispatching independent tasks after a failure.
    pub continue_on_error: bool,
    /// `--parallel`: topology is disabled except for root-anchored
    /// edges, and a running persistent dependency counts as satisfied.
    pub parallel: bool,
    /// CLI-level env mode; tasks declaring their own mode keep it.
    pub env_mode: EnvMode,
    /// `--output-logs` override for every task.
    pub output_mode: Option<OutputMode>,
    /// The task names given on the command line.
    pub targets: Vec<String>,
    /// Arguments after `--`, forwarded to target tasks.
    pub pass_through_args: Vec<String>,
    pub framework_inference: bool,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env: Vec<AnchoredUnixPathBuf>,
    pub global_dependencies: Vec<String>,
}

impl RunConfig {
    pub fn new(repo_root: AbsoluteSystemPathBuf, package_manager: PackageManager) -> Self {
        Self {
            repo_root,
            package_manager,
            package_manager_binary: None,
            concurrency: 10,
            continue_on_error: false,
            parallel: false,
            env_mode: EnvMode::Infer,
            output_mode: None,
            targets: Vec::new(),
            pass_through_args: Vec::new(),
            framework_inference: true,
            global_env: Vec::new(),
            global_pass_through_env: None,
            global_dot_env: Vec::new(),
            global_dependencies: Vec::new(),
        }
    }

    pub fn package_manager_program(&self) -> &str {
        self.package_manager_binary
            .as_deref()
            .unwrap_or_else(|| self.package_manager.binary())
    }
}
