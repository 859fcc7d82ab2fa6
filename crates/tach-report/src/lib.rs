//! Run summary model, rendering, and persistence
//!
//! The summary captures everything needed to answer "what ran, what hit
//! cache, and why": the global hash inputs, per-task hashes and cache
//! outcomes, timings, and the resolved task definitions. One JSON schema
//! serves `--dry-run=json` and `--summarize`; the text renderings are
//! derived views of the same data. Rendering is a pure function of the
//! summary, so it is idempotent and independent of execution order.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use owo_colors::OwoColorize;
use serde::Serialize;
use tach_graph::{TaskDefinition, TaskId, TaskOutputs};
use tach_path::{AbsoluteSystemPathBuf, AnchoredUnixPathBuf};
use thiserror::Error;

/// Current summary schema version. Bump on backwards-incompatible
/// changes.
pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write summary to {path}: {source}")]
    Write {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}

// =============================================================================
// RUN ID
// =============================================================================

/// A time-ordered unique run identifier: 10 characters of millisecond
/// timestamp plus 16 characters of entropy, in Crockford base32, so ids
/// sort lexicographically by start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut chars = [0u8; 26];
        let mut t = timestamp as u64;
        for i in (0..10).rev() {
            chars[i] = ALPHABET[(t & 0x1f) as usize];
            t >>= 5;
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut r: u128 = nanos ^ (std::process::id() as u128).rotate_left(32);
        for slot in chars.iter_mut().skip(10) {
            *slot = ALPHABET[(r & 0x1f) as usize];
            r >>= 5;
        }

        Self(String::from_utf8_lossy(&chars).to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// SUMMARY MODEL
// =============================================================================

/// Complete summary of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: RunId,
    pub schema_version: u32,
    /// tach's own version string.
    pub version: String,
    pub started_at_unix_ms: u64,
    pub ended_at_unix_ms: u64,
    /// Packages in scope for this run.
    pub packages: Vec<String>,
    pub env_mode: String,
    pub framework_inference: bool,
    pub global_hash_summary: GlobalHashSummary,
    pub execution: ExecutionSummary,
    /// Sorted by task id; independent of completion order.
    pub tasks: Vec<TaskSummary>,
}

/// The inputs that went into the global hash.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub global_cache_key: String,
    pub global_file_hash_map: BTreeMap<AnchoredUnixPathBuf, String>,
    pub root_external_deps_hash: String,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Vec<String>,
    pub global_dot_env: Vec<AnchoredUnixPathBuf>,
    /// The resulting hash.
    pub hash: String,
}

/// Run-level counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub attempted: usize,
    pub cached: usize,
    pub success: usize,
    pub failed: usize,
    pub exit_code: i32,
}

/// Cache outcome for one task.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheSummary {
    /// "HIT", "MISS", or "DISABLED".
    pub status: String,
    /// "LOCAL" or "REMOTE" on a hit.
    pub source: Option<String>,
    pub time_saved_ms: u64,
}

impl TaskCacheSummary {
    pub fn hit(source: &str, time_saved_ms: u64) -> Self {
        Self {
            status: "HIT".to_string(),
            source: Some(source.to_string()),
            time_saved_ms,
        }
    }

    pub fn miss() -> Self {
        Self {
            status: "MISS".to_string(),
            source: None,
            time_saved_ms: 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: "DISABLED".to_string(),
            source: None,
            time_saved_ms: 0,
        }
    }
}

/// Environment variables a task could observe, grouped by where they
/// were declared. Values are redacted (`KEY=<sha256>`).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvSummary {
    pub configured: Vec<String>,
    pub passthrough: Vec<String>,
    pub global: Vec<String>,
    pub global_passthrough: Vec<String>,
}

/// Timing and outcome for one task.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    pub start_ms: u64,
    pub duration_ms: u64,
    /// "built", "cached", "failed", or "skipped".
    pub status: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Everything recorded about one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub hash_of_files: String,
    pub hash_of_external_dependencies: String,
    pub cache: TaskCacheSummary,
    pub command: String,
    pub directory: AnchoredUnixPathBuf,
    pub log_file: AnchoredUnixPathBuf,
    pub outputs: TaskOutputs,
    pub expanded_outputs: Vec<AnchoredUnixPathBuf>,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub resolved_task_definition: TaskDefinition,
    pub env_mode: String,
    pub environment_variables: TaskEnvSummary,
    pub execution: TaskExecutionSummary,
}

impl RunSummary {
    /// Sort tasks by id so rendering never depends on completion order.
    pub fn normalize(&mut self) {
        self.tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Persist under `.tach/runs/<id>.json`, returning the path.
    pub fn persist(
        &self,
        repo_root: &AbsoluteSystemPathBuf,
    ) -> Result<AbsoluteSystemPathBuf, ReportError> {
        let dir = repo_root.join_component(".tach").join_component("runs");
        std::fs::create_dir_all(dir.as_std_path()).map_err(|source| ReportError::Write {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join_component(&format!("{}.json", self.id));
        std::fs::write(path.as_std_path(), self.to_json()?).map_err(|source| {
            ReportError::Write {
                path: path.clone(),
                source,
            }
        })?;
        Ok(path)
    }

    // =========================================================================
    // TEXT RENDERING
    // =========================================================================

    /// The dry-run / summary table: packages in scope, global hash
    /// inputs, then one block per task.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "{}", "Packages in Scope".bold());
        for package in &self.packages {
            let _ = writeln!(out, "  {package}");
        }

        let global = &self.global_hash_summary;
        let _ = writeln!(out, "\n{}", "Global Hash Inputs".bold());
        let _ = writeln!(out, "  global cache key    = {}", global.global_cache_key);
        let _ = writeln!(
            out,
            "  global files        = {}",
            global.global_file_hash_map.len()
        );
        let _ = writeln!(
            out,
            "  external deps hash  = {}",
            global.root_external_deps_hash
        );
        let _ = writeln!(out, "  env                 = {}", global.global_env.join(", "));
        let _ = writeln!(out, "  resolved hash       = {}", global.hash);

        let _ = writeln!(out, "\n{}", "Tasks to Run".bold());
        for task in &self.tasks {
            let _ = writeln!(out, "{}", task.task_id.to_string().bold());
            let _ = writeln!(out, "  task          = {}", task.task);
            let _ = writeln!(out, "  package       = {}", task.package);
            let _ = writeln!(out, "  hash          = {}", task.hash);
            let _ = writeln!(out, "  cache         = {}", render_cache(&task.cache));
            let _ = writeln!(out, "  command       = {}", task.command);
            let _ = writeln!(out, "  directory     = {}", task.directory);
            let _ = writeln!(out, "  log file      = {}", task.log_file);
            let _ = writeln!(
                out,
                "  outputs       = {}",
                task.outputs.inclusions.join(", ")
            );
            let _ = writeln!(
                out,
                "  dependencies  = {}",
                join_ids(&task.dependencies)
            );
            let _ = writeln!(out, "  dependents    = {}", join_ids(&task.dependents));
            let _ = writeln!(
                out,
                "  env           = {}",
                task.environment_variables.configured.join(", ")
            );
        }

        out
    }

    /// The closing block printed after execution.
    pub fn render_final(&self) -> String {
        let execution = &self.execution;
        let mut out = String::new();

        let failed_tasks: Vec<&TaskSummary> = self
            .tasks
            .iter()
            .filter(|t| t.execution.status == "failed")
            .collect();
        if !failed_tasks.is_empty() {
            let _ = writeln!(out, "\n{}", "Failed tasks:".bold().red());
            for task in &failed_tasks {
                let code = task
                    .execution
                    .exit_code
                    .map(|c| format!("exit code {c}"))
                    .or_else(|| task.execution.error.clone())
                    .unwrap_or_else(|| "failed".to_string());
                let _ = writeln!(out, "  {} ({code})", task.task_id);
            }
        }

        let total = execution.attempted;
        let successful = execution.success + execution.cached;
        let full_hit = execution.cached == total && total > 0;

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{}",
            format!(" Tasks:    {successful} successful, {total} total").bold()
        );
        let _ = writeln!(
            out,
            "{}",
            format!("Cached:    {} cached, {total} total", execution.cached).bold()
        );
        let elapsed = self.ended_at_unix_ms.saturating_sub(self.started_at_unix_ms);
        if full_hit {
            let _ = writeln!(
                out,
                "{} {}",
                format!("  Time:    {}", format_ms(elapsed)).bold(),
                ">>> FULL SPEED".magenta().bold()
            );
        } else {
            let _ = writeln!(out, "{}", format!("  Time:    {}", format_ms(elapsed)).bold());
        }

        out
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_cache(cache: &TaskCacheSummary) -> String {
    match (cache.status.as_str(), &cache.source) {
        ("HIT", Some(source)) => format!(
            "HIT ({}, {} saved)",
            source.to_lowercase(),
            format_ms(cache.time_saved_ms)
        ),
        _ => cache.status.clone(),
    }
}

fn format_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:.1}s", ms / 60_000, (ms % 60_000) as f64 / 1000.0)
    } else if ms >= 1000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}
