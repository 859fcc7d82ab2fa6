//! Run-state ledger
//!
//! A single mutex-guarded event writer. Workers report finished tasks
//! through the scheduler, which is the only writer; the ledger is read
//! once when the run drains. Counters follow the terminal statuses:
//! skipped tasks were never attempted and stay out of the totals.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tach_report::{ExecutionSummary, TaskSummary};

/// Task lifecycle. Every task ends in exactly one of the four terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Built,
    Cached,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Built => "built",
            TaskStatus::Cached => "cached",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Built | TaskStatus::Cached | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Terminal and not blocking dependents.
    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Built | TaskStatus::Cached)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone)]
pub enum FailureKind {
    /// Non-zero child exit.
    Exit(i32),
    /// Child terminated by a signal.
    Signal,
    /// Run cancellation (interrupt or bail) reached the task.
    Cancelled,
    /// Strict-mode env resolution failed.
    Env(String),
    /// The command could not be spawned.
    Spawn(String),
    /// Hashing, caching, or other run machinery failed.
    Internal(String),
}

impl FailureKind {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FailureKind::Exit(code) => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            FailureKind::Exit(code) => format!("command exited with code {code}"),
            FailureKind::Signal => "command terminated by signal".to_string(),
            FailureKind::Cancelled => "cancelled".to_string(),
            FailureKind::Env(message) => message.clone(),
            FailureKind::Spawn(message) => message.clone(),
            FailureKind::Internal(message) => message.clone(),
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Aggregates task summaries and run counters.
pub struct RunTracker {
    inner: Mutex<Inner>,
}

struct Inner {
    tasks: Vec<TaskSummary>,
    attempted: usize,
    success: usize,
    cached: usize,
    failed: usize,
    max_exit_code: i32,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: Vec::new(),
                attempted: 0,
                success: 0,
                cached: 0,
                failed: 0,
                max_exit_code: 0,
            }),
        }
    }

    /// Record one finished task. Writes are short; the lock covers a
    /// single event.
    pub fn record(&self, summary: TaskSummary) {
        let mut inner = self.inner.lock().expect("run tracker poisoned");
        match summary.execution.status.as_str() {
            "built" => {
                inner.attempted += 1;
                inner.success += 1;
            }
            "cached" => {
                inner.attempted += 1;
                inner.cached += 1;
            }
            "failed" => {
                inner.attempted += 1;
                inner.failed += 1;
                if let Some(code) = summary.execution.exit_code {
                    inner.max_exit_code = inner.max_exit_code.max(code);
                }
            }
            _ => {}
        }
        inner.tasks.push(summary);
    }

    /// Drain the ledger. Any failure yields a non-zero exit code even
    /// when no child reported one (cancellation, env errors).
    pub fn finish(self) -> (ExecutionSummary, Vec<TaskSummary>) {
        let inner = self.inner.into_inner().expect("run tracker poisoned");
        let exit_code = if inner.failed > 0 && inner.max_exit_code == 0 {
            1
        } else {
            inner.max_exit_code
        };
        (
            ExecutionSummary {
                attempted: inner.attempted,
                cached: inner.cached,
                success: inner.success,
                failed: inner.failed,
                exit_code,
            },
            inner.tasks,
        )
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}
