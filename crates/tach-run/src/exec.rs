//! Process execution
//!
//! Spawns the package manager for one task, tees its output into the
//! task logger line by line, and waits for exit or cancellation. The
//! child's environment is constructed from the run's host snapshot
//! according to the task's resolved env mode; the host environment is
//! never inherited directly.

use std::process::Stdio;

use tach_env::{essential_keys, EnvError, EnvironmentVariableMap, ResolvedEnvMode};
use tach_path::AbsoluteSystemPathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::logs::TaskLogger;
use crate::{RunError, HASH_ENV_VAR};

/// A fully resolved child invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: AbsoluteSystemPathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Human-readable command line for summaries and errors.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    KilledBySignal,
    Cancelled,
}

/// Build the child environment for a task.
///
/// Strict mode passes platform essentials plus the declared and
/// pass-through variables; loose mode passes the whole snapshot. Dotenv
/// values overlay the base (later files already won inside the map), and
/// the task fingerprint is always exposed.
pub fn build_child_env(
    snapshot: &EnvironmentVariableMap,
    mode: ResolvedEnvMode,
    task_env: &[String],
    pass_through: &[String],
    dotenv: &EnvironmentVariableMap,
    hash: &str,
) -> Result<Vec<(String, String)>, EnvError> {
    let mut env = match mode {
        ResolvedEnvMode::Loose => snapshot.clone(),
        ResolvedEnvMode::Strict => {
            let mut out = EnvironmentVariableMap::new();
            for key in essential_keys() {
                if let Some(value) = snapshot.get(key) {
                    out.insert(key.to_string(), value.to_string());
                }
            }
            let (declared, missing) = snapshot.from_keys(task_env);
            if !missing.is_empty() {
                return Err(EnvError::MissingVariables { missing });
            }
            out.merge(&declared);
            // Pass-through variables are best-effort by design; they are
            // not fingerprinted, so absence is not an error.
            let (passed, _) = snapshot.from_keys(pass_through);
            out.merge(&passed);
            out
        }
    };

    env.merge(dotenv);
    env.insert(HASH_ENV_VAR.to_string(), hash.to_string());
    Ok(env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

/// Run the command to completion, streaming output through the logger.
///
/// Suspension points are exactly: child exit, next output line, and
/// cancellation. On cancellation the child is killed and the remaining
/// output drained before returning.
pub async fn run_command(
    spec: &CommandSpec,
    logger: &mut TaskLogger,
    cancel: &CancellationToken,
) -> Result<ChildOutcome, RunError> {
    trace!(command = %spec.command_line(), cwd = %spec.cwd, "spawning task process");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(spec.cwd.as_std_path())
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        command: spec.command_line(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let out_pump = tokio::spawn(pump_lines(stdout, tx.clone()));
    let err_pump = tokio::spawn(pump_lines(stderr, tx));

    let mut cancelled = false;
    let status = loop {
        tokio::select! {
            maybe_line = rx.recv() => match maybe_line {
                Some(line) => logger.line(&line),
                // Both pumps hit EOF; the child is done or dying.
                None => break child.wait().await.map_err(|source| RunError::Spawn {
                    command: spec.command_line(),
                    source,
                })?,
            },
            _ = cancel.cancelled(), if !cancelled => {
                debug!(command = %spec.command_line(), "cancellation requested; killing child");
                cancelled = true;
                let _ = child.start_kill();
            }
        }
    };

    let _ = out_pump.await;
    let _ = err_pump.await;
    logger.flush();

    if cancelled {
        return Ok(ChildOutcome::Cancelled);
    }
    match status.code() {
        Some(code) => Ok(ChildOutcome::Exited(code)),
        None => Ok(ChildOutcome::KilledBySignal),
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}
