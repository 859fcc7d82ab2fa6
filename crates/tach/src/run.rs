//! The `run` command: discovery, graph construction, and execution.

use std::collections::BTreeSet;

use eyre::{bail, eyre, Result, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tach_cache::{CacheMultiplexer, CacheOpts};
use tach_env::EnvironmentVariableMap;
use tach_graph::{RootConfig, ScopeOpts, TaskGraph, TaskGraphOpts, WorkspaceGraph, CONFIG_FILE_NAME};
use tach_path::AbsoluteSystemPathBuf;
use tach_repo::RepoSnapshot;
use tach_report::{
    ExecutionSummary, GlobalHashSummary, RunId, RunSummary, TaskSummary, SUMMARY_SCHEMA_VERSION,
};
use tach_run::{compute_global_hash, RunConfig, Visitor};

use crate::RunArgs;

pub async fn cmd_run(args: RunArgs) -> Result<i32> {
    if args.concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let cwd = AbsoluteSystemPathBuf::from_cwd()
        .map_err(|e| eyre!("cannot resolve working directory: {e}"))?;
    let repo_root = find_repo_root(&cwd)
        .ok_or_else(|| eyre!("could not find {CONFIG_FILE_NAME} in {cwd} or any parent"))?;
    debug!(%repo_root, "repository root located");

    let snapshot = RepoSnapshot::discover(&repo_root)?;
    let root_config = RootConfig::load(&repo_root)?;
    let pipeline = root_config.pipeline();
    let workspace_graph = WorkspaceGraph::new(&snapshot.workspaces);

    let mut filter = args.filter.clone();
    filter.extend(args.scope.iter().cloned());
    let scope_opts = ScopeOpts {
        filter,
        ignore: args.ignore.clone(),
        since: args.since.clone(),
    };
    let scope: BTreeSet<String> =
        tach_graph::resolve_scope(&snapshot.workspaces, &workspace_graph, &scope_opts, None)?;

    let graph = TaskGraph::build(
        &snapshot.workspaces,
        &workspace_graph,
        &pipeline,
        &args.tasks,
        &scope,
        TaskGraphOpts {
            parallel: args.parallel,
            only: args.only,
        },
    )?;

    if let Some(path) = &args.graph {
        let dot = graph.dot();
        if path.is_empty() {
            print!("{dot}");
        } else {
            std::fs::write(path, dot).wrap_err_with(|| format!("writing graph to {path}"))?;
            println!("graph written to {path}");
        }
        return Ok(0);
    }

    if graph.is_empty() {
        warn!("no tasks matched; nothing to do");
        return Ok(0);
    }

    // Environment overrides for cache behavior.
    let force = args.force || env_flag("TACH_FORCE");
    let no_cache = args.no_cache;
    let cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| std::env::var("TACH_CACHE_DIR").ok())
        .unwrap_or_else(|| ".tach/cache".to_string());
    let cache_dir = if std::path::Path::new(&cache_dir).is_absolute() {
        AbsoluteSystemPathBuf::new(cache_dir).expect("checked absolute")
    } else {
        // Anchored under the repo, wherever the command was invoked.
        let mut dir = repo_root.clone();
        for part in cache_dir.split('/') {
            dir = dir.join_component(part);
        }
        dir
    };
    if std::env::var("TACH_API").is_ok() || std::env::var("TACH_TOKEN").is_ok() {
        debug!("remote cache credentials present but no remote transport is wired; using local cache only");
    }
    if env_flag("TACH_REMOTE_ONLY") {
        warn!("TACH_REMOTE_ONLY set but no remote transport is wired; ignoring");
    }
    match std::env::var("TACH_LOG_ORDER").as_deref() {
        Ok("stream") | Err(_) => {}
        Ok(other) => warn!("unsupported TACH_LOG_ORDER {other:?}; logs stream line-interleaved"),
    }

    let mut config = RunConfig::new(repo_root.clone(), snapshot.package_manager);
    config.concurrency = args.concurrency;
    config.continue_on_error = args.continue_on_error;
    config.parallel = args.parallel;
    config.env_mode = args.env_mode.into();
    config.output_mode = args.output_logs.map(Into::into);
    config.targets = args.tasks.clone();
    config.pass_through_args = args.pass_through.clone();
    config.global_env = root_config.global_env.clone();
    config.global_pass_through_env = root_config.global_pass_through_env.clone();
    config.global_dot_env = root_config.global_dot_env.clone();
    config.global_dependencies = root_config.global_dependencies.clone();

    let env_snapshot = EnvironmentVariableMap::from_host();
    let global = compute_global_hash(&config, &snapshot.root_external_deps_hash, &env_snapshot)?;

    let cache = CacheMultiplexer::new(
        cache_dir,
        None,
        CacheOpts {
            skip_reads: force,
            skip_writes: no_cache,
            ..CacheOpts::default()
        },
    )?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling run");
                cancel.cancel();
            }
        });
    }

    let started_at = now_ms();
    let run_id = RunId::new();
    let global_summary = GlobalHashSummary {
        global_cache_key: tach_hash::GLOBAL_CACHE_KEY.to_string(),
        global_file_hash_map: global.file_hashes.clone(),
        root_external_deps_hash: global.root_external_deps_hash.clone(),
        global_env: config.global_env.clone(),
        global_pass_through_env: config.global_pass_through_env.clone().unwrap_or_default(),
        global_dot_env: config.global_dot_env.clone(),
        hash: global.hash.clone(),
    };
    let packages: Vec<String> = scope.iter().cloned().collect();
    let env_mode = config.env_mode;
    let framework_inference = config.framework_inference;

    let visitor = Visitor::new(
        config,
        graph,
        snapshot.workspaces,
        cache,
        env_snapshot,
        global,
        tach_run::stdout_sink(),
        cancel,
    );

    let make_summary = |execution: ExecutionSummary, tasks: Vec<TaskSummary>| {
        let mut summary = RunSummary {
            id: run_id.clone(),
            schema_version: SUMMARY_SCHEMA_VERSION,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at_unix_ms: started_at,
            ended_at_unix_ms: now_ms(),
            packages: packages.clone(),
            env_mode: env_mode.as_str().to_string(),
            framework_inference,
            global_hash_summary: global_summary.clone(),
            execution,
            tasks,
        };
        summary.normalize();
        summary
    };

    if let Some(format) = &args.dry_run {
        let tasks = visitor.plan().await?;
        let summary = make_summary(ExecutionSummary::default(), tasks);
        match format.as_str() {
            "json" => println!("{}", summary.to_json()?),
            _ => print!("{}", summary.render_text()),
        }
        return Ok(0);
    }

    let outcome = visitor.run().await?;
    let exit_code = outcome.execution.exit_code;
    let summary = make_summary(outcome.execution, outcome.tasks);

    print!("{}", summary.render_final());

    if args.summarize || env_flag("TACH_RUN_SUMMARY") {
        let path = summary.persist(&repo_root)?;
        println!("Summary: {path}");
    }

    if let Some(profile) = &args.profile {
        write_trace(profile, &summary).wrap_err_with(|| format!("writing trace to {profile}"))?;
    }

    Ok(exit_code)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Walk upward from `start` looking for the config file.
fn find_repo_root(start: &AbsoluteSystemPathBuf) -> Option<AbsoluteSystemPathBuf> {
    let mut current = start.clone();
    loop {
        if current
            .join_component(CONFIG_FILE_NAME)
            .as_std_path()
            .exists()
        {
            return Some(current);
        }
        current = current.parent()?;
    }
}

/// Chrome trace-event rendering of the run, one complete event per
/// executed task.
fn write_trace(path: &str, summary: &RunSummary) -> Result<()> {
    let events: Vec<serde_json::Value> = summary
        .tasks
        .iter()
        .filter(|task| task.execution.start_ms > 0)
        .map(|task| {
            serde_json::json!({
                "name": task.task_id.as_str(),
                "cat": "task",
                "ph": "X",
                "ts": task.execution.start_ms * 1000,
                "dur": task.execution.duration_ms * 1000,
                "pid": 1,
                "tid": 1,
                "args": { "status": task.execution.status, "hash": task.hash },
            })
        })
        .collect();
    std::fs::write(path, serde_json::to_string_pretty(&events)?)?;
    Ok(())
}
