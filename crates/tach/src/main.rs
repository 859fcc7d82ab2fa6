//! tach - incremental task runner for package workspaces
//!
//! Thin CLI over the run pipeline: discover the workspace, build the
//! task graph, and hand it to the scheduler.

mod run;

use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::Result;
use tracing_subscriber::EnvFilter;

use tach_env::EnvMode;
use tach_graph::OutputMode;

#[derive(Parser, Debug)]
#[command(name = "tach", version, about = "Incremental task runner for package workspaces")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run tasks across the workspace
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Task names to run
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Restrict to packages matching this name or glob (repeatable)
    #[arg(long)]
    pub filter: Vec<String>,

    /// Alias of --filter
    #[arg(long)]
    pub scope: Vec<String>,

    /// Restrict to packages changed since this ref
    #[arg(long)]
    pub since: Option<String>,

    /// Drop packages matching this name or glob (repeatable)
    #[arg(long)]
    pub ignore: Vec<String>,

    /// Worker pool size; 1 runs fully serial
    #[arg(long, default_value_t = 10)]
    pub concurrency: usize,

    /// Ignore the dependency graph and run everything at once
    #[arg(long)]
    pub parallel: bool,

    /// Keep running independent tasks after a failure
    #[arg(long = "continue")]
    pub continue_on_error: bool,

    /// Run only the named tasks, not other tasks they depend on
    #[arg(long)]
    pub only: bool,

    /// Ignore existing cache entries; always execute
    #[arg(long)]
    pub force: bool,

    /// Do not write new cache entries
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Cache directory (default .tach/cache)
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<String>,

    /// Plan the run without executing; pass `json` for machine output
    #[arg(long = "dry-run", value_name = "FORMAT", num_args = 0..=1, default_missing_value = "text")]
    pub dry_run: Option<String>,

    /// Print the task graph in dot format, or write it to PATH
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "")]
    pub graph: Option<String>,

    /// Write the run summary under .tach/runs/
    #[arg(long)]
    pub summarize: bool,

    /// Terminal log behavior for task output
    #[arg(long = "output-logs", value_enum)]
    pub output_logs: Option<OutputLogsArg>,

    /// Environment variable policy for task processes
    #[arg(long = "env-mode", value_enum, default_value_t = EnvModeArg::Infer)]
    pub env_mode: EnvModeArg,

    /// Write a chrome trace of the run to PATH
    #[arg(long)]
    pub profile: Option<String>,

    /// Arguments after `--` are forwarded to the named tasks
    #[arg(last = true)]
    pub pass_through: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputLogsArg {
    Full,
    HashOnly,
    ErrorsOnly,
    None,
}

impl From<OutputLogsArg> for OutputMode {
    fn from(value: OutputLogsArg) -> Self {
        match value {
            OutputLogsArg::Full => OutputMode::Full,
            OutputLogsArg::HashOnly => OutputMode::HashOnly,
            OutputLogsArg::ErrorsOnly => OutputMode::ErrorsOnly,
            OutputLogsArg::None => OutputMode::None,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum EnvModeArg {
    #[default]
    Infer,
    Loose,
    Strict,
}

impl From<EnvModeArg> for EnvMode {
    fn from(value: EnvModeArg) -> Self {
        match value {
            EnvModeArg::Infer => EnvMode::Infer,
            EnvModeArg::Loose => EnvMode::Loose,
            EnvModeArg::Strict => EnvMode::Strict,
        }
    }
}

fn init_tracing() {
    // Default to warn globally, info for our own crates. Overridable
    // with RUST_LOG.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,tach=info,tach_run=warn,tach_cache=warn")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::Run(args) => {
            let exit_code = run::cmd_run(args).await?;
            if exit_code != 0 {
                std::process::exit(exit_code.min(255));
            }
            Ok(())
        }
    }
}
