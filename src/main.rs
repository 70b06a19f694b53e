use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use pipewright::config::Config;
use pipewright::errors::OrchestratorError;

mod cmd;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(
    version,
    about = "Run a four-persona code generation pipeline against a workspace, with snapshot rollback"
)]
pub struct Cli {
    /// State directory (defaults to $PIPEWRIGHT_STATE_DIR or ~/.pipewright)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Path to pipewright.toml (defaults to <state-dir>/pipewright.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run requirements, coding, testing and documentation against a workspace
    Run(RunArgs),
    /// Show a run with its steps, artifacts and events
    Show { run_id: String },
    /// List recent runs
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild the bundle of a succeeded run
    Package { run_id: String },
    /// Restore the workspace of an interrupted run and mark it rolled back
    Recover { run_id: String },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Workspace directory the personas mutate (created if missing)
    pub target: PathBuf,

    /// What to build
    #[arg(short, long)]
    pub prompt: String,

    /// Reference document (.md or .json); repeatable
    #[arg(long = "input-doc")]
    pub input_docs: Vec<PathBuf>,

    #[arg(long)]
    pub web_search: bool,

    #[arg(long)]
    pub file_search: bool,

    /// Let personas run shell commands under the sandbox policy
    #[arg(long)]
    pub code_execution: bool,

    /// Generate and validate without touching the workspace or packaging
    #[arg(long)]
    pub dry_run: bool,

    /// Model id (overrides PIPEWRIGHT_MODEL and the config file)
    #[arg(long)]
    pub model: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration and any warnings
    Show,
    /// Write a default pipewright.toml
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::with_cli_args(
        cli.state_dir.clone(),
        cli.config.clone(),
        cli.verbose,
        cli.log_json,
    ) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", console::style("error:").red().bold(), e);
            return ExitCode::from(2);
        }
    };
    let _log_guard =
        pipewright::logging::init(config.verbose, config.log_json, Some(&config.log_dir()));

    let result = match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&config, args).await,
        Commands::Show { run_id } => cmd::cmd_show(&config, run_id),
        Commands::History { limit } => cmd::cmd_history(&config, *limit),
        Commands::Package { run_id } => cmd::cmd_package(&config, run_id),
        Commands::Recover { run_id } => cmd::cmd_recover(&config, run_id).await,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_failure(&err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<OrchestratorError>()
        .map(OrchestratorError::exit_code)
        .unwrap_or(1)
}

fn report_failure(err: &anyhow::Error) {
    eprintln!("{} {:#}", console::style("error:").red().bold(), err);
    if let Some(orch) = err.downcast_ref::<OrchestratorError>() {
        eprintln!("  class:   {}", orch.class());
        if let Some(persona) = orch.persona() {
            eprintln!("  persona: {}", persona);
        }
        if let Some(run_id) = orch.run_id() {
            eprintln!("  run:     {}", run_id);
            eprintln!("  inspect: pipewright show {}", run_id);
        }
    }
}
