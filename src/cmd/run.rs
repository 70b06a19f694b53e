//! Pipeline execution command: `pipewright run`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pipewright::config::{Config, absolutize};
use pipewright::errors::OrchestratorError;
use pipewright::ingest::load_documents;
use pipewright::lock::WorkspaceLock;
use pipewright::orchestrator::{Orchestrator, OrchestratorOptions, RunOutcome};
use pipewright::persona::{LlmClient, OfflineClient, OpenAiClient};
use pipewright::pipewright_config::Provider;
use pipewright::sandbox::SandboxManager;
use pipewright_common::RunConfig;
use tracing::{info, warn};

use super::super::RunArgs;
use super::open_store_handle;

pub async fn cmd_run(config: &Config, args: &RunArgs) -> Result<()> {
    for warning in config.validate() {
        warn!(config = %config.config_path.display(), "{}", warning);
    }

    let run_config = build_run_config(config, args)?;
    let llm = llm_client(config, run_config.dry_run)?;

    let store = open_store_handle(config)?;
    let _lock = WorkspaceLock::acquire(&config.locks_dir(), &run_config.target_path)?;

    let orchestrator = Orchestrator::new(
        store,
        SandboxManager::new(config.snapshots_dir()),
        llm,
        OrchestratorOptions {
            runs_dir: config.runs_dir(),
            dist_dir: config.dist_dir(),
            llm_timeout: Duration::from_secs(config.toml.model.timeout_secs),
        },
    );

    let cancel = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling run after the current operation");
            cancel.cancel();
        }
    });

    println!();
    println!(
        "{} {} -> {}",
        console::style("pipewright").bold(),
        if run_config.dry_run { "dry run" } else { "run" },
        run_config.target_path.display()
    );
    let result = orchestrator.execute(run_config).await;
    interrupt.abort();

    let outcome = result?;
    print_outcome(config, &outcome);
    Ok(())
}

/// Merge CLI flags over the config file and environment into a frozen run config.
pub(crate) fn build_run_config(config: &Config, args: &RunArgs) -> Result<RunConfig> {
    let target_path = absolutize(&args.target);
    if config.state_within(&target_path) {
        return Err(OrchestratorError::Validation(format!(
            "target {} contains the state directory {}; pick another target or --state-dir",
            target_path.display(),
            config.state_dir.display()
        ))
        .into());
    }
    let documents = load_documents(&args.input_docs).map_err(OrchestratorError::from)?;

    let mut tools = config.toml.tool_toggles();
    tools.web_search |= args.web_search;
    tools.file_search |= args.file_search;
    tools.code_execution |= args.code_execution;

    Ok(RunConfig {
        target_path,
        prompt: args.prompt.clone(),
        documents,
        tools,
        policy: config.toml.command_policy(),
        model: args
            .model
            .clone()
            .unwrap_or_else(|| config.toml.model_name()),
        dry_run: args.dry_run || config.toml.dry_run(),
        fix_forward: config.toml.pipeline.fix_forward,
    })
}

fn llm_client(config: &Config, dry_run: bool) -> Result<Arc<dyn LlmClient>> {
    if dry_run || config.toml.model.provider == Provider::Offline {
        info!(dry_run, provider = %config.toml.model.provider, "Using offline model client");
        return Ok(Arc::new(OfflineClient));
    }
    let api_key = config
        .api_key()
        .ok_or_else(|| {
            OrchestratorError::Validation(
                "no API key: set PIPEWRIGHT_API_KEY or OPENAI_API_KEY".to_string(),
            )
        })
        .context("Cannot reach the model provider")?;
    Ok(Arc::new(OpenAiClient::new(&config.toml.model.base_url, api_key)))
}

fn print_outcome(config: &Config, outcome: &RunOutcome) {
    let run = &outcome.run;
    println!();
    println!(
        "{} run {} {}",
        console::style("✓").green().bold(),
        run.run_id,
        console::style(run.status.as_str()).green()
    );
    match &outcome.bundle {
        Some(bundle) => {
            println!("  bundle:  {}", bundle.path.display());
            println!("  sha256:  {}", bundle.sha256);
            println!("  entries: {}", bundle.entries.len());
        }
        None => println!("  bundle:  {}", console::style("skipped (dry run)").dim()),
    }
    println!("  audit:   {}", config.runs_dir().join(&run.run_id).display());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(target: PathBuf) -> RunArgs {
        RunArgs {
            target,
            prompt: "Build a CLI".to_string(),
            input_docs: vec![],
            web_search: false,
            file_search: true,
            code_execution: false,
            dry_run: true,
            model: Some("o4-mini".to_string()),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(Some(dir.path().to_path_buf()), None).unwrap();
        config.toml.tools.web_search = true;

        let run_config = build_run_config(&config, &args(PathBuf::from("ws"))).unwrap();
        assert!(run_config.target_path.is_absolute());
        assert!(run_config.tools.web_search);
        assert!(run_config.tools.file_search);
        assert!(!run_config.tools.code_execution);
        assert!(run_config.dry_run);
        assert_eq!(run_config.model, "o4-mini");
    }

    #[test]
    fn test_bad_document_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Some(dir.path().to_path_buf()), None).unwrap();
        let mut run_args = args(dir.path().join("ws"));
        run_args.input_docs = vec![dir.path().join("notes.txt")];

        let err = build_run_config(&config, &run_args).unwrap_err();
        let orch = err.downcast_ref::<OrchestratorError>().unwrap();
        assert_eq!(orch.exit_code(), 2);
    }

    #[test]
    fn test_target_containing_state_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        let config = Config::new(Some(ws.join(".pipewright")), None).unwrap();

        for target in [ws.clone(), ws.join(".pipewright")] {
            let err = build_run_config(&config, &args(target)).unwrap_err();
            let orch = err.downcast_ref::<OrchestratorError>().unwrap();
            assert_eq!(orch.exit_code(), 2);
            assert!(orch.to_string().contains("state directory"));
        }
        assert!(build_run_config(&config, &args(dir.path().join("elsewhere"))).is_ok());
    }

    #[test]
    fn test_dry_run_uses_offline_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Some(dir.path().to_path_buf()), None).unwrap();
        let client = llm_client(&config, true).unwrap();
        assert_eq!(client.name(), "offline");
    }
}
