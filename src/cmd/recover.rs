//! Crash recovery: `pipewright recover`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use pipewright::config::Config;
use pipewright::lock::WorkspaceLock;
use pipewright::orchestrator::{Orchestrator, OrchestratorOptions};
use pipewright::persona::OfflineClient;
use pipewright::sandbox::SandboxManager;

use super::open_store;

pub async fn cmd_recover(config: &Config, run_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let Some(run) = store.get_run(run_id)? else {
        bail!("Run {} not found in {}", run_id, config.db_path().display());
    };
    let _lock = WorkspaceLock::acquire(&config.locks_dir(), &run.target_path)?;

    // Recovery never calls a model.
    let orchestrator = Orchestrator::new(
        pipewright::store::StoreHandle::new(store),
        SandboxManager::new(config.snapshots_dir()),
        Arc::new(OfflineClient),
        OrchestratorOptions {
            runs_dir: config.runs_dir(),
            dist_dir: config.dist_dir(),
            llm_timeout: Duration::from_secs(config.toml.model.timeout_secs),
        },
    );
    let run = orchestrator.recover(run_id).await?;

    println!();
    println!(
        "{} run {} is {}",
        console::style("Recovered:").yellow().bold(),
        run.run_id,
        run.status
    );
    println!("  workspace: {}", run.target_path.display());
    println!();
    Ok(())
}
