//! Bundle regeneration: `pipewright package`.

use anyhow::{Result, bail};
use pipewright::config::Config;
use pipewright::errors::{OrchestratorError, PackagingError};
use pipewright::packager::Packager;
use pipewright_common::{EventType, Severity};
use serde_json::json;

use super::open_store;

pub fn cmd_package(config: &Config, run_id: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.get_run(run_id)?.is_none() {
        bail!("Run {} not found in {}", run_id, config.db_path().display());
    }
    let state = store.load_run_state(run_id)?;

    let report = match Packager::new(config.dist_dir()).package(&state) {
        Ok(report) => report,
        Err(err @ PackagingError::NotSucceeded { .. }) => {
            return Err(OrchestratorError::Validation(err.to_string()).into());
        }
        Err(source) => {
            return Err(OrchestratorError::Packaging {
                run_id: run_id.to_string(),
                source,
            }
            .into());
        }
    };

    store.append_event(
        run_id,
        EventType::Packaged,
        Severity::Info,
        &format!("Bundle rebuilt at {}", report.path.display()),
        Some(&json!({
            "path": report.path,
            "sha256": report.sha256,
            "bytes": report.bytes,
        })),
    )?;

    println!();
    println!("{} {}", console::style("Bundle written:").green().bold(), report.path.display());
    println!("  sha256:  {}", report.sha256);
    println!("  bytes:   {}", report.bytes);
    for entry in &report.entries {
        println!("  - {}", entry);
    }
    println!();
    Ok(())
}
