//! Read-only run inspection: `pipewright show` and `pipewright history`.

use anyhow::{Result, bail};
use pipewright::config::Config;
use pipewright_common::{RunState, RunStatus, Severity, StepStatus};

use super::open_store;

pub fn cmd_show(config: &Config, run_id: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.get_run(run_id)?.is_none() {
        bail!("Run {} not found in {}", run_id, config.db_path().display());
    }
    let state = store.load_run_state(run_id)?;
    print_state(config, &state);
    Ok(())
}

pub fn cmd_history(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let runs = store.list_runs(limit)?;

    println!();
    if runs.is_empty() {
        println!("No runs recorded in {}", config.db_path().display());
        println!();
        return Ok(());
    }

    println!(
        "{:<34} {:<12} {:<20} Target",
        "Run", "Status", "Created"
    );
    println!(
        "{:<34} {:<12} {:<20} ------",
        "-".repeat(34),
        "------------",
        "--------------------"
    );
    for run in &runs {
        println!(
            "{:<34} {:<12} {:<20} {}",
            run.run_id,
            status_style(run.status),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.target_path.display()
        );
    }
    println!();
    Ok(())
}

fn print_state(config: &Config, state: &RunState) {
    let run = &state.run;
    println!();
    println!("Run {}", console::style(&run.run_id).bold());
    println!("  status:    {}", status_style(run.status));
    println!("  target:    {}", run.target_path.display());
    println!("  model:     {}", run.config.model);
    println!("  dry run:   {}", run.config.dry_run);
    let tools = run.config.tools.enabled_names();
    println!(
        "  tools:     {}",
        if tools.is_empty() {
            "none".to_string()
        } else {
            tools.join(", ")
        }
    );
    println!("  created:   {}", run.created_at.to_rfc3339());
    if let Some(done) = run.completed_at {
        println!("  completed: {}", done.to_rfc3339());
    }
    println!("  audit:     {}", config.runs_dir().join(&run.run_id).display());

    println!();
    println!("Steps");
    for step in &state.steps {
        let status = match step.status {
            StepStatus::Succeeded => console::style(step.status.as_str()).green(),
            StepStatus::Failed => console::style(step.status.as_str()).red(),
            _ => console::style(step.status.as_str()).yellow(),
        };
        print!(
            "  {:>2}. {:<14} attempt {} {}",
            step.sequence,
            step.persona.as_str(),
            step.attempt,
            status
        );
        if let (Some(kind), Some(text)) = (step.error_kind, &step.error_text) {
            print!("  [{}] {}", kind, text);
        }
        println!();
    }

    if !state.artifacts.is_empty() {
        println!();
        println!("Artifacts");
        for artifact in &state.artifacts {
            println!("  {}/{}", artifact.persona, artifact.name);
        }
    }

    println!();
    println!("Events");
    for event in &state.events {
        let severity = match event.severity {
            Severity::Info => console::style(event.severity.as_str()).dim(),
            Severity::Warning => console::style(event.severity.as_str()).yellow(),
            Severity::Critical => console::style(event.severity.as_str()).red().bold(),
        };
        println!(
            "  {} {:<8} {:<20} {}",
            event.created_at.format("%H:%M:%S"),
            severity,
            event.event_type.as_str(),
            event.message
        );
    }
    println!();
}

fn status_style(status: RunStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        RunStatus::Succeeded => console::style(label).green(),
        RunStatus::Failed => console::style(label).red(),
        RunStatus::RolledBack => console::style(label).yellow(),
        RunStatus::Pending | RunStatus::Running => console::style(label).cyan(),
    }
}
