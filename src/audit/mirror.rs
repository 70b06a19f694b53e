use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pipewright_common::{Artifact, RunEvent, RunState, Step, StepStatus};
use serde::Serialize;

use crate::util::write_atomic;

/// Human-readable copy of one run's store records, kept next to (never
/// inside) the workspace so snapshots and restores cannot touch it.
///
/// ```text
/// <runs_dir>/<run_id>/run.json
/// <runs_dir>/<run_id>/steps/<seq>-<persona>-attempt<k>.{input,output,error}.json
/// <runs_dir>/<run_id>/artifacts/<persona>/<name>
/// <runs_dir>/<run_id>/events.json
/// <runs_dir>/<run_id>/commands/*.log   (written by the command runner)
/// ```
pub struct AuditMirror {
    dir: PathBuf,
}

impl AuditMirror {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        Self {
            dir: runs_dir.join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.dir.join("commands")
    }

    pub fn step_stem(step: &Step) -> String {
        format!("{:02}-{}-attempt{}", step.sequence, step.persona, step.attempt)
    }

    /// Rewrite the mirror from a full store read. Files for terminal records
    /// never change, so rewriting them is harmless.
    pub fn sync(&self, state: &RunState) -> Result<()> {
        write_json(&self.dir.join("run.json"), &state.run)?;
        for step in &state.steps {
            self.write_step(step)?;
        }
        for artifact in &state.artifacts {
            self.write_artifact(artifact)?;
        }
        self.write_events(&state.events)
    }

    pub fn write_step(&self, step: &Step) -> Result<()> {
        let steps = self.dir.join("steps");
        let stem = Self::step_stem(step);
        write_json(&steps.join(format!("{}.input.json", stem)), &step.input_payload)?;
        match step.status {
            StepStatus::Succeeded => {
                if let Some(output) = &step.output_payload {
                    write_json(&steps.join(format!("{}.output.json", stem)), output)?;
                }
            }
            StepStatus::Failed => {
                let error = serde_json::json!({
                    "error_kind": step.error_kind,
                    "error_text": step.error_text,
                    "completed_at": step.completed_at,
                });
                write_json(&steps.join(format!("{}.error.json", stem)), &error)?;
            }
            StepStatus::Pending | StepStatus::Running => {}
        }
        Ok(())
    }

    pub fn write_artifact(&self, artifact: &Artifact) -> Result<()> {
        let path = self
            .dir
            .join("artifacts")
            .join(artifact.persona.as_str())
            .join(&artifact.name);
        write_json(&path, &artifact.payload)
    }

    pub fn write_events(&self, events: &[RunEvent]) -> Result<()> {
        write_json(&self.dir.join("events.json"), &events)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize audit record")?;
    write_atomic(path, &json).with_context(|| format!("Failed to write {}", path.display()))
}
