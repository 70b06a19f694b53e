use std::path::Path;

use async_trait::async_trait;
use pipewright_common::{CodingOutput, FileEntry, Persona, PersonaOutput};
use tracing::info;

use super::{PersonaStep, StepEnv, StepInput};
use crate::errors::StepError;

const INSTRUCTIONS: &str = "You are the Coding persona. Turn the requirements into a project \
scaffold: complete file contents at workspace-relative paths, pinned dependencies, and the \
shell commands that build or check it. Prefer deterministic, local execution. Answer with one \
JSON object with the fields: schema_version (1), summary, files ([{path, contents}]), \
dependencies ([{ecosystem, name, version}]), commands.";

pub struct CodingStep;

impl CodingStep {
    fn build_input(input: &StepInput) -> String {
        format!(
            "Prompt:\n{}\n\nEarlier persona outputs:\n{}{}",
            input.prompt,
            input.render_prior(),
            input.render_retry()
        )
    }
}

/// Write the file manifest into the workspace. Paths were validated as
/// workspace-relative before this is called; symlinks already in the
/// workspace are resolved here.
pub fn write_files(workspace: &Path, files: &[FileEntry]) -> Result<(), StepError> {
    let root = workspace.canonicalize().map_err(|e| {
        StepError::ToolExecution(format!("cannot resolve {}: {}", workspace.display(), e))
    })?;
    for file in files {
        let path = root.join(&file.path);
        ensure_inside(&root, &path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepError::ToolExecution(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&path, &file.contents).map_err(|e| {
            StepError::ToolExecution(format!("cannot write {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// The longest existing prefix of `path` must resolve under `root`.
fn ensure_inside(root: &Path, path: &Path) -> Result<(), StepError> {
    let mut existing = path;
    while std::fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = existing.canonicalize().map_err(|e| {
        StepError::Validation(format!("cannot resolve {}: {}", existing.display(), e))
    })?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(StepError::Validation(format!(
            "{} resolves outside the workspace ({})",
            path.display(),
            resolved.display()
        )))
    }
}

async fn apply(
    scaffold: &CodingOutput,
    input: &StepInput,
    env: &StepEnv<'_>,
) -> Result<(), StepError> {
    if env.dry_run {
        info!(run_id = %input.run_id, files = scaffold.files.len(), "Dry run: scaffold not written");
    } else {
        write_files(env.workspace, &scaffold.files)?;
        info!(run_id = %input.run_id, files = scaffold.files.len(), "Scaffold written");
    }

    if input.tools.code_execution {
        for command in &scaffold.commands {
            if env.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            env.runner.run_checked(command).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl PersonaStep for CodingStep {
    fn persona(&self) -> Persona {
        Persona::Coding
    }

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError> {
        let scaffold: CodingOutput = env
            .generate_json(Persona::Coding, INSTRUCTIONS, Self::build_input(input), &input.tools)
            .await?;
        let output = PersonaOutput::Coding(scaffold);
        // Nothing touches the workspace until the manifest is known to be contained.
        output
            .validate()
            .map_err(|e| StepError::Validation(e.to_string()))?;
        if let PersonaOutput::Coding(scaffold) = &output {
            apply(scaffold, input, env).await?;
        }
        Ok(output)
    }
}
