use async_trait::async_trait;
use pipewright_common::{DocumentationOutput, Persona, PersonaOutput};
use tracing::info;

use super::{PersonaStep, StepEnv, StepInput};
use crate::errors::StepError;

const INSTRUCTIONS: &str = "You are the Documentation persona. Write the project README with \
quickstart steps, the key commands, reproducibility notes and known limitations, plus \
changelog entries for this run. Answer with one JSON object with the fields: schema_version \
(1), summary, readme, changelog.";

pub const README_FILE: &str = "README.md";

pub struct DocumentationStep;

impl DocumentationStep {
    fn build_input(input: &StepInput) -> String {
        format!(
            "Prompt:\n{}\n\nEarlier persona outputs:\n{}{}",
            input.prompt,
            input.render_prior(),
            input.render_retry()
        )
    }
}

#[async_trait]
impl PersonaStep for DocumentationStep {
    fn persona(&self) -> Persona {
        Persona::Documentation
    }

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError> {
        let docs: DocumentationOutput = env
            .generate_json(
                Persona::Documentation,
                INSTRUCTIONS,
                Self::build_input(input),
                &input.tools,
            )
            .await?;

        if !env.dry_run && !docs.readme.trim().is_empty() {
            let path = env.workspace.join(README_FILE);
            std::fs::create_dir_all(env.workspace)
                .and_then(|_| std::fs::write(&path, &docs.readme))
                .map_err(|e| {
                    StepError::ToolExecution(format!("cannot write {}: {}", path.display(), e))
                })?;
            info!(run_id = %input.run_id, path = %path.display(), "README written");
        }

        Ok(PersonaOutput::Documentation(docs))
    }
}
