use async_trait::async_trait;
use pipewright_common::{Persona, PersonaOutput, RequirementsOutput};

use super::{PersonaStep, StepEnv, StepInput};
use crate::errors::StepError;

const INSTRUCTIONS: &str = "You are the Requirements persona. Extract explicit requirements \
from the prompt and background documents as acceptance criteria, and list assumptions, \
constraints and risks. Respect framework versions named in the documents. Answer with one \
JSON object with the fields: schema_version (1), summary, acceptance_criteria, assumptions, \
constraints, risks.";

pub struct RequirementsStep;

impl RequirementsStep {
    fn build_input(input: &StepInput) -> String {
        let docs = input
            .documents
            .iter()
            .map(|doc| {
                format!(
                    "# Document: {}\nType: {}\n{}",
                    doc.path.display(),
                    doc.media_type,
                    doc.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let docs = if docs.is_empty() { "(none)".to_string() } else { docs };
        format!(
            "Prompt:\n{}\n\nBackground documents:\n{}{}",
            input.prompt,
            docs,
            input.render_retry()
        )
    }
}

#[async_trait]
impl PersonaStep for RequirementsStep {
    fn persona(&self) -> Persona {
        Persona::Requirements
    }

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError> {
        let output: RequirementsOutput = env
            .generate_json(
                Persona::Requirements,
                INSTRUCTIONS,
                Self::build_input(input),
                &input.tools,
            )
            .await?;
        Ok(PersonaOutput::Requirements(output))
    }
}
