use async_trait::async_trait;
use pipewright_common::{Persona, PersonaOutput, TestOutcome, TestingOutput};
use tracing::info;

use super::{PersonaStep, StepEnv, StepInput};
use crate::errors::StepError;

const INSTRUCTIONS: &str = "You are the Testing persona. Review the scaffold against the \
acceptance criteria, name the tests that cover it, and give the single command that runs \
them inside the workspace. Report outcome \"fail\" with the failures when the scaffold cannot \
pass. Answer with one JSON object with the fields: schema_version (1), summary, outcome \
(\"pass\" or \"fail\"), tests, coverage_hint, command, failures.";

pub struct TestingStep;

impl TestingStep {
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
impl PersonaStep for TestingStep {
    fn persona(&self) -> Persona {
        Persona::Testing
    }

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError> {
        let report: TestingOutput = env
            .generate_json(Persona::Testing, INSTRUCTIONS, Self::build_input(input), &input.tools)
            .await?;
        PersonaOutput::Testing(report.clone())
            .validate()
            .map_err(|e| StepError::Validation(e.to_string()))?;

        if input.tools.code_execution
            && let Some(command) = report.command.as_deref()
        {
            let record = env.runner.run_checked(command).await?;
            info!(
                run_id = %input.run_id,
                command,
                outcome = record.outcome.as_str(),
                "Test command finished"
            );
        }

        // A failing report is retryable like any other tool failure.
        if report.outcome == TestOutcome::Fail {
            return Err(StepError::ToolExecution(format!(
                "tests reported failures: {}",
                report.failures.join("; ")
            )));
        }
        Ok(PersonaOutput::Testing(report))
    }
}
