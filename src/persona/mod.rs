//! Persona steps.
//!
//! Every persona satisfies [`PersonaStep`]: it receives the prompt, frozen
//! config, and every earlier persona's structured output, and returns its own
//! [`PersonaOutput`] variant. The orchestrator validates that output before
//! it counts as a success.

pub mod coding;
pub mod documentation;
pub mod llm;
pub mod offline;
pub mod requirements;
pub mod testing;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pipewright_common::{
    ErrorKind, InputDocument, Persona, PersonaOutput, RunConfig, ToolToggles,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::StepError;
use crate::sandbox::CommandRunner;
use crate::util::{extract_json_object, truncate};

pub use coding::CodingStep;
pub use documentation::DocumentationStep;
pub use llm::{LlmClient, LlmRequest, LlmResponse, OpenAiClient};
pub use offline::OfflineClient;
pub use requirements::RequirementsStep;
pub use testing::TestingStep;

/// Cap on the error message carried into a fix-forward retry.
pub const RETRY_MESSAGE_LIMIT: usize = 500;

/// Bounded error summary handed to the single fix-forward retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryContext {
    pub kind: ErrorKind,
    pub message: String,
}

impl RetryContext {
    pub fn from_error(err: &StepError) -> Self {
        Self {
            kind: err.kind(),
            message: truncate(&err.message(), RETRY_MESSAGE_LIMIT),
        }
    }
}

/// What a persona sees. Serialized verbatim as the step's input payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepInput {
    pub run_id: String,
    pub persona: Persona,
    pub attempt: u32,
    pub prompt: String,
    #[serde(default)]
    pub documents: Vec<InputDocument>,
    #[serde(default)]
    pub tools: ToolToggles,
    /// Outputs of every earlier persona, in pipeline order.
    #[serde(default)]
    pub prior_outputs: Vec<PersonaOutput>,
    #[serde(default)]
    pub retry: Option<RetryContext>,
}

impl StepInput {
    pub fn new(
        run_id: &str,
        persona: Persona,
        attempt: u32,
        config: &RunConfig,
        prior_outputs: Vec<PersonaOutput>,
        retry: Option<RetryContext>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            persona,
            attempt,
            prompt: config.prompt.clone(),
            documents: config.documents.clone(),
            tools: config.tools.clone(),
            prior_outputs,
            retry,
        }
    }

    pub fn prior(&self, persona: Persona) -> Option<&PersonaOutput> {
        self.prior_outputs.iter().find(|o| o.persona() == persona)
    }

    /// Earlier outputs as pretty JSON, one block per persona.
    pub fn render_prior(&self) -> String {
        self.prior_outputs
            .iter()
            .map(|o| {
                let body = serde_json::to_string_pretty(o).unwrap_or_default();
                format!("## {} output\n{}", o.persona().display_name(), body)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Retry notice appended to the model input on a fix-forward attempt.
    pub fn render_retry(&self) -> String {
        match &self.retry {
            Some(retry) => format!(
                "\n\nThe previous attempt failed ({}): {}\nFix the cause and answer again.",
                retry.kind, retry.message
            ),
            None => String::new(),
        }
    }
}

/// Side-effect capabilities available to a persona for one attempt.
pub struct StepEnv<'a> {
    pub llm: &'a dyn LlmClient,
    pub runner: &'a CommandRunner,
    pub workspace: &'a Path,
    pub model: &'a str,
    pub llm_timeout: Duration,
    pub dry_run: bool,
    pub cancel: CancellationToken,
    tool_call_ids: Mutex<Vec<String>>,
}

impl<'a> StepEnv<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        runner: &'a CommandRunner,
        workspace: &'a Path,
        model: &'a str,
        llm_timeout: Duration,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            runner,
            workspace,
            model,
            llm_timeout,
            dry_run,
            cancel,
            tool_call_ids: Mutex::new(Vec::new()),
        }
    }

    /// Call the model once. Timeout is a generation error; cancellation wins
    /// over a pending response.
    pub async fn generate(
        &self,
        persona: Persona,
        instructions: &str,
        input: String,
        tools: &ToolToggles,
    ) -> Result<String, StepError> {
        let request = LlmRequest {
            persona,
            model: self.model.to_string(),
            instructions: instructions.to_string(),
            input,
            tools: tools.clone(),
        };
        let response = tokio::select! {
            res = tokio::time::timeout(self.llm_timeout, self.llm.generate(&request)) => match res {
                Ok(res) => res?,
                Err(_) => {
                    return Err(StepError::Generation(format!(
                        "model call timed out after {}s",
                        self.llm_timeout.as_secs()
                    )));
                }
            },
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
        };
        debug!(
            persona = %persona,
            client = self.llm.name(),
            tool_calls = response.tool_call_ids.len(),
            "Model responded"
        );
        if let Ok(mut ids) = self.tool_call_ids.lock() {
            ids.extend(response.tool_call_ids);
        }
        Ok(response.text)
    }

    /// Generate and decode one persona's schema from the model's JSON answer.
    pub async fn generate_json<T: DeserializeOwned>(
        &self,
        persona: Persona,
        instructions: &str,
        input: String,
        tools: &ToolToggles,
    ) -> Result<T, StepError> {
        let text = self.generate(persona, instructions, input, tools).await?;
        parse_model_json(&text)
    }

    pub fn take_tool_call_ids(&self) -> Vec<String> {
        self.tool_call_ids
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default()
    }
}

/// Decode the outermost JSON object in model text.
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T, StepError> {
    let json = extract_json_object(text).ok_or_else(|| {
        StepError::Generation(format!(
            "model response contains no JSON object: {}",
            truncate(text.trim(), 200)
        ))
    })?;
    serde_json::from_str(json)
        .map_err(|e| StepError::Generation(format!("model response is not the expected shape: {}", e)))
}

/// Uniform contract for the four personas.
#[async_trait]
pub trait PersonaStep: Send + Sync {
    fn persona(&self) -> Persona;

    async fn execute(
        &self,
        input: &StepInput,
        env: &StepEnv<'_>,
    ) -> Result<PersonaOutput, StepError>;
}

/// The production pipeline, in execution order.
pub fn default_steps() -> Vec<Box<dyn PersonaStep>> {
    vec![
        Box::new(RequirementsStep),
        Box::new(CodingStep),
        Box::new(TestingStep),
        Box::new(DocumentationStep),
    ]
}
