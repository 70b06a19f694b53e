//! Deterministic model stand-in for dry runs and `provider = "offline"`.

use async_trait::async_trait;
use pipewright_common::Persona;
use serde_json::{Value, json};

use super::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::errors::StepError;
use crate::util::{sha256_hex, truncate};

/// Answers every request with a canned, schema-valid output for the persona.
///
/// The same request always yields the same answer. When code execution is
/// enabled the coding answer carries one harmless `echo` command, so the
/// command policy is still exercised.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineClient;

impl OfflineClient {
    pub fn canned(request: &LlmRequest) -> Value {
        let digest = sha256_hex(request.input.as_bytes());
        let tag = &digest[..12];
        let excerpt = truncate(first_line(&request.input), 120);

        match request.persona {
            Persona::Requirements => json!({
                "schema_version": 1,
                "summary": format!("Offline requirements for: {}", excerpt),
                "acceptance_criteria": [
                    "The project builds from a clean checkout",
                    "The README explains how to run it",
                ],
                "assumptions": ["Generated without a model (offline mode)"],
                "constraints": [],
                "risks": ["Offline output is a placeholder, not a design"],
            }),
            Persona::Coding => {
                let commands = if request.tools.code_execution {
                    vec![format!("echo pipewright offline scaffold {}", tag)]
                } else {
                    Vec::new()
                };
                json!({
                    "schema_version": 1,
                    "summary": "Offline scaffold with a single plan file",
                    "files": [{
                        "path": "PIPEWRIGHT_PLAN.md",
                        "contents": format!(
                            "# Plan\n\nGenerated offline ({}).\n\n> {}\n",
                            tag, excerpt
                        ),
                    }],
                    "dependencies": [],
                    "commands": commands,
                })
            }
            Persona::Testing => json!({
                "schema_version": 1,
                "summary": "No tests executed in offline mode",
                "outcome": "pass",
                "tests": [],
                "coverage_hint": null,
                "command": null,
                "failures": [],
            }),
            Persona::Documentation => json!({
                "schema_version": 1,
                "summary": "Offline documentation",
                "readme": format!("# Project\n\n{}\n\nGenerated offline by pipewright.\n", excerpt),
                "changelog": [format!("Initial offline scaffold ({})", tag)],
            }),
        }
    }
}

fn first_line(input: &str) -> &str {
    input
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.ends_with(':'))
        .unwrap_or("")
}

#[async_trait]
impl LlmClient for OfflineClient {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, StepError> {
        let text = serde_json::to_string_pretty(&Self::canned(request))
            .map_err(|e| StepError::Generation(e.to_string()))?;
        Ok(LlmResponse {
            text,
            response_id: None,
            tool_call_ids: Vec::new(),
        })
    }
}
