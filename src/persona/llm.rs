//! Model transport behind an opaque trait.

use async_trait::async_trait;
use pipewright_common::{Persona, ToolToggles};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::errors::StepError;
use crate::util::truncate;

/// One model call: system instructions plus user input.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub persona: Persona,
    pub model: String,
    pub instructions: String,
    pub input: String,
    pub tools: ToolToggles,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub response_id: Option<String>,
    /// Ids of hosted tool calls (web search, file search, code interpreter).
    pub tool_call_ids: Vec<String>,
}

/// Abstraction over the model for testability.
/// Real implementation: `OpenAiClient`. Offline double: `OfflineClient`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, StepError>;
}

/// HTTP client for the OpenAI Responses API.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url)
    }
}

/// Hosted tool definitions for the enabled toggles.
pub fn tool_definitions(tools: &ToolToggles) -> Vec<Value> {
    let mut defs = Vec::new();
    if tools.web_search {
        defs.push(json!({ "type": "web_search" }));
    }
    if tools.file_search {
        if tools.vector_store_ids.is_empty() {
            warn!("file_search is enabled without vector_store_ids; tool not sent");
        } else {
            defs.push(json!({
                "type": "file_search",
                "vector_store_ids": tools.vector_store_ids,
            }));
        }
    }
    if tools.code_execution {
        defs.push(json!({ "type": "code_interpreter", "container": { "type": "auto" } }));
    }
    defs
}

pub fn request_body(request: &LlmRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "input": [
            {
                "role": "system",
                "content": [{ "type": "input_text", "text": request.instructions }],
            },
            {
                "role": "user",
                "content": [{ "type": "input_text", "text": request.input }],
            },
        ],
    });
    let tools = tool_definitions(&request.tools);
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }
    body
}

/// Pull message text and tool-call ids out of a Responses API payload.
pub fn parse_response(body: &Value) -> Result<LlmResponse, StepError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(StepError::Generation(format!("model returned an error: {}", message)));
    }

    let mut chunks = Vec::new();
    let mut tool_call_ids = Vec::new();
    for item in body
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == "message" {
            for content in item
                .get("content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(text) = content.get("text").and_then(Value::as_str) {
                    chunks.push(text.to_string());
                }
            }
        } else if kind.ends_with("_call")
            && let Some(id) = item.get("id").and_then(Value::as_str)
        {
            tool_call_ids.push(id.to_string());
        }
    }

    let text = if chunks.is_empty() {
        body.get("output_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    } else {
        chunks.join("\n")
    };
    if text.trim().is_empty() {
        return Err(StepError::Generation(
            "model response contained no text output".to_string(),
        ));
    }

    Ok(LlmResponse {
        text,
        response_id: body.get("id").and_then(Value::as_str).map(String::from),
        tool_call_ids,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, StepError> {
        let body = request_body(request);
        debug!(
            persona = %request.persona,
            model = %request.model,
            tools = ?request.tools.enabled_names(),
            "Invoking Responses API"
        );

        let resp = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("User-Agent", "pipewright")
            .json(&body)
            .send()
            .await
            .map_err(|e| StepError::Generation(format!("model request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StepError::Generation(format!("failed to read model response: {}", e)))?;
        if !status.is_success() {
            warn!(persona = %request.persona, %status, "Model call rejected");
            return Err(StepError::Generation(format!(
                "model returned HTTP {}: {}",
                status,
                truncate(&text, 300)
            )));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            StepError::Generation(format!("model response is not JSON: {}", e))
        })?;
        parse_response(&value)
    }
}
