//! OpenAI-compatible chat completions client. Works against the OpenAI API
//! and against a local Ollama server exposing `/v1`.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_agent::llm::{ExtractionRequest, LanguageModel, ModelRequest, ModelTurn};
use leadflow_agent::prompt::{extraction_prompt, EXTRACTION_SYSTEM_PROMPT};
use leadflow_agent::tools::{Capability, CapabilitySpec};
use leadflow_core::config::{LlmConfig, LlmProvider};
use leadflow_core::domain::message::{ChatMessage, Role};
use leadflow_core::ports::PortError;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct ChatCompletionsModel {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatCompletionsModel {
    pub fn new(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434/v1".to_string(),
        };

        Ok(Self {
            http,
            endpoint: format!("{base_url}/chat/completions"),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(&self, operation: &'static str, body: Value) -> Result<AssistantMessage, PortError> {
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| PortError::Transport(format!("{operation}: {error}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default().chars().take(300).collect();
            return Err(PortError::Status { status: status.as_u16(), message });
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|error| PortError::Decode(format!("{operation}: {error}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| PortError::Decode(format!("{operation}: completion has no choices")))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn decide(&self, request: &ModelRequest) -> Result<ModelTurn, PortError> {
        let mut messages = vec![json!({ "role": "system", "content": request.system_prompt })];
        messages.extend(request.history.iter().map(wire_message));

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
            "tools": request.capabilities.iter().map(tool_definition).collect::<Vec<_>>(),
            "tool_choice": "auto",
        });

        let message = self.complete("decide", body).await?;
        turn_from_message(message)
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String, PortError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": EXTRACTION_SYSTEM_PROMPT },
                { "role": "user", "content": extraction_prompt(request) },
            ],
        });

        let message = self.complete("extract", body).await?;
        Ok(message.content.unwrap_or_default())
    }
}

/// Tool notes have no call id to pair with, so they travel as system context.
fn wire_message(message: &ChatMessage) -> Value {
    match message.role {
        Role::Customer => json!({ "role": "user", "content": message.content }),
        Role::Assistant => json!({ "role": "assistant", "content": message.content }),
        Role::Tool => json!({ "role": "system", "content": format!("[tool] {}", message.content) }),
    }
}

fn tool_definition(spec: &CapabilitySpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

fn turn_from_message(message: AssistantMessage) -> Result<ModelTurn, PortError> {
    if let Some(call) = message.tool_calls.into_iter().next() {
        let arguments = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|error| {
                PortError::Decode(format!("arguments of `{}` are not JSON: {error}", call.function.name))
            })?
        };
        return Capability::from_call(&call.function.name, &arguments)
            .map(ModelTurn::Invoke)
            .inspect_err(|error| {
                warn!(
                    event_name = "server.llm.tool_call_rejected",
                    correlation_id = "llm",
                    tool = %call.function.name,
                    error = %error,
                    "model requested an unusable tool call"
                );
            });
    }

    match message.content.map(|content| content.trim().to_string()) {
        Some(content) if !content.is_empty() => Ok(ModelTurn::Reply(content)),
        _ => Err(PortError::Decode("completion carries neither text nor a tool call".to_string())),
    }
}
