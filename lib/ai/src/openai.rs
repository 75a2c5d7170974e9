//! OpenAI-compatible chat completions backend.

use crate::backend::{ModelBackend, ModelRequest, ModelResponse, TokenUsage};
use crate::error::ModelError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Connection settings for an OpenAI-compatible provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    /// Base URL up to and including the API version segment.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token; omitted for local providers that need none.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model used when a router does not name one.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            default_model: default_model(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Chat completions client.
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    settings: ModelSettings,
}

impl OpenAiCompatibleBackend {
    /// Creates a backend from settings.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::Unavailable` if the HTTP client cannot be built.
    pub fn new(settings: ModelSettings) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| ModelError::Unavailable {
                details: e.to_string(),
            })?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = request_body(request, &self.settings.default_model);

        let mut call = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.settings.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::RequestFailed {
                    status: None,
                    details: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(ModelError::RequestFailed {
                status: Some(status.as_u16()),
                details,
            });
        }

        let payload: JsonValue = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse {
                details: e.to_string(),
            })?;
        let completion = parse_completion(payload, &request.model)?;
        debug!(
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "Model completion received"
        );
        Ok(completion)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

fn request_body(request: &ModelRequest, default_model: &str) -> JsonValue {
    let model = if request.model.is_empty() {
        default_model
    } else {
        request.model.as_str()
    };

    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if request.json_output {
        body["response_format"] = json!({"type": "json_object"});
    }
    body
}

#[derive(Deserialize)]
struct CompletionPayload {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_completion(payload: JsonValue, requested_model: &str) -> Result<ModelResponse, ModelError> {
    let payload: CompletionPayload =
        serde_json::from_value(payload).map_err(|e| ModelError::InvalidResponse {
            details: e.to_string(),
        })?;

    let content = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ModelError::InvalidResponse {
            details: "completion has no message content".to_string(),
        })?;

    let usage = payload.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(ModelResponse {
        content,
        usage,
        model: payload
            .model
            .unwrap_or_else(|| requested_model.to_string()),
    })
}
