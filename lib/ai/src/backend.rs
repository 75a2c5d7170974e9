//! Model backend abstraction.
//!
//! Routers talk to language models through [`ModelBackend`] so that the
//! provider, transport and credentials stay outside the workflow engine.

use crate::error::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier understood by the backend.
    pub model: String,
    /// System prompt, if any.
    pub system: Option<String>,
    /// The user prompt.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
    /// Ask the provider to constrain output to a JSON object.
    pub json_output: bool,
}

impl ModelRequest {
    /// Creates a request with just a model and prompt.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            json_output: false,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the max tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Requests JSON-object output.
    #[must_use]
    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u32,
    /// Completion tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A completion returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text.
    pub content: String,
    /// Token accounting for pricing.
    pub usage: TokenUsage,
    /// Model that actually served the request.
    pub model: String,
}

/// A language model provider.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Runs one completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or answers with
    /// something that is not a completion.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// A backend that answers every request with the same canned reply.
///
/// Useful for tests and offline dry runs; it counts how often it was called.
pub struct StaticBackend {
    reply: Result<ModelResponse, ModelError>,
    calls: AtomicUsize,
}

impl StaticBackend {
    /// Creates a backend that always replies with `content`.
    #[must_use]
    pub fn replying(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            reply: Ok(ModelResponse {
                content: content.into(),
                usage,
                model: "static".to_string(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a backend that always fails with `error`.
    #[must_use]
    pub fn failing(error: ModelError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of completions requested so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for StaticBackend {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map(|mut response| {
            response.model = request.model.clone();
            response
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}
