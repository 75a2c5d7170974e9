//! Outbound HTTP requests.

use super::parse_config;
use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::NodeType;
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<JsonValue>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequestConfig {
    fn method(&self) -> Result<Method, String> {
        self.method
            .to_uppercase()
            .parse::<Method>()
            .map_err(|e| format!("invalid method {:?}: {e}", self.method))
    }

    fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".to_string());
        }
        self.method().map(|_| ())
    }

    fn describe(&self) -> JsonValue {
        json!({
            "method": self.method.to_uppercase(),
            "url": self.url,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

/// Sends an HTTP request and outputs the response.
///
/// Transport errors are returned as errors so the scheduler may retry them;
/// a non-2xx answer is a final failure carrying the response.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    /// Creates a handler with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler that sends through `client`.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        parse_config::<HttpRequestConfig>(config)?.validate()
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config: HttpRequestConfig =
            parse_config(config).map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;
        let method = config
            .method()
            .map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;

        if context.test_mode {
            return Ok(ActionResult::ok(json!({
                "testMode": true,
                "request": config.describe(),
            }))
            .with_message("test mode: request not sent"));
        }

        debug!(method = %method, url = %config.url, "Sending HTTP request");
        let mut request = self.client.request(method, &config.url);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeExecutionError::ExternalService {
                service: "http".to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NodeExecutionError::ExternalService {
                service: "http".to_string(),
                message: e.to_string(),
            })?;
        let body = serde_json::from_str::<JsonValue>(&text).unwrap_or(JsonValue::String(text));
        let output = json!({"status": status.as_u16(), "body": body});

        if status.is_success() {
            Ok(ActionResult::ok(output))
        } else {
            Ok(ActionResult::failure(format!("HTTP {status}")).with_output(output))
        }
    }
}
