//! Handlers that shape data without leaving the process.

use super::parse_config;
use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::NodeType;
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFieldsConfig {
    fields: Map<String, JsonValue>,
    #[serde(default = "default_keep_input")]
    keep_input: bool,
}

fn default_keep_input() -> bool {
    true
}

/// Writes configured fields over the node input.
///
/// With `keepInput: false` the output holds only the configured fields. A
/// non-object input is kept under `input` so nothing is silently dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFieldsHandler;

#[async_trait]
impl NodeHandler for SetFieldsHandler {
    fn node_type(&self) -> NodeType {
        NodeType::SetFields
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        parse_config::<SetFieldsConfig>(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config: SetFieldsConfig =
            parse_config(config).map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;

        let mut output = Map::new();
        if config.keep_input {
            match context.input() {
                JsonValue::Object(input) => output.extend(input.clone()),
                JsonValue::Null => {}
                other => {
                    output.insert("input".to_string(), other.clone());
                }
            }
        }
        output.extend(config.fields);
        Ok(ActionResult::ok(JsonValue::Object(output)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayConfig {
    duration_ms: u64,
}

/// Waits, then passes its input through.
///
/// Test runs do not wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Delay
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        parse_config::<DelayConfig>(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config: DelayConfig =
            parse_config(config).map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;

        if context.test_mode {
            return Ok(ActionResult::ok(context.input().clone())
                .with_message(format!("test mode: skipped {} ms delay", config.duration_ms)));
        }
        tokio::time::sleep(Duration::from_millis(config.duration_ms)).await;
        Ok(ActionResult::ok(context.input().clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogConfig {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    level: LogLevel,
}

/// Emits a log event with the node input, then passes the input through.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Log
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        parse_config::<LogConfig>(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config: LogConfig =
            parse_config(config).map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;
        let message = config.message.unwrap_or_else(|| "workflow log".to_string());
        let node_id = context.current_node().map(ToString::to_string).unwrap_or_default();
        let input = context.input();

        match config.level {
            LogLevel::Debug => debug!(execution_id = %context.execution_id, node_id = %node_id, %input, "{message}"),
            LogLevel::Info => info!(execution_id = %context.execution_id, node_id = %node_id, %input, "{message}"),
            LogLevel::Warn => warn!(execution_id = %context.execution_id, node_id = %node_id, %input, "{message}"),
        }
        Ok(ActionResult::ok(input.clone()).with_message(message))
    }
}
