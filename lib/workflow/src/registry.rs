//! Node handler registry.
//!
//! Node types map to handlers. The scheduler handles graph logic; handlers
//! only execute one node given its configuration and the run context.

use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::handlers;
use crate::node::NodeType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a handler reports back.
///
/// An explicit `success: false` is a final answer and is not retried; an
/// `Err` from the handler is treated as transient.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Whether the node succeeded.
    pub success: bool,
    /// Data passed downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Error text when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Informational message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Dollar cost incurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ActionResult {
    /// A successful result with output.
    #[must_use]
    pub fn ok(output: JsonValue) -> Self {
        Self {
            success: true,
            output: Some(output),
            ..Self::default()
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attaches output.
    #[must_use]
    pub fn with_output(mut self, output: JsonValue) -> Self {
        self.output = Some(output);
        self
    }

    /// Attaches a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches a cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// The text recorded on the node when this result is a failure.
    #[must_use]
    pub fn failure_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "node reported failure".to_string())
    }
}

/// Executes one node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The type this handler executes.
    fn node_type(&self) -> NodeType;

    /// Checks a node's configuration before any run starts.
    ///
    /// The registry is passed so handlers that embed nested graphs can check
    /// those nodes too.
    fn validate_config(&self, _config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        Ok(())
    }

    /// Executes the node.
    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError>;
}

/// Maps node types to their handlers.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every handler that needs no external wiring.
    ///
    /// The AI router needs a model backend and a usage governor, so it is
    /// registered separately.
    #[must_use]
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        for handler in handlers::builtin_handlers() {
            registry.register(handler);
        }
        registry
    }

    /// Registers a handler, replacing any handler for the same type.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(handler.node_type(), handler);
        self
    }

    /// Builder form of [`NodeRegistry::register`].
    #[must_use]
    pub fn with_handler(mut self, handler: impl NodeHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// The handler for a type.
    #[must_use]
    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    /// Returns true if a handler is registered for the type.
    #[must_use]
    pub fn contains(&self, node_type: NodeType) -> bool {
        self.handlers.contains_key(&node_type)
    }

    /// Registered types.
    pub fn registered_types(&self) -> impl Iterator<Item = NodeType> + '_ {
        self.handlers.keys().copied()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(NodeType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("NodeRegistry").field("handlers", &types).finish()
    }
}
