//! Workflow node types.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An ID, unique within its graph
//! - A type naming the handler that executes it
//! - Opaque, handler-specific configuration
//! - Optional per-node overrides for failure policy, retries, and timeout

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Identifies a node within one graph.
///
/// Node ids are chosen by the workflow author and are only unique within a
/// single graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The broad role a node type plays in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Entry points that start a run.
    Trigger,
    /// Steps that do work and pass data on.
    Action,
    /// Steps that choose which outgoing edges fire.
    Router,
}

/// The closed set of node types the engine knows how to dispatch.
///
/// Unknown type strings fail to deserialize, so a workflow naming one is
/// rejected when it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    ManualTrigger,
    WebhookTrigger,
    ScheduleTrigger,
    HttpRequest,
    SetFields,
    Delay,
    Log,
    ConditionalRouter,
    AiRouter,
}

impl NodeType {
    /// Every known type.
    pub const ALL: [Self; 9] = [
        Self::ManualTrigger,
        Self::WebhookTrigger,
        Self::ScheduleTrigger,
        Self::HttpRequest,
        Self::SetFields,
        Self::Delay,
        Self::Log,
        Self::ConditionalRouter,
        Self::AiRouter,
    ];

    /// Wire name of the type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualTrigger => "manual_trigger",
            Self::WebhookTrigger => "webhook_trigger",
            Self::ScheduleTrigger => "schedule_trigger",
            Self::HttpRequest => "http_request",
            Self::SetFields => "set_fields",
            Self::Delay => "delay",
            Self::Log => "log",
            Self::ConditionalRouter => "conditional_router",
            Self::AiRouter => "ai_router",
        }
    }

    /// The category of this type.
    #[must_use]
    pub fn category(&self) -> NodeCategory {
        match self {
            Self::ManualTrigger | Self::WebhookTrigger | Self::ScheduleTrigger => {
                NodeCategory::Trigger
            }
            Self::HttpRequest | Self::SetFields | Self::Delay | Self::Log => NodeCategory::Action,
            Self::ConditionalRouter | Self::AiRouter => NodeCategory::Router,
        }
    }

    /// Returns true for trigger types.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.category() == NodeCategory::Trigger
    }

    /// Returns true for types whose execution is metered by the usage governor.
    #[must_use]
    pub fn is_cost_bearing(&self) -> bool {
        matches!(self, Self::AiRouter)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: NodeId,
    /// Which handler executes this node.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: JsonValue,
    /// Marks the node as an entry point of the graph.
    #[serde(default)]
    pub is_trigger: bool,
    /// Overrides the run's failure policy for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Overrides the run's retry budget for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Overrides the run's per-node timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Node {
    /// Creates a node with empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            title: None,
            config: JsonValue::Null,
            is_trigger: node_type.is_trigger(),
            continue_on_error: None,
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// Sets the display title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Overrides the failure policy for this node.
    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }

    /// Overrides the retry budget for this node.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Overrides the timeout for this node.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Returns true if this node can start a run.
    #[must_use]
    pub fn is_trigger_node(&self) -> bool {
        self.is_trigger || self.node_type.is_trigger()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_type_wire_names() {
        for node_type in NodeType::ALL {
            let json = serde_json::to_value(node_type).expect("serialize");
            assert_eq!(json, JsonValue::String(node_type.as_str().to_string()));
        }
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let result: Result<Node, _> =
            serde_json::from_value(json!({"id": "a", "type": "send_fax"}));
        assert!(result.is_err());
    }

    #[test]
    fn trigger_types_mark_nodes_as_triggers() {
        assert!(Node::new("t", NodeType::WebhookTrigger).is_trigger_node());
        assert!(!Node::new("a", NodeType::Log).is_trigger_node());
        assert_eq!(NodeType::AiRouter.category(), NodeCategory::Router);
        assert!(NodeType::AiRouter.is_cost_bearing());
        assert!(!NodeType::HttpRequest.is_cost_bearing());
    }

    #[test]
    fn node_deserializes_editor_shape() {
        let node: Node = serde_json::from_value(json!({
            "id": "fetch",
            "type": "http_request",
            "title": "Fetch order",
            "config": {"url": "https://example.com"},
            "continueOnError": true,
            "timeoutMs": 500
        }))
        .expect("deserialize");

        assert_eq!(node.id, NodeId::new("fetch"));
        assert_eq!(node.node_type, NodeType::HttpRequest);
        assert!(!node.is_trigger);
        assert_eq!(node.continue_on_error, Some(true));
        assert_eq!(node.timeout_ms, Some(500));
        assert_eq!(node.max_retries, None);
    }

    #[test]
    fn optional_overrides_are_omitted_when_unset() {
        let json = serde_json::to_value(Node::new("a", NodeType::Log)).expect("serialize");
        assert!(json.get("continueOnError").is_none());
        assert!(json.get("maxRetries").is_none());
        assert_eq!(json["isTrigger"], json!(false));
    }
}
