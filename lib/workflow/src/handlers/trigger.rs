//! Trigger handlers.
//!
//! A trigger's output is the payload the run was started with. Webhook and
//! schedule delivery happen outside the engine; by the time a trigger node is
//! dispatched its event has already arrived.

use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::NodeType;
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Passes the trigger payload through as the node output.
#[derive(Debug, Clone, Copy)]
pub struct TriggerHandler {
    node_type: NodeType,
}

impl TriggerHandler {
    /// Creates a handler for one of the trigger types.
    #[must_use]
    pub fn new(node_type: NodeType) -> Self {
        Self { node_type }
    }
}

#[async_trait]
impl NodeHandler for TriggerHandler {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        if self.node_type != NodeType::ScheduleTrigger {
            return Ok(());
        }
        match config.get("cron").and_then(JsonValue::as_str) {
            Some(cron) if !cron.trim().is_empty() => Ok(()),
            _ => Err("schedule trigger requires a cron expression".to_string()),
        }
    }

    async fn execute(
        &self,
        _config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        Ok(ActionResult::ok(context.trigger_payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use chainweave_core::{ExecutionId, UserId, WorkflowId};
    use serde_json::json;

    #[tokio::test]
    async fn outputs_the_trigger_payload() {
        let context = ExecutionContext::new(
            ExecutionId::new(),
            WorkflowId::new(),
            UserId::new(),
            json!({"event": "signup"}),
        )
        .for_node(NodeId::new("t"), json!({"event": "signup"}));

        let handler = TriggerHandler::new(NodeType::WebhookTrigger);
        let result = handler.execute(&json!({}), &context).await.expect("execute");
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"event": "signup"})));
    }

    #[test]
    fn schedule_trigger_needs_cron() {
        let registry = NodeRegistry::new();
        let handler = TriggerHandler::new(NodeType::ScheduleTrigger);
        assert!(handler.validate_config(&json!({}), &registry).is_err());
        assert!(handler.validate_config(&json!({"cron": " "}), &registry).is_err());
        assert!(
            handler
                .validate_config(&json!({"cron": "0 9 * * 1"}), &registry)
                .is_ok()
        );

        let manual = TriggerHandler::new(NodeType::ManualTrigger);
        assert!(manual.validate_config(&JsonValue::Null, &registry).is_ok());
    }
}
