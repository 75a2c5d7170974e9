//! Scripted handler for scheduler tests.
//!
//! Behaviour comes from the node config:
//! - `delayMs`: sleep before answering
//! - `fail`: answer `success: false` with this error text
//! - `errorTimes`: return `Err` on the first N calls for the node
//! - `panic`: panic inside the handler
//! - `output`: output to return (defaults to `{"node": <id>}`)

use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::{NodeId, NodeType};
use crate::registry::{ActionResult, NodeHandler};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared observations across scripted handlers.
#[derive(Clone, Default)]
pub(crate) struct Probe {
    events: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<HashMap<NodeId, usize>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Probe {
    pub(crate) fn calls(&self, node_id: &NodeId) -> usize {
        self.calls.lock().expect("probe lock").get(node_id).copied().unwrap_or(0)
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().expect("probe lock").clone()
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, node_id: &NodeId) -> usize {
        self.events.lock().expect("probe lock").push(format!("start:{node_id}"));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut calls = self.calls.lock().expect("probe lock");
        let count = calls.entry(node_id.clone()).or_default();
        *count += 1;
        *count
    }

    fn leave(&self, node_id: &NodeId) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().expect("probe lock").push(format!("end:{node_id}"));
    }
}

/// A handler that does what its node config says.
pub(crate) struct ScriptedHandler {
    node_type: NodeType,
    probe: Probe,
}

impl ScriptedHandler {
    pub(crate) fn new(node_type: NodeType, probe: Probe) -> Self {
        Self { node_type, probe }
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let node_id = context.current_node().cloned().unwrap_or_else(|| NodeId::new("?"));
        let call = self.probe.enter(&node_id);

        if let Some(ms) = config.get("delayMs").and_then(JsonValue::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.probe.leave(&node_id);

        if config.get("panic").and_then(JsonValue::as_bool) == Some(true) {
            panic!("scripted panic in {node_id}");
        }
        let error_times = config
            .get("errorTimes")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        if (call as u64) <= error_times {
            return Err(NodeExecutionError::Failed {
                message: format!("transient error {call}"),
            });
        }
        if let Some(error) = config.get("fail").and_then(JsonValue::as_str) {
            return Ok(ActionResult::failure(error));
        }

        let output = config
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({"node": node_id.as_str()}));
        Ok(ActionResult::ok(output))
    }
}
