//! Per-run execution context.
//!
//! The context carries run identity, the trigger payload, workflow variables,
//! and every node output recorded so far. Handlers receive a snapshot taken at
//! dispatch time, so they see the outputs of everything upstream of them and
//! cannot observe or disturb writes made by concurrently running nodes.
//!
//! A nested run (a chain started by a router) gets a child context: the
//! enclosing graph's outputs stay readable through an inherited layer, while
//! the nested graph records into a map of its own. Node ids only need to be
//! unique within one graph.

use crate::error::ExecutionError;
use crate::node::NodeId;
use crate::scheduler::Scheduler;
use chainweave_core::{ExecutionId, UserId, WorkflowId};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// State shared by every node of one run.
#[derive(Clone)]
pub struct ExecutionContext {
    /// The run this context belongs to.
    pub execution_id: ExecutionId,
    /// The workflow being run.
    pub workflow_id: WorkflowId,
    /// Who the run is billed to.
    pub user_id: UserId,
    /// The payload the run was triggered with.
    pub trigger_payload: JsonValue,
    /// Workflow variables.
    pub variables: Map<String, JsonValue>,
    /// Simulate side effects instead of performing them.
    pub test_mode: bool,
    /// Treat triggers as already fired with the payload.
    pub skip_triggers: bool,
    node_outputs: HashMap<NodeId, JsonValue>,
    inherited_outputs: Arc<HashMap<NodeId, JsonValue>>,
    current_node: Option<NodeId>,
    attempt: u32,
    input: JsonValue,
    scheduler: Option<Scheduler>,
}

impl ExecutionContext {
    /// Creates a context for a new run.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        user_id: UserId,
        trigger_payload: JsonValue,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            user_id,
            trigger_payload,
            variables: Map::new(),
            test_mode: false,
            skip_triggers: false,
            node_outputs: HashMap::new(),
            inherited_outputs: Arc::new(HashMap::new()),
            current_node: None,
            attempt: 0,
            input: JsonValue::Null,
            scheduler: None,
        }
    }

    /// Sets test mode.
    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Sets whether triggers are bypassed.
    #[must_use]
    pub fn with_skip_triggers(mut self, skip_triggers: bool) -> Self {
        self.skip_triggers = skip_triggers;
        self
    }

    /// Sets workflow variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables = variables;
        self
    }

    /// Records a node's output.
    ///
    /// # Errors
    ///
    /// Returns an error if the node already has an output in this graph; the
    /// first value is kept. Outputs inherited from an enclosing graph do not
    /// count.
    pub fn record_output(&mut self, node_id: NodeId, output: JsonValue) -> Result<(), ExecutionError> {
        if self.node_outputs.contains_key(&node_id) {
            return Err(ExecutionError::OutputAlreadyRecorded { node_id });
        }
        self.node_outputs.insert(node_id, output);
        Ok(())
    }

    /// The output of a node, if it has succeeded.
    ///
    /// Outputs of this graph shadow inherited ones with the same id.
    #[must_use]
    pub fn output(&self, node_id: &NodeId) -> Option<&JsonValue> {
        self.node_outputs
            .get(node_id)
            .or_else(|| self.inherited_outputs.get(node_id))
    }

    /// Outputs recorded by this graph.
    #[must_use]
    pub fn node_outputs(&self) -> &HashMap<NodeId, JsonValue> {
        &self.node_outputs
    }

    /// Every visible output as a JSON object keyed by node id.
    #[must_use]
    pub fn outputs_json(&self) -> JsonValue {
        JsonValue::Object(
            self.inherited_outputs
                .iter()
                .chain(&self.node_outputs)
                .map(|(id, output)| (id.to_string(), output.clone()))
                .collect(),
        )
    }

    /// The node being executed, inside a handler.
    #[must_use]
    pub fn current_node(&self) -> Option<&NodeId> {
        self.current_node.as_ref()
    }

    /// Input of the node being executed.
    #[must_use]
    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    /// Retry attempt of the node being executed; zero on the first try.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The scheduler running this context, for handlers that run nested graphs.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub(crate) fn bind_scheduler(&mut self, scheduler: Scheduler) {
        self.scheduler = Some(scheduler);
    }

    /// Snapshot handed to one dispatched node.
    #[must_use]
    pub fn for_node(&self, node_id: NodeId, input: JsonValue) -> Self {
        let mut snapshot = self.clone();
        snapshot.current_node = Some(node_id);
        snapshot.input = input;
        snapshot
    }

    /// The same snapshot for a retry of the current node.
    #[must_use]
    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        let mut retry = self.clone();
        retry.attempt = attempt;
        retry
    }

    /// Context for a nested run started by the current node.
    ///
    /// The child keeps the run identity and the current node's input, which
    /// becomes the input of the nested entry nodes. Outputs recorded so far
    /// become read-only; the child starts with an empty output map.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut inherited = (*self.inherited_outputs).clone();
        inherited.extend(
            self.node_outputs
                .iter()
                .map(|(id, output)| (id.clone(), output.clone())),
        );

        let mut child = self.clone();
        child.node_outputs = HashMap::new();
        child.inherited_outputs = Arc::new(inherited);
        child.current_node = None;
        child.attempt = 0;
        child
    }

    /// A view of the context handed to expression-style lookups.
    #[must_use]
    pub fn scope(&self) -> JsonValue {
        serde_json::json!({
            "input": self.input,
            "trigger": self.trigger_payload,
            "nodes": self.outputs_json(),
            "variables": self.variables,
        })
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("workflow_id", &self.workflow_id)
            .field("user_id", &self.user_id)
            .field("test_mode", &self.test_mode)
            .field("skip_triggers", &self.skip_triggers)
            .field("current_node", &self.current_node)
            .field("outputs", &self.node_outputs.len())
            .field("inherited_outputs", &self.inherited_outputs.len())
            .finish_non_exhaustive()
    }
}
