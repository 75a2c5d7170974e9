//! Error types for the workflow crate.
//!
//! - `GraphValidationError`: The graph cannot run (cycles, dangling edges, unknown types)
//! - `NodeExecutionError`: A handler failed; recorded on the node, never aborts the run
//! - `TimeoutError`: A node exceeded its time budget
//! - `ChainNotFound`: A selected route names a chain that does not exist
//! - `ExecutionError`: The run itself could not continue (e.g. the run store failed)
//! - `WorkflowError`: Engine-level failures, wrapping the above with workflow context

use crate::node::{NodeId, NodeType};
use chainweave_core::{ExecutionId, WorkflowId};
use std::fmt;

/// Errors that make a graph unrunnable. Raised before any node executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    /// Two nodes share an id.
    DuplicateNode { node_id: NodeId },
    /// An edge references a node that is not in the graph.
    DanglingEdge { edge_id: String, node_id: NodeId },
    /// The graph is not acyclic.
    CycleDetected { node_id: NodeId },
    /// No handler is registered for the node's type.
    UnregisteredNodeType { node_id: NodeId, node_type: NodeType },
    /// The handler rejected the node's configuration.
    InvalidNodeConfig { node_id: NodeId, reason: String },
    /// The graph has no trigger node.
    MissingTrigger,
    /// Several triggers exist and none was named.
    AmbiguousTrigger { candidates: Vec<NodeId> },
    /// The named trigger is not a trigger node of this graph.
    UnknownTrigger { node_id: NodeId },
}

impl fmt::Display for GraphValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DanglingEdge { edge_id, node_id } => {
                write!(f, "edge '{edge_id}' references unknown node {node_id}")
            }
            Self::CycleDetected { node_id } => {
                write!(f, "graph contains a cycle through node {node_id}")
            }
            Self::UnregisteredNodeType { node_id, node_type } => {
                write!(f, "no handler registered for type '{node_type}' of node {node_id}")
            }
            Self::InvalidNodeConfig { node_id, reason } => {
                write!(f, "invalid configuration for node {node_id}: {reason}")
            }
            Self::MissingTrigger => write!(f, "graph has no trigger node"),
            Self::AmbiguousTrigger { candidates } => {
                let names: Vec<&str> = candidates.iter().map(NodeId::as_str).collect();
                write!(
                    f,
                    "graph has several trigger nodes ({}) and none was selected",
                    names.join(", ")
                )
            }
            Self::UnknownTrigger { node_id } => write!(f, "{node_id} is not a trigger node"),
        }
    }
}

impl std::error::Error for GraphValidationError {}

/// Errors a node handler raises.
///
/// The scheduler records the rendered message on the failed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeExecutionError {
    /// The node configuration could not be interpreted.
    InvalidConfig { reason: String },
    /// The input the node needs was missing or malformed.
    InvalidInput { message: String },
    /// Execution failed.
    Failed { message: String },
    /// An external service failed.
    ExternalService { service: String, message: String },
    /// No handler is registered for the node type.
    UnsupportedNodeType { node_type: NodeType },
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid node configuration: {reason}"),
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::Failed { message } => f.write_str(message),
            Self::ExternalService { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::UnsupportedNodeType { node_type } => {
                write!(f, "unsupported node type: {node_type}")
            }
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// A node did not finish within its time budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    /// The node that timed out.
    pub node_id: NodeId,
    /// The budget it exceeded.
    pub timeout_ms: u64,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} timed out after {} ms",
            self.node_id, self.timeout_ms
        )
    }
}

impl std::error::Error for TimeoutError {}

/// A selected route has no chain to run. Logged and skipped, never a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNotFound {
    /// The chain id that was looked up.
    pub chain_id: String,
}

impl fmt::Display for ChainNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain not found: {}", self.chain_id)
    }
}

impl std::error::Error for ChainNotFound {}

/// Errors that stop a run from continuing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The graph could not be scheduled.
    Graph(GraphValidationError),
    /// Writing run state failed.
    RunStore { details: String },
    /// A node output was written twice.
    OutputAlreadyRecorded { node_id: NodeId },
    /// A dispatched task was lost.
    Dispatch { details: String },
    /// The run does not exist.
    RunNotFound { execution_id: ExecutionId },
    /// The run already finished.
    RunAlreadyTerminal { execution_id: ExecutionId },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph(e) => write!(f, "graph error: {e}"),
            Self::RunStore { details } => write!(f, "run store error: {details}"),
            Self::OutputAlreadyRecorded { node_id } => {
                write!(f, "output for node {node_id} was already recorded")
            }
            Self::Dispatch { details } => write!(f, "node dispatch failed: {details}"),
            Self::RunNotFound { execution_id } => write!(f, "run not found: {execution_id}"),
            Self::RunAlreadyTerminal { execution_id } => {
                write!(f, "run already in terminal state: {execution_id}")
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<GraphValidationError> for ExecutionError {
    fn from(e: GraphValidationError) -> Self {
        Self::Graph(e)
    }
}

/// High-level workflow errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// The workflow graph failed validation.
    InvalidGraph {
        workflow_id: WorkflowId,
        error: GraphValidationError,
    },
    /// The workflow source failed.
    Source { details: String },
    /// The run failed to start, continue, or finish.
    Execution {
        workflow_id: WorkflowId,
        error: ExecutionError,
    },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::InvalidGraph { workflow_id, error } => {
                write!(f, "workflow {workflow_id} is invalid: {error}")
            }
            Self::Source { details } => write!(f, "workflow source error: {details}"),
            Self::Execution { workflow_id, error } => {
                write!(f, "execution failed for workflow {workflow_id}: {error}")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}
