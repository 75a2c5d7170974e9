//! Workflow execution core for chainweave.
//!
//! This crate provides:
//!
//! - **Graph Model**: Nodes, edges and workflow definitions over a petgraph DAG,
//!   validated before anything runs
//! - **Registry**: Node handlers keyed by node type, plus the built-in handlers
//! - **Scheduler**: Concurrent dispatch of ready nodes with timeouts, retries,
//!   edge activation, join semantics and write-through persistence
//! - **Chains**: Execution of the chains an AI router selects
//! - **Runs**: The run store seam and `execute_workflow`

pub mod chain;
pub mod context;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod executor;
pub mod frontier;
pub mod graph;
pub mod handlers;
pub mod node;
pub mod registry;
pub mod routing;
pub mod run_store;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use chain::{
    ChainCatalog, ChainDefinition, ChainExecutionEngine, ChainExecutionResult, ChainOutcome,
    ChainSelectionResult, ChainStatus, ExecutionPlan, SelectedChain,
};
pub use chainweave_usage::UsageLimitExceeded;
pub use context::ExecutionContext;
pub use definition::{WorkflowData, WorkflowDefinition, WorkflowSettings};
pub use edge::Edge;
pub use error::{
    ChainNotFound, ExecutionError, GraphValidationError, NodeExecutionError, TimeoutError,
    WorkflowError,
};
pub use execution::{NodeResult, NodeStatus, RunRecord, RunStatus};
pub use executor::{
    ExecutionRequest, ExecutionResponse, InMemoryWorkflowSource, WebhookAck, WorkflowEngine,
    WorkflowSource, WorkflowSourceError,
};
pub use frontier::SkipReason;
pub use graph::WorkflowGraph;
pub use handlers::{AiRouterConfig, AiRouterHandler, OutputPath};
pub use node::{Node, NodeCategory, NodeId, NodeType};
pub use registry::{ActionResult, NodeHandler, NodeRegistry};
pub use routing::Activation;
pub use run_store::{InMemoryRunStore, RunStore, RunStoreError};
pub use scheduler::{RunOptions, RunResult, Scheduler, SchedulerSettings};
