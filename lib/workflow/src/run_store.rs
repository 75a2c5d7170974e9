//! Run persistence.
//!
//! The scheduler writes every node status change through the store as it
//! happens: `pending`/`running` before the handler is spawned, the terminal
//! status before downstream nodes are released. An interrupted run can be
//! resumed from whatever the store holds.

use crate::execution::{NodeResult, RunRecord, RunStatus};
use crate::node::NodeId;
use async_trait::async_trait;
use chainweave_core::{ExecutionId, WorkflowId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;

/// Storage for runs and their node steps.
///
/// This abstraction lets the scheduler run against Postgres in production
/// and against memory in tests.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a run record.
    async fn create_run(&self, run: &RunRecord) -> Result<(), RunStoreError>;

    /// Inserts or updates the step for `step.node_id`.
    ///
    /// A step that is already terminal is never overwritten.
    async fn record_step(
        &self,
        execution_id: ExecutionId,
        step: &NodeResult,
    ) -> Result<(), RunStoreError>;

    /// Marks a run finished.
    async fn finish_run(
        &self,
        execution_id: ExecutionId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RunStoreError>;

    /// Loads a run record.
    async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>, RunStoreError>;

    /// Loads the steps of a run in the order they were first written.
    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<NodeResult>, RunStoreError>;

    /// Lists runs of a workflow, newest first.
    async fn list_runs(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, RunStoreError>;
}

/// Errors from run persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    /// The store could not be reached.
    Unavailable { details: String },
    /// The run does not exist.
    RunNotFound { execution_id: ExecutionId },
    /// A terminal step would have been overwritten.
    StepAlreadyTerminal {
        execution_id: ExecutionId,
        node_id: NodeId,
    },
    /// A query failed.
    QueryFailed { details: String },
    /// A stored row could not be decoded.
    Decode { details: String },
}

impl fmt::Display for RunStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "run store unavailable: {details}"),
            Self::RunNotFound { execution_id } => write!(f, "run not found: {execution_id}"),
            Self::StepAlreadyTerminal {
                execution_id,
                node_id,
            } => write!(
                f,
                "step {node_id} of run {execution_id} is already terminal"
            ),
            Self::QueryFailed { details } => write!(f, "run store query failed: {details}"),
            Self::Decode { details } => write!(f, "failed to decode run record: {details}"),
        }
    }
}

impl std::error::Error for RunStoreError {}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<ExecutionId, RunRecord>>,
    steps: Mutex<HashMap<ExecutionId, Vec<NodeResult>>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RunStoreError> {
        self.runs.lock().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn record_step(
        &self,
        execution_id: ExecutionId,
        step: &NodeResult,
    ) -> Result<(), RunStoreError> {
        if !self.runs.lock().await.contains_key(&execution_id) {
            return Err(RunStoreError::RunNotFound { execution_id });
        }

        let mut steps = self.steps.lock().await;
        let run_steps = steps.entry(execution_id).or_default();
        match run_steps.iter_mut().find(|s| s.node_id == step.node_id) {
            Some(existing) if existing.status.is_terminal() => {
                Err(RunStoreError::StepAlreadyTerminal {
                    execution_id,
                    node_id: step.node_id.clone(),
                })
            }
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => {
                run_steps.push(step.clone());
                Ok(())
            }
        }
    }

    async fn finish_run(
        &self,
        execution_id: ExecutionId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RunStoreError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(&execution_id)
            .ok_or(RunStoreError::RunNotFound { execution_id })?;
        run.finish(status, finished_at);
        Ok(())
    }

    async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>, RunStoreError> {
        Ok(self.runs.lock().await.get(&execution_id).cloned())
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<NodeResult>, RunStoreError> {
        Ok(self
            .steps
            .lock()
            .await
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_runs(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, RunStoreError> {
        let runs = self.runs.lock().await;
        let mut matching: Vec<RunRecord> = runs
            .values()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect();
        // execution ids are ULIDs, so they sort by start time
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
