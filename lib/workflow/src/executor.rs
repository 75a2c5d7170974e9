//! Workflow execution entry points.
//!
//! [`WorkflowEngine::execute_workflow`] takes a workflow from definition to
//! finished run:
//! 1. Resolve the graph (caller override, inline data, or the workflow source)
//! 2. Validate it and pick the trigger; nothing is persisted if this fails
//! 3. Create the run record
//! 4. Schedule the graph
//! 5. Record the final run status

use crate::context::ExecutionContext;
use crate::definition::{WorkflowData, WorkflowDefinition};
use crate::error::{ExecutionError, GraphValidationError, WorkflowError};
use crate::execution::{NodeResult, RunRecord, RunStatus};
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use crate::scheduler::{RunResult, Scheduler, SchedulerSettings};
use async_trait::async_trait;
use chainweave_core::{ExecutionId, UserId, WorkflowId};
use chrono::Utc;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

/// Where graphs are loaded from when a definition carries none.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// Loads the nodes and edges of a workflow.
    async fn load(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowData>, WorkflowSourceError>;
}

/// Errors from a workflow source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSourceError {
    /// The source could not be reached.
    Unavailable { details: String },
    /// Stored graph data could not be decoded.
    Decode { details: String },
}

impl fmt::Display for WorkflowSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "workflow source unavailable: {details}"),
            Self::Decode { details } => write!(f, "failed to decode workflow: {details}"),
        }
    }
}

impl std::error::Error for WorkflowSourceError {}

/// In-memory workflow source.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowSource {
    workflows: RwLock<HashMap<WorkflowId, WorkflowData>>,
}

impl InMemoryWorkflowSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores graph data for a workflow.
    pub async fn insert(&self, workflow_id: WorkflowId, data: WorkflowData) {
        self.workflows.write().await.insert(workflow_id, data);
    }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflowSource {
    async fn load(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowData>, WorkflowSourceError> {
        Ok(self.workflows.read().await.get(&workflow_id).cloned())
    }
}

/// One request to run a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Payload the trigger fired with.
    pub trigger_payload: JsonValue,
    /// Who the run is billed to.
    pub user_id: UserId,
    /// Simulate side effects.
    pub test_mode: bool,
    /// Graph data the caller already loaded; bypasses every other lookup.
    pub workflow_data_override: Option<WorkflowData>,
    /// Treat triggers as already fired.
    pub skip_triggers: bool,
    /// The trigger to start from, when the workflow has several.
    pub trigger_node: Option<NodeId>,
}

impl ExecutionRequest {
    /// A live run with a payload.
    #[must_use]
    pub fn new(user_id: UserId, trigger_payload: JsonValue) -> Self {
        Self {
            trigger_payload,
            user_id,
            test_mode: false,
            workflow_data_override: None,
            skip_triggers: false,
            trigger_node: None,
        }
    }

    /// Sets test mode.
    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Supplies graph data directly.
    #[must_use]
    pub fn with_workflow_data(mut self, data: WorkflowData) -> Self {
        self.workflow_data_override = Some(data);
        self
    }

    /// Sets whether triggers are bypassed.
    #[must_use]
    pub fn with_skip_triggers(mut self, skip_triggers: bool) -> Self {
        self.skip_triggers = skip_triggers;
        self
    }

    /// Names the trigger to start from.
    #[must_use]
    pub fn with_trigger_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.trigger_node = Some(node_id.into());
        self
    }
}

/// The answer to an execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    /// False only when the run failed.
    pub success: bool,
    /// The run.
    pub execution_id: ExecutionId,
    /// Final run status.
    pub status: RunStatus,
    /// Node results in the order they finished.
    pub results: Vec<NodeResult>,
}

impl ExecutionResponse {
    fn from_run(run: RunResult) -> Self {
        Self {
            success: run.status != RunStatus::Failed,
            execution_id: run.execution_id,
            status: run.status,
            results: run.results,
        }
    }
}

/// Acknowledgement returned to webhook callers.
///
/// Always successful, so that providers do not retry deliveries; the real
/// outcome lives in the run store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    /// Always true.
    pub success: bool,
    /// The run started for the delivery, if one was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

/// Runs workflows end to end.
#[derive(Clone)]
pub struct WorkflowEngine {
    scheduler: Scheduler,
    workflows: Arc<dyn WorkflowSource>,
    settings: SchedulerSettings,
}

impl WorkflowEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(scheduler: Scheduler, workflows: Arc<dyn WorkflowSource>) -> Self {
        Self {
            scheduler,
            workflows,
            settings: SchedulerSettings::default(),
        }
    }

    /// Sets the scheduler defaults.
    #[must_use]
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The scheduler runs are executed on.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs a workflow once.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be found or is invalid (no run is
    /// created), or if the run store fails during the run. Node failures are
    /// not errors; they are reported in the response.
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        trigger_payload: JsonValue,
        user_id: UserId,
        test_mode: bool,
        workflow_data_override: Option<WorkflowData>,
        skip_triggers: bool,
    ) -> Result<ExecutionResponse, Report<WorkflowError>> {
        let mut request = ExecutionRequest::new(user_id, trigger_payload)
            .with_test_mode(test_mode)
            .with_skip_triggers(skip_triggers);
        request.workflow_data_override = workflow_data_override;
        self.execute(definition, request).await
    }

    /// Runs a workflow for an [`ExecutionRequest`].
    ///
    /// # Errors
    ///
    /// See [`Self::execute_workflow`].
    #[instrument(skip_all, fields(workflow_id = %definition.id, user_id = %request.user_id, test_mode = request.test_mode))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        request: ExecutionRequest,
    ) -> Result<ExecutionResponse, Report<WorkflowError>> {
        let data = self
            .resolve_data(definition, request.workflow_data_override)
            .await?;
        let graph = self.prepare_graph(definition.id, &data, request.trigger_node.as_ref())?;

        let run = RunRecord::start(
            definition.id,
            request.user_id,
            request.trigger_payload.clone(),
            request.test_mode,
        );
        self.scheduler
            .store()
            .create_run(&run)
            .await
            .map_err(|e| execution_error(definition.id, ExecutionError::RunStore { details: e.to_string() }))?;
        info!(execution_id = %run.id, nodes = graph.node_count(), "Run started");

        let context = ExecutionContext::new(run.id, definition.id, request.user_id, request.trigger_payload)
            .with_test_mode(request.test_mode)
            .with_skip_triggers(request.skip_triggers)
            .with_variables(definition.variables.clone());
        let options = self.settings.run_options().apply(&definition.settings);

        let result = self.scheduler.run(Arc::new(graph), context, &options).await;
        self.finish(definition.id, run.id, result).await
    }

    /// Runs a workflow for a webhook delivery.
    ///
    /// Whatever happens, the caller gets `success: true`; failures are logged
    /// and recorded on the run.
    pub async fn execute_webhook(
        &self,
        definition: &WorkflowDefinition,
        request: ExecutionRequest,
    ) -> WebhookAck {
        match self.execute(definition, request).await {
            Ok(response) => {
                if !response.success {
                    warn!(
                        workflow_id = %definition.id,
                        execution_id = %response.execution_id,
                        status = response.status.as_str(),
                        "Webhook run did not succeed"
                    );
                }
                WebhookAck {
                    success: true,
                    execution_id: Some(response.execution_id),
                }
            }
            Err(report) => {
                error!(workflow_id = %definition.id, error = %report, "Webhook run could not be executed");
                WebhookAck {
                    success: true,
                    execution_id: None,
                }
            }
        }
    }

    /// Continues an interrupted run.
    ///
    /// Nodes with a terminal step keep it; every other node is scheduled again.
    ///
    /// # Errors
    ///
    /// Returns an error if the run does not exist or already finished, if the
    /// graph cannot be resolved, or if the run store fails.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id))]
    pub async fn resume_execution(
        &self,
        definition: &WorkflowDefinition,
        execution_id: ExecutionId,
    ) -> Result<ExecutionResponse, Report<WorkflowError>> {
        let store = self.scheduler.store();
        let store_error = |e: &dyn fmt::Display| {
            execution_error(definition.id, ExecutionError::RunStore { details: e.to_string() })
        };
        let run = store
            .get_run(execution_id)
            .await
            .map_err(|e| store_error(&e))?
            .ok_or_else(|| execution_error(definition.id, ExecutionError::RunNotFound { execution_id }))?;
        if run.status.is_terminal() {
            return Err(execution_error(
                definition.id,
                ExecutionError::RunAlreadyTerminal { execution_id },
            )
            .into());
        }

        let prior = store.list_steps(execution_id).await.map_err(|e| store_error(&e))?;
        let data = self.resolve_data(definition, None).await?;
        let full = WorkflowGraph::from_data(&data).map_err(|e| invalid_graph(definition.id, e))?;
        // the run started from whichever trigger it recorded a step for
        let trigger = full
            .trigger_nodes()
            .into_iter()
            .find(|node| prior.iter().any(|step| step.node_id == node.id))
            .map(|node| node.id.clone());
        let graph = self.prepare_graph(definition.id, &data, trigger.as_ref())?;

        info!(execution_id = %execution_id, restored = prior.len(), "Resuming run");
        let context = ExecutionContext::new(run.id, run.workflow_id, run.user_id, run.trigger_payload)
            .with_test_mode(run.test_mode)
            .with_variables(definition.variables.clone());
        let options = self.settings.run_options().apply(&definition.settings);

        let result = self
            .scheduler
            .resume(Arc::new(graph), context, &options, prior)
            .await;
        self.finish(definition.id, execution_id, result).await
    }

    async fn resolve_data(
        &self,
        definition: &WorkflowDefinition,
        workflow_data_override: Option<WorkflowData>,
    ) -> Result<WorkflowData, Report<WorkflowError>> {
        if let Some(data) = workflow_data_override {
            return Ok(data);
        }
        if let Some(data) = &definition.data {
            return Ok(data.clone());
        }
        let loaded = self
            .workflows
            .load(definition.id)
            .await
            .map_err(|e| WorkflowError::Source { details: e.to_string() })?;
        loaded.ok_or_else(|| WorkflowError::NotFound { workflow_id: definition.id }.into())
    }

    fn prepare_graph(
        &self,
        workflow_id: WorkflowId,
        data: &WorkflowData,
        trigger: Option<&NodeId>,
    ) -> Result<WorkflowGraph, Report<WorkflowError>> {
        let graph = WorkflowGraph::from_data(data).map_err(|e| invalid_graph(workflow_id, e))?;
        graph
            .validate(self.scheduler.registry())
            .map_err(|e| invalid_graph(workflow_id, e))?;
        let trigger = graph
            .select_trigger(trigger)
            .map_err(|e| invalid_graph(workflow_id, e))?;
        Ok(graph.reachable_from(&trigger))
    }

    async fn finish(
        &self,
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        result: Result<RunResult, Report<ExecutionError>>,
    ) -> Result<ExecutionResponse, Report<WorkflowError>> {
        let store = self.scheduler.store();
        match result {
            Ok(run) => {
                store
                    .finish_run(execution_id, run.status, Utc::now())
                    .await
                    .map_err(|e| {
                        execution_error(workflow_id, ExecutionError::RunStore { details: e.to_string() })
                    })?;
                info!(execution_id = %execution_id, status = run.status.as_str(), "Run finished");
                Ok(ExecutionResponse::from_run(run))
            }
            Err(report) => {
                error!(execution_id = %execution_id, error = %report, "Run aborted");
                if let Err(e) = store
                    .finish_run(execution_id, RunStatus::Failed, Utc::now())
                    .await
                {
                    warn!(execution_id = %execution_id, error = %e, "Failed to mark aborted run failed");
                }
                let error = report.current_context().clone();
                Err(execution_error(workflow_id, error).into())
            }
        }
    }
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("scheduler", &self.scheduler)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn invalid_graph(workflow_id: WorkflowId, error: GraphValidationError) -> WorkflowError {
    WorkflowError::InvalidGraph { workflow_id, error }
}

fn execution_error(workflow_id: WorkflowId, error: ExecutionError) -> WorkflowError {
    WorkflowError::Execution { workflow_id, error }
}
