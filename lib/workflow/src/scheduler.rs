//! DAG scheduler.
//!
//! The scheduler runs the execution loop for one graph:
//! 1. Ask the frontier which nodes are ready or skipped
//! 2. Persist their new status
//! 3. Dispatch ready nodes up to the concurrency ceiling
//! 4. Wait for any node to finish, persist its terminal status, record its output
//! 5. Repeat until nothing is running and nothing more can be decided
//!
//! Each handler call runs in its own task under a timeout, so a panicking or
//! hung handler fails its node without taking the run down.

use crate::context::ExecutionContext;
use crate::definition::WorkflowSettings;
use crate::error::{ExecutionError, NodeExecutionError, TimeoutError};
use crate::execution::{NodeResult, NodeStatus, RunStatus};
use crate::frontier::Frontier;
use crate::graph::WorkflowGraph;
use crate::node::{Node, NodeId};
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use crate::run_store::RunStore;
use chainweave_core::ExecutionId;
use rootcause::prelude::Report;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Scheduler defaults, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerSettings {
    /// Maximum nodes executing at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-node timeout.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Retries for handler errors and timeouts.
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay between retries; attempt `n` waits `n` times this.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Whether a failed node lets its downstream nodes run.
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_node_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_ms() -> u64 {
    250
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            node_timeout_ms: default_node_timeout_ms(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            continue_on_error: false,
        }
    }
}

impl SchedulerSettings {
    /// Run options for these defaults.
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_concurrency: self.max_concurrency.max(1),
            node_timeout: Duration::from_millis(self.node_timeout_ms),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            continue_on_error: self.continue_on_error,
            step_namespace: None,
        }
    }
}

/// Options for one scheduled graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum nodes executing at once. Never below one.
    pub max_concurrency: usize,
    /// Default per-node timeout.
    pub node_timeout: Duration,
    /// Default retry budget.
    pub max_retries: u32,
    /// Base retry delay.
    pub retry_backoff: Duration,
    /// Default failure policy.
    pub continue_on_error: bool,
    /// Prefix for persisted step ids, so nested graphs sharing a run do not
    /// collide with the outer graph.
    pub step_namespace: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        SchedulerSettings::default().run_options()
    }
}

impl RunOptions {
    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the default failure policy.
    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Sets the default per-node timeout.
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Sets the default retry budget and base delay.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Sets the persisted step prefix.
    #[must_use]
    pub fn with_step_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.step_namespace = Some(namespace.into());
        self
    }

    /// Applies a workflow's stored overrides.
    #[must_use]
    pub fn apply(mut self, settings: &WorkflowSettings) -> Self {
        if let Some(max_concurrency) = settings.max_concurrency {
            self = self.with_max_concurrency(max_concurrency);
        }
        if let Some(timeout_ms) = settings.node_timeout_ms {
            self.node_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(max_retries) = settings.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(continue_on_error) = settings.continue_on_error {
            self.continue_on_error = continue_on_error;
        }
        self
    }

    fn bypasses_failure(&self, node: &Node) -> bool {
        node.continue_on_error.unwrap_or(self.continue_on_error)
    }
}

/// The outcome of one scheduled graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// The run the graph belonged to.
    pub execution_id: ExecutionId,
    /// Overall status.
    pub status: RunStatus,
    /// Node results in the order they became terminal.
    pub results: Vec<NodeResult>,
    /// Outputs of every succeeded node.
    pub outputs: HashMap<NodeId, JsonValue>,
}

impl RunResult {
    /// The result for a node.
    #[must_use]
    pub fn result(&self, node_id: &NodeId) -> Option<&NodeResult> {
        self.results.iter().find(|r| &r.node_id == node_id)
    }

    /// The status of a node.
    #[must_use]
    pub fn status_of(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.result(node_id).map(|r| r.status)
    }

    /// Failed node results.
    pub fn failures(&self) -> impl Iterator<Item = &NodeResult> {
        self.results
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
    }
}

/// Schedules graphs against a handler registry, persisting through a run store.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn RunStore>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn RunStore>) -> Self {
        Self { registry, store }
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The run store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Runs a graph to completion.
    ///
    /// Node failures are recorded on the nodes; they only make this return
    /// an error when the run store cannot record them.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle or the run store fails.
    pub async fn run(
        &self,
        graph: Arc<WorkflowGraph>,
        context: ExecutionContext,
        options: &RunOptions,
    ) -> Result<RunResult, Report<ExecutionError>> {
        self.drive(graph, context, options, Vec::new()).await
    }

    /// Continues a run from its persisted steps.
    ///
    /// Terminal steps are replayed into the frontier and context; every other
    /// node is scheduled again.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle or the run store fails.
    pub async fn resume(
        &self,
        graph: Arc<WorkflowGraph>,
        context: ExecutionContext,
        options: &RunOptions,
        prior: Vec<NodeResult>,
    ) -> Result<RunResult, Report<ExecutionError>> {
        self.drive(graph, context, options, prior).await
    }

    #[instrument(
        skip_all,
        fields(
            execution_id = %context.execution_id,
            nodes = graph.node_count(),
            max_concurrency = options.max_concurrency,
        )
    )]
    async fn drive(
        &self,
        graph: Arc<WorkflowGraph>,
        mut context: ExecutionContext,
        options: &RunOptions,
        prior: Vec<NodeResult>,
    ) -> Result<RunResult, Report<ExecutionError>> {
        context.bind_scheduler(self.clone());
        let mut frontier = Frontier::from_graph(&graph).map_err(ExecutionError::from)?;
        let mut results: HashMap<NodeId, NodeResult> = HashMap::new();
        let mut finished: Vec<NodeId> = Vec::new();

        for step in prior {
            let Some(node) = graph.get_node(&step.node_id) else {
                continue;
            };
            if !step.status.is_terminal() {
                continue;
            }
            frontier.restore(
                &step.node_id,
                step.status,
                step.output.as_ref(),
                options.bypasses_failure(node),
            );
            if let (NodeStatus::Success, Some(output)) = (step.status, &step.output) {
                context.record_output(step.node_id.clone(), output.clone())?;
            }
            finished.push(step.node_id.clone());
            results.insert(step.node_id.clone(), step);
        }
        if !finished.is_empty() {
            info!(restored = finished.len(), "Resuming run from persisted steps");
        }

        let ceiling = options.max_concurrency.max(1);
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut in_flight: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            let advance = frontier.advance();
            for (node_id, reason) in advance.skipped {
                debug!(node_id = %node_id, reason = %reason, "Skipping node");
                let step = NodeResult::skipped(node_id.clone(), reason);
                self.persist(&context, options, &step).await?;
                results.insert(node_id.clone(), step);
                finished.push(node_id);
            }
            for node_id in advance.ready {
                let input = node_input(&graph, &frontier, &context, &node_id);
                let step = NodeResult::pending(node_id.clone(), input);
                self.persist(&context, options, &step).await?;
                results.insert(node_id.clone(), step);
                queue.push_back(node_id);
            }

            let mut settled_inline = false;
            while in_flight.len() < ceiling {
                let Some(node_id) = queue.pop_front() else {
                    break;
                };
                let (Some(node), Some(step)) = (graph.get_node(&node_id), results.get_mut(&node_id))
                else {
                    continue;
                };

                step.start();
                if node.is_trigger_node() && context.skip_triggers {
                    let payload = context.trigger_payload.clone();
                    step.succeed(
                        payload.clone(),
                        None,
                        Some("trigger skipped; payload used as output".to_string()),
                    );
                    self.persist(&context, options, step).await?;
                    context.record_output(node_id.clone(), payload.clone())?;
                    frontier.mark_succeeded(&node_id, &payload);
                    finished.push(node_id);
                    settled_inline = true;
                    continue;
                }

                self.persist(&context, options, step).await?;
                frontier.mark_running(&node_id);
                let input = step.input.clone().unwrap_or(JsonValue::Null);
                let task = NodeTask {
                    handler: self.registry.get(node.node_type),
                    context: Arc::new(context.for_node(node_id.clone(), input)),
                    timeout: node
                        .timeout_ms
                        .map_or(options.node_timeout, Duration::from_millis),
                    max_retries: node.max_retries.unwrap_or(options.max_retries),
                    backoff: options.retry_backoff,
                    node: node.clone(),
                };
                debug!(node_id = %node_id, node_type = %node.node_type, "Dispatching node");
                in_flight.spawn(task.run());
            }
            if settled_inline {
                continue;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| ExecutionError::Dispatch {
                details: e.to_string(),
            })?;

            let node_id = outcome.node_id.clone();
            let Some(step) = results.get_mut(&node_id) else {
                continue;
            };
            step.retry_count = outcome.retries;
            match outcome.verdict {
                Verdict::Succeeded(action) => {
                    let output = action.output.unwrap_or(JsonValue::Null);
                    step.succeed(output.clone(), action.cost, action.message);
                    self.persist(&context, options, step).await?;
                    context.record_output(node_id.clone(), output.clone())?;
                    frontier.mark_succeeded(&node_id, &output);
                    debug!(node_id = %node_id, "Node succeeded");
                }
                Verdict::Failed { error, cost } => {
                    let bypassed = graph
                        .get_node(&node_id)
                        .is_some_and(|node| options.bypasses_failure(node));
                    warn!(node_id = %node_id, error = %error, bypassed, "Node failed");
                    step.fail(error, cost);
                    self.persist(&context, options, step).await?;
                    frontier.mark_failed(&node_id, bypassed);
                }
            }
            finished.push(node_id);
        }

        let status = frontier.outcome();
        info!(status = status.as_str(), "Graph finished");
        let results = finished
            .iter()
            .filter_map(|node_id| results.remove(node_id))
            .collect();

        Ok(RunResult {
            execution_id: context.execution_id,
            status,
            results,
            outputs: context.node_outputs().clone(),
        })
    }

    async fn persist(
        &self,
        context: &ExecutionContext,
        options: &RunOptions,
        step: &NodeResult,
    ) -> Result<(), Report<ExecutionError>> {
        let step = match &options.step_namespace {
            Some(namespace) => {
                let mut namespaced = step.clone();
                namespaced.node_id = NodeId::new(format!("{namespace}/{}", step.node_id));
                Cow::Owned(namespaced)
            }
            None => Cow::Borrowed(step),
        };
        self.store
            .record_step(context.execution_id, &step)
            .await
            .map_err(|e| ExecutionError::RunStore {
                details: e.to_string(),
            })?;
        Ok(())
    }
}

/// Input for a node about to be dispatched.
///
/// Entry nodes receive the context input (the trigger payload for a top-level
/// run). A node with one active upstream node receives that node's output; a
/// join receives an object keyed by upstream node id.
fn node_input(
    graph: &WorkflowGraph,
    frontier: &Frontier,
    context: &ExecutionContext,
    node_id: &NodeId,
) -> JsonValue {
    if graph.predecessors(node_id).is_empty() {
        return if context.input().is_null() {
            context.trigger_payload.clone()
        } else {
            context.input().clone()
        };
    }

    let sources = frontier.active_sources(node_id);
    match sources.as_slice() {
        [only] => context.output(only).cloned().unwrap_or(JsonValue::Null),
        many => {
            let merged: Map<String, JsonValue> = many
                .iter()
                .map(|source| {
                    (
                        source.to_string(),
                        context.output(source).cloned().unwrap_or(JsonValue::Null),
                    )
                })
                .collect();
            JsonValue::Object(merged)
        }
    }
}

enum Verdict {
    Succeeded(ActionResult),
    Failed { error: String, cost: Option<f64> },
}

struct NodeOutcome {
    node_id: NodeId,
    retries: u32,
    verdict: Verdict,
}

enum Attempt {
    Finished(ActionResult),
    Errored(String),
}

/// One dispatched node: retries, timeout, and panic isolation around a handler.
struct NodeTask {
    node: Node,
    handler: Option<Arc<dyn NodeHandler>>,
    context: Arc<ExecutionContext>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl NodeTask {
    async fn run(self) -> NodeOutcome {
        let node_id = self.node.id.clone();
        let Some(handler) = self.handler.clone() else {
            return NodeOutcome {
                node_id,
                retries: 0,
                verdict: Verdict::Failed {
                    error: NodeExecutionError::UnsupportedNodeType {
                        node_type: self.node.node_type,
                    }
                    .to_string(),
                    cost: None,
                },
            };
        };

        let mut retries = 0;
        loop {
            match self.attempt(&handler, retries).await {
                Attempt::Finished(action) if action.success => {
                    return NodeOutcome {
                        node_id,
                        retries,
                        verdict: Verdict::Succeeded(action),
                    };
                }
                // an explicit failure is the handler's final answer
                Attempt::Finished(action) => {
                    return NodeOutcome {
                        node_id,
                        retries,
                        verdict: Verdict::Failed {
                            error: action.failure_text(),
                            cost: action.cost,
                        },
                    };
                }
                Attempt::Errored(error) if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        node_id = %node_id,
                        attempt = retries,
                        error = %error,
                        "Node attempt failed, retrying"
                    );
                    tokio::time::sleep(self.backoff * retries).await;
                }
                Attempt::Errored(error) => {
                    return NodeOutcome {
                        node_id,
                        retries,
                        verdict: Verdict::Failed { error, cost: None },
                    };
                }
            }
        }
    }

    async fn attempt(&self, handler: &Arc<dyn NodeHandler>, retries: u32) -> Attempt {
        let handler = Arc::clone(handler);
        let config = self.node.config.clone();
        let context = if retries == 0 {
            Arc::clone(&self.context)
        } else {
            Arc::new(self.context.for_attempt(retries))
        };
        let mut call = tokio::spawn(async move { handler.execute(&config, &context).await });

        match tokio::time::timeout(self.timeout, &mut call).await {
            Ok(Ok(Ok(action))) => Attempt::Finished(action),
            Ok(Ok(Err(error))) => Attempt::Errored(error.to_string()),
            Ok(Err(join_error)) if join_error.is_panic() => {
                Attempt::Errored(format!("node handler panicked: {join_error}"))
            }
            Ok(Err(join_error)) => Attempt::Errored(format!("node handler aborted: {join_error}")),
            Err(_) => {
                call.abort();
                Attempt::Errored(
                    TimeoutError {
                        node_id: self.node.id.clone(),
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    }
                    .to_string(),
                )
            }
        }
    }
}
