//! Chain execution.
//!
//! An AI router picks one or more candidate chains; the chain engine runs
//! them under the router's execution plan:
//! - Sequential: ascending priority, stopping at the first failure unless
//!   `continueOnError` is set
//! - Parallel: at most `min(maxConcurrency, selected)` at once; one chain
//!   failing never cancels another
//!
//! Each chain is a small graph run by the same scheduler as the workflow,
//! under the same execution id.

use crate::context::ExecutionContext;
use crate::edge::Edge;
use crate::error::{ChainNotFound, GraphValidationError};
use crate::execution::RunStatus;
use crate::graph::WorkflowGraph;
use crate::node::Node;
use crate::scheduler::{RunOptions, RunResult, Scheduler};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A candidate chain an AI router may select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDefinition {
    /// Unique identifier within the router.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the chain does; shown to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The nodes, in execution order.
    pub nodes: Vec<Node>,
    /// Explicit edges. When empty the nodes run one after another.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
}

impl ChainDefinition {
    /// Creates a chain that runs `nodes` in order.
    #[must_use]
    pub fn sequence(id: impl Into<String>, name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            nodes,
            edges: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The chain's graph.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate node ids or dangling edges.
    pub fn graph(&self) -> Result<WorkflowGraph, GraphValidationError> {
        let edges = if self.edges.is_empty() {
            self.nodes
                .windows(2)
                .enumerate()
                .map(|(i, pair)| {
                    Edge::new(
                        format!("{}:{i}", self.id),
                        pair[0].id.clone(),
                        pair[1].id.clone(),
                    )
                })
                .collect()
        } else {
            self.edges.clone()
        };
        WorkflowGraph::from_parts(self.nodes.clone(), edges)
    }
}

/// Chains available to one router, and the route ids that map onto them.
#[derive(Debug, Clone, Default)]
pub struct ChainCatalog {
    chains: HashMap<String, ChainDefinition>,
    routes: HashMap<String, String>,
}

impl ChainCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chain.
    #[must_use]
    pub fn with_chain(mut self, chain: ChainDefinition) -> Self {
        self.chains.insert(chain.id.clone(), chain);
        self
    }

    /// Maps a route id onto a chain id.
    #[must_use]
    pub fn with_route(mut self, route_id: impl Into<String>, chain_id: impl Into<String>) -> Self {
        self.routes.insert(route_id.into(), chain_id.into());
        self
    }

    /// Looks up the chain for a selected id, following route mappings first.
    ///
    /// # Errors
    ///
    /// Returns [`ChainNotFound`] if neither a route nor a chain has this id.
    pub fn resolve(&self, id: &str) -> Result<&ChainDefinition, ChainNotFound> {
        let chain_id = self.routes.get(id).map_or(id, String::as_str);
        self.chains.get(chain_id).ok_or_else(|| ChainNotFound {
            chain_id: chain_id.to_string(),
        })
    }

    /// Returns true if the catalog holds no chains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// One chain the router selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedChain {
    /// The selected route or chain id.
    pub chain_id: String,
    /// Why it was selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Lower runs first in sequential plans.
    #[serde(default)]
    pub priority: u32,
    /// Model confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
}

/// How selected chains are run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Run chains concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Ceiling for parallel plans.
    #[serde(default = "one")]
    pub max_concurrency: usize,
    /// Keep running later chains after one fails (sequential plans only).
    #[serde(default)]
    pub continue_on_error: bool,
}

fn one() -> usize {
    1
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self {
            parallel: false,
            max_concurrency: 1,
            continue_on_error: false,
        }
    }
}

impl ExecutionPlan {
    /// Chains running at once for `selected` chains: one when sequential,
    /// otherwise `min(maxConcurrency, selected)`, never below one.
    #[must_use]
    pub fn effective_concurrency(&self, selected: usize) -> usize {
        if self.parallel {
            self.max_concurrency.min(selected).max(1)
        } else {
            1
        }
    }
}

/// The router's choice of chains.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSelectionResult {
    /// Chains to run.
    pub selected_chains: Vec<SelectedChain>,
    /// Candidate chains that were not selected.
    #[serde(default)]
    pub unselected_chains: Vec<String>,
    /// How to run the selected chains.
    #[serde(default)]
    pub execution_plan: ExecutionPlan,
}

/// Final status of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Every reached node succeeded.
    Success,
    /// A node failed.
    Failed,
}

/// The outcome of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainOutcome {
    /// The chain that ran.
    pub chain_id: String,
    /// How it ended.
    pub status: ChainStatus,
    /// Output of the chain's last node(s).
    pub output: JsonValue,
    /// The first node failure, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The merged outcome of every chain that ran.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainExecutionResult {
    /// Short aggregate such as `"1/2 chains succeeded"`; null when no chain ran.
    pub summary: Option<String>,
    /// Outcomes in execution order.
    pub chains: Vec<ChainOutcome>,
}

impl ChainExecutionResult {
    /// Returns true if every chain that ran succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.chains.iter().all(|c| c.status == ChainStatus::Success)
    }
}

/// Runs selected chains through the scheduler.
#[derive(Debug, Clone)]
pub struct ChainExecutionEngine {
    scheduler: Scheduler,
    catalog: Arc<ChainCatalog>,
    options: RunOptions,
    namespace: String,
}

impl ChainExecutionEngine {
    /// Creates an engine over a catalog.
    #[must_use]
    pub fn new(scheduler: Scheduler, catalog: Arc<ChainCatalog>) -> Self {
        Self {
            scheduler,
            catalog,
            options: RunOptions::default(),
            namespace: "chain".to_string(),
        }
    }

    /// Sets the options each chain's graph runs with.
    #[must_use]
    pub fn with_run_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the prefix persisted chain steps are stored under.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Runs the selected chains.
    ///
    /// Selected ids without a chain are logged and left out of the result.
    /// A chain selected through several ids runs once, at its best priority.
    #[instrument(
        skip_all,
        fields(
            execution_id = %parent.execution_id,
            selected = selection.selected_chains.len(),
            parallel = selection.execution_plan.parallel,
        )
    )]
    pub async fn execute_chains(
        &self,
        selection: &ChainSelectionResult,
        parent: &ExecutionContext,
    ) -> ChainExecutionResult {
        let mut runnable: Vec<(&SelectedChain, &ChainDefinition)> = Vec::new();
        for selected in &selection.selected_chains {
            match self.catalog.resolve(&selected.chain_id) {
                Ok(chain) => runnable.push((selected, chain)),
                Err(missing) => warn!(error = %missing, "Selected chain skipped"),
            }
        }
        runnable.sort_by_key(|(selected, _)| selected.priority);
        let mut seen = HashSet::new();
        runnable.retain(|&(selected, chain)| {
            let first = seen.insert(chain.id.as_str());
            if !first {
                debug!(
                    selected = %selected.chain_id,
                    chain_id = %chain.id,
                    "Chain already selected"
                );
            }
            first
        });
        if runnable.is_empty() {
            return ChainExecutionResult::default();
        }

        let total = runnable.len();
        let plan = &selection.execution_plan;
        let chains = if plan.parallel {
            let pending: Vec<_> = runnable
                .into_iter()
                .map(|(_, chain)| self.run_chain(chain, parent))
                .collect();
            futures::stream::iter(pending)
            .buffered(plan.effective_concurrency(total))
            .collect::<Vec<_>>()
            .await
        } else {
            let mut outcomes = Vec::with_capacity(total);
            for (_, chain) in runnable {
                let outcome = self.run_chain(chain, parent).await;
                let failed = outcome.status == ChainStatus::Failed;
                outcomes.push(outcome);
                if failed && !plan.continue_on_error {
                    info!(chain_id = %chain.id, "Chain failed, stopping remaining chains");
                    break;
                }
            }
            outcomes
        };

        let succeeded = chains
            .iter()
            .filter(|c| c.status == ChainStatus::Success)
            .count();
        ChainExecutionResult {
            summary: Some(format!("{succeeded}/{total} chains succeeded")),
            chains,
        }
    }

    async fn run_chain(&self, chain: &ChainDefinition, parent: &ExecutionContext) -> ChainOutcome {
        let graph = match chain.graph() {
            Ok(graph) => Arc::new(graph),
            Err(e) => return ChainOutcome::failed(&chain.id, e.to_string()),
        };
        let options = self
            .options
            .clone()
            .with_step_namespace(format!("{}/{}", self.namespace, chain.id));

        match self
            .scheduler
            .run(Arc::clone(&graph), parent.child(), &options)
            .await
        {
            Ok(run) => ChainOutcome::from_run(&chain.id, &graph, &run),
            Err(report) => ChainOutcome::failed(&chain.id, report.to_string()),
        }
    }
}

impl ChainOutcome {
    fn failed(chain_id: &str, error: String) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            status: ChainStatus::Failed,
            output: JsonValue::Null,
            error: Some(error),
        }
    }

    fn from_run(chain_id: &str, graph: &WorkflowGraph, run: &RunResult) -> Self {
        let sinks: Vec<_> = graph
            .terminal_nodes()
            .into_iter()
            .filter_map(|node| run.outputs.get(&node.id).map(|out| (node.id.clone(), out)))
            .collect();
        let output = match sinks.as_slice() {
            [] => JsonValue::Null,
            [(_, only)] => (*only).clone(),
            many => JsonValue::Object(
                many.iter()
                    .map(|(id, out)| (id.to_string(), (*out).clone()))
                    .collect::<Map<_, _>>(),
            ),
        };
        let error = run
            .failures()
            .next()
            .map(|failed| {
                format!(
                    "node {}: {}",
                    failed.node_id,
                    failed.error.as_deref().unwrap_or("failed")
                )
            });

        Self {
            chain_id: chain_id.to_string(),
            status: if run.status == RunStatus::Success {
                ChainStatus::Success
            } else {
                ChainStatus::Failed
            },
            output,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunRecord;
    use crate::node::{NodeId, NodeType};
    use crate::registry::NodeRegistry;
    use crate::run_store::{InMemoryRunStore, RunStore};
    use crate::testing::{Probe, ScriptedHandler};
    use chainweave_core::{UserId, WorkflowId};
    use serde_json::json;

    fn step(id: &str, config: JsonValue) -> Node {
        Node::new(id, NodeType::HttpRequest).with_config(config)
    }

    fn selected(chain_id: &str, priority: u32) -> SelectedChain {
        SelectedChain {
            chain_id: chain_id.to_string(),
            reasoning: None,
            priority,
            confidence: 0.9,
        }
    }

    async fn setup(catalog: ChainCatalog) -> (ChainExecutionEngine, ExecutionContext, Probe) {
        let probe = Probe::default();
        let registry = NodeRegistry::with_builtin_handlers()
            .with_handler(ScriptedHandler::new(NodeType::HttpRequest, probe.clone()));
        let store = Arc::new(InMemoryRunStore::new());
        let record = RunRecord::start(WorkflowId::new(), UserId::new(), json!({}), false);
        store.create_run(&record).await.expect("create run");

        let scheduler = Scheduler::new(Arc::new(registry), store);
        let context = ExecutionContext::new(record.id, record.workflow_id, record.user_id, json!({}))
            .for_node(NodeId::new("route"), json!({"ticket": 1}));
        (
            ChainExecutionEngine::new(scheduler, Arc::new(catalog)).with_namespace("route"),
            context,
            probe,
        )
    }

    #[test]
    fn sequence_links_nodes_in_order() {
        let chain = ChainDefinition::sequence(
            "x",
            "X",
            vec![step("a", json!({})), step("b", json!({})), step("c", json!({}))],
        );
        let graph = chain.graph().expect("graph");
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.entry_nodes()[0].id, NodeId::new("a"));
        assert_eq!(graph.terminal_nodes()[0].id, NodeId::new("c"));
    }

    #[test]
    fn effective_concurrency_rules() {
        let sequential = ExecutionPlan {
            parallel: false,
            max_concurrency: 4,
            continue_on_error: false,
        };
        assert_eq!(sequential.effective_concurrency(3), 1);

        let parallel = ExecutionPlan {
            parallel: true,
            max_concurrency: 4,
            continue_on_error: false,
        };
        assert_eq!(parallel.effective_concurrency(3), 3);
        assert_eq!(parallel.effective_concurrency(9), 4);

        let zero = ExecutionPlan {
            parallel: true,
            max_concurrency: 0,
            continue_on_error: false,
        };
        assert_eq!(zero.effective_concurrency(2), 1);
    }

    #[test]
    fn catalog_follows_routes() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence("refunds", "Refunds", vec![]))
            .with_route("billing", "refunds");

        assert_eq!(catalog.resolve("billing").map(|c| c.id.as_str()), Ok("refunds"));
        assert_eq!(catalog.resolve("refunds").map(|c| c.id.as_str()), Ok("refunds"));
        assert_eq!(
            catalog.resolve("tech").map(|c| c.id.clone()),
            Err(ChainNotFound {
                chain_id: "tech".to_string()
            })
        );
    }

    #[tokio::test]
    async fn sequential_failure_stops_later_chains() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence(
                "x",
                "X",
                vec![step("x1", json!({"fail": "x broke"}))],
            ))
            .with_chain(ChainDefinition::sequence("y", "Y", vec![step("y1", json!({}))]));
        let (engine, context, probe) = setup(catalog).await;

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("y", 1), selected("x", 0)],
            unselected_chains: vec![],
            execution_plan: ExecutionPlan::default(),
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("0/2 chains succeeded"));
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.chains[0].chain_id, "x");
        assert_eq!(result.chains[0].status, ChainStatus::Failed);
        assert_eq!(result.chains[0].error.as_deref(), Some("node x1: x broke"));
        assert_eq!(probe.calls(&NodeId::new("y1")), 0);
    }

    #[tokio::test]
    async fn continue_on_error_runs_later_chains() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence(
                "x",
                "X",
                vec![step("x1", json!({"fail": "x broke"}))],
            ))
            .with_chain(ChainDefinition::sequence(
                "y",
                "Y",
                vec![step("y1", json!({"output": "done"}))],
            ));
        let (engine, context, _) = setup(catalog).await;

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("x", 0), selected("y", 1)],
            unselected_chains: vec![],
            execution_plan: ExecutionPlan {
                continue_on_error: true,
                ..ExecutionPlan::default()
            },
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("1/2 chains succeeded"));
        assert_eq!(result.chains[1].output, json!("done"));
    }

    #[tokio::test]
    async fn parallel_chains_are_bounded_and_independent() {
        let mut catalog = ChainCatalog::new();
        let mut chosen = Vec::new();
        for i in 0..4 {
            let config = if i == 0 {
                json!({"delayMs": 20, "fail": "first failed"})
            } else {
                json!({"delayMs": 20})
            };
            catalog = catalog.with_chain(ChainDefinition::sequence(
                format!("c{i}"),
                format!("C{i}"),
                vec![step(&format!("n{i}"), config)],
            ));
            chosen.push(selected(&format!("c{i}"), i));
        }
        let (engine, context, probe) = setup(catalog).await;

        let selection = ChainSelectionResult {
            selected_chains: chosen,
            unselected_chains: vec![],
            execution_plan: ExecutionPlan {
                parallel: true,
                max_concurrency: 2,
                continue_on_error: false,
            },
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("3/4 chains succeeded"));
        assert_eq!(result.chains.len(), 4);
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn unknown_chains_are_skipped() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence("x", "X", vec![step("x1", json!({}))]));
        let (engine, context, _) = setup(catalog).await;

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("ghost", 0), selected("x", 1)],
            ..ChainSelectionResult::default()
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("1/1 chains succeeded"));
        assert_eq!(result.chains.len(), 1);
    }

    #[tokio::test]
    async fn chain_node_ids_may_repeat_outer_ids() {
        let catalog = ChainCatalog::new().with_chain(ChainDefinition::sequence(
            "x",
            "X",
            vec![
                step("a", json!({"output": "chain a"})),
                step("b", json!({"output": "chain b"})),
            ],
        ));
        let (engine, mut context, _) = setup(catalog).await;
        context
            .record_output(NodeId::new("a"), json!("outer a"))
            .expect("outer output");
        let store = Arc::clone(engine.scheduler.store());

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("x", 0)],
            ..ChainSelectionResult::default()
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("1/1 chains succeeded"));
        assert_eq!(result.chains[0].status, ChainStatus::Success);
        assert_eq!(result.chains[0].output, json!("chain b"));

        let steps = store.list_steps(context.execution_id).await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status.is_terminal()));
        let b = steps
            .iter()
            .find(|s| s.node_id == NodeId::new("route/x/b"))
            .expect("b");
        assert_eq!(b.input, Some(json!("chain a")));
    }

    #[tokio::test]
    async fn chain_selected_twice_runs_once() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence("x", "X", vec![step("x1", json!({}))]))
            .with_route("refund", "x")
            .with_route("complaint", "x");
        let (engine, context, probe) = setup(catalog).await;

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("complaint", 1), selected("refund", 0)],
            ..ChainSelectionResult::default()
        };
        let result = engine.execute_chains(&selection, &context).await;

        assert_eq!(result.summary.as_deref(), Some("1/1 chains succeeded"));
        assert_eq!(result.chains.len(), 1);
        assert_eq!(probe.calls(&NodeId::new("x1")), 1);
    }

    #[tokio::test]
    async fn nothing_selected_has_no_summary() {
        let (engine, context, _) = setup(ChainCatalog::new()).await;
        let result = engine
            .execute_chains(&ChainSelectionResult::default(), &context)
            .await;
        assert_eq!(result, ChainExecutionResult::default());
        assert!(result.summary.is_none());
    }

    #[tokio::test]
    async fn chain_entry_receives_router_input() {
        let catalog = ChainCatalog::new()
            .with_chain(ChainDefinition::sequence("x", "X", vec![step("x1", json!({}))]));
        let (engine, context, _) = setup(catalog).await;
        let store = Arc::clone(engine.scheduler.store());

        let selection = ChainSelectionResult {
            selected_chains: vec![selected("x", 0)],
            ..ChainSelectionResult::default()
        };
        engine.execute_chains(&selection, &context).await;

        let steps = store.list_steps(context.execution_id).await.expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node_id, NodeId::new("route/x/x1"));
        assert_eq!(steps[0].input, Some(json!({"ticket": 1})));
    }
}
