//! Model-driven routing.
//!
//! The router asks a language model which of its output paths fit the input,
//! then runs the chains mapped to the chosen paths. Its output names the
//! chosen paths in `selectedPaths`, so edges leaving the router on those
//! ports stay active and the rest of the graph is pruned.
//!
//! Model calls cost money: every call is admitted by the usage governor
//! first, and a denial fails the node without calling the model.

use super::parse_config;
use crate::chain::{
    ChainCatalog, ChainDefinition, ChainExecutionEngine, ChainExecutionResult,
    ChainSelectionResult, ExecutionPlan, SelectedChain,
};
use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::{NodeId, NodeType};
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use async_trait::async_trait;
use chainweave_ai::{
    ModelBackend, PricingTable, RouteChoice, RouteDecision, RouteOption, build_routing_request,
    parse_decision,
};
use chainweave_usage::{Admission, AdmissionRequest, CredentialSource, UsageGovernor};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A path the router may select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPath {
    /// Path id; also the output port edges attach to.
    pub id: String,
    /// Label shown to the model.
    pub name: String,
    /// What the path is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Chain run when the path is selected. Defaults to the path id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

impl OutputPath {
    /// The chain this path runs.
    #[must_use]
    pub fn chain_id(&self) -> &str {
        self.chain_id.as_deref().unwrap_or(&self.id)
    }

    fn route_option(&self) -> RouteOption {
        RouteOption {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Router node configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiRouterConfig {
    /// Model to ask; the handler's default when absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Routing instructions prepended to the prompt.
    #[serde(default)]
    pub instructions: String,
    /// Candidate paths.
    pub output_paths: Vec<OutputPath>,
    /// Chains the paths map to.
    #[serde(default)]
    pub chains: Vec<ChainDefinition>,
    /// Let the model pick more than one path.
    #[serde(default, alias = "allowMultiple")]
    pub multi_path: bool,
    /// Run selected chains concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Ceiling for parallel chains.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Keep running chains after one fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Admission estimate in dollars; priced from the prompt when absent.
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    /// Completion token allowance.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Whose credentials pay for the call.
    #[serde(default)]
    pub credentials: CredentialSource,
    /// Paths chosen in test mode instead of asking the model.
    #[serde(default)]
    pub test_paths: Vec<String>,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_max_tokens() -> u32 {
    300
}

impl AiRouterConfig {
    /// Parses and checks a node config.
    ///
    /// # Errors
    ///
    /// Returns the reason the config is unusable.
    pub fn parse(config: &JsonValue) -> Result<Self, String> {
        let config: Self = parse_config(config)?;
        if config.output_paths.is_empty() {
            return Err("at least one output path is required".to_string());
        }
        let mut seen = HashSet::new();
        for path in &config.output_paths {
            if path.id.is_empty() {
                return Err("output path ids must not be empty".to_string());
            }
            if !seen.insert(path.id.as_str()) {
                return Err(format!("duplicate output path {:?}", path.id));
            }
        }
        let mut chain_ids = HashSet::new();
        for chain in &config.chains {
            if !chain_ids.insert(chain.id.as_str()) {
                return Err(format!("duplicate chain {:?}", chain.id));
            }
        }
        if config.estimated_cost.is_some_and(|cost| !cost.is_finite() || cost < 0.0) {
            return Err("estimatedCost must be a non-negative number".to_string());
        }
        Ok(config)
    }

    fn options(&self) -> Vec<RouteOption> {
        self.output_paths.iter().map(OutputPath::route_option).collect()
    }

    fn path(&self, id: &str) -> Option<&OutputPath> {
        self.output_paths.iter().find(|path| path.id == id)
    }

    fn catalog(&self) -> ChainCatalog {
        let catalog = self
            .chains
            .iter()
            .cloned()
            .fold(ChainCatalog::new(), ChainCatalog::with_chain);
        self.output_paths
            .iter()
            .filter_map(|path| path.chain_id.as_ref().map(|chain| (&path.id, chain)))
            .fold(catalog, |catalog, (route, chain)| {
                catalog.with_route(route.clone(), chain.clone())
            })
    }

    fn plan(&self) -> ExecutionPlan {
        ExecutionPlan {
            parallel: self.parallel,
            max_concurrency: self.max_concurrency.max(1),
            continue_on_error: self.continue_on_error,
        }
    }

    /// The decision used in test mode.
    fn test_decision(&self) -> RouteDecision {
        let ids: Vec<&str> = if self.test_paths.is_empty() {
            self.output_paths.iter().take(1).map(|p| p.id.as_str()).collect()
        } else {
            self.test_paths.iter().map(String::as_str).collect()
        };
        let selected = ids
            .into_iter()
            .enumerate()
            .map(|(index, id)| RouteChoice {
                path_id: id.to_string(),
                reasoning: None,
                priority: u32::try_from(index).unwrap_or(u32::MAX),
                confidence: 1.0,
            })
            .collect();
        RouteDecision {
            selected,
            reasoning: Some("test mode".to_string()),
        }
    }

    fn selection(&self, decision: &RouteDecision) -> ChainSelectionResult {
        let selected_chains = decision
            .selected
            .iter()
            .filter_map(|choice| {
                self.path(&choice.path_id).map(|path| SelectedChain {
                    chain_id: path.chain_id().to_string(),
                    reasoning: choice.reasoning.clone(),
                    priority: choice.priority,
                    confidence: choice.confidence,
                })
            })
            .collect();
        let chosen: HashSet<&str> = decision.selected.iter().map(|c| c.path_id.as_str()).collect();
        let unselected_chains = self
            .output_paths
            .iter()
            .filter(|path| !chosen.contains(path.id.as_str()))
            .map(|path| path.chain_id().to_string())
            .collect();

        ChainSelectionResult {
            selected_chains,
            unselected_chains,
            execution_plan: self.plan(),
        }
    }
}

/// Executes `ai_router` nodes.
pub struct AiRouterHandler {
    backend: Arc<dyn ModelBackend>,
    governor: Arc<UsageGovernor>,
    pricing: PricingTable,
    default_model: String,
}

impl AiRouterHandler {
    /// Creates a router handler.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        governor: Arc<UsageGovernor>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            governor,
            pricing: PricingTable::standard(),
            default_model: default_model.into(),
        }
    }

    /// Replaces the pricing table.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Asks the model, under admission control.
    ///
    /// `Ok(Err(result))` is a final failure the node reports as is.
    async fn decide(
        &self,
        config: &AiRouterConfig,
        context: &ExecutionContext,
    ) -> Result<Result<(RouteDecision, f64), ActionResult>, NodeExecutionError> {
        let model = config.model.as_deref().unwrap_or(&self.default_model);
        let options = config.options();
        let request = build_routing_request(
            model,
            &config.instructions,
            &options,
            context.input(),
            config.multi_path,
            config.max_tokens,
        );
        let estimate = config
            .estimated_cost
            .unwrap_or_else(|| self.pricing.estimate(model, &request.prompt, config.max_tokens));

        let admission = self
            .governor
            .check_admission(
                &AdmissionRequest::new(context.user_id, estimate)
                    .with_credentials(config.credentials),
            )
            .await
            .map_err(|report| NodeExecutionError::ExternalService {
                service: "usage governor".to_string(),
                message: report.to_string(),
            })?;
        let ticket = match admission {
            Admission::Allowed(ticket) => ticket,
            Admission::Denied(denial) => {
                return Ok(Err(ActionResult::failure(denial.to_string())
                    .with_output(json!({ "usageLimitExceeded": denial }))));
            }
        };

        debug!(model, backend = self.backend.name(), estimate, "Requesting route decision");
        let response = self.backend.complete(&request).await.map_err(|e| {
            NodeExecutionError::ExternalService {
                service: self.backend.name().to_string(),
                message: e.to_string(),
            }
        })?;
        let cost = self.pricing.cost(&response.model, &response.usage);
        if let Err(report) = self.governor.settle(&ticket, cost).await {
            warn!(error = %report, cost, "Failed to settle router cost");
        }

        let decision = match parse_decision(&response.content, &options, config.multi_path) {
            Ok(decision) => decision,
            Err(e) => return Ok(Err(ActionResult::failure(e.to_string()).with_cost(cost))),
        };
        Ok(Ok((decision, cost)))
    }
}

impl fmt::Debug for AiRouterHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiRouterHandler")
            .field("backend", &self.backend.name())
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeHandler for AiRouterHandler {
    fn node_type(&self) -> NodeType {
        NodeType::AiRouter
    }

    fn validate_config(&self, config: &JsonValue, registry: &NodeRegistry) -> Result<(), String> {
        let config = AiRouterConfig::parse(config)?;
        for chain in &config.chains {
            let graph = chain
                .graph()
                .map_err(|e| format!("chain {}: {e}", chain.id))?;
            graph
                .validate_dispatchable(registry)
                .map_err(|e| format!("chain {}: {e}", chain.id))?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config = AiRouterConfig::parse(config)
            .map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;

        let (mut decision, cost) = if context.test_mode {
            (config.test_decision(), 0.0)
        } else {
            match self.decide(&config, context).await? {
                Ok(decided) => decided,
                Err(failure) => return Ok(failure),
            }
        };

        decision.selected.retain(|choice| {
            let known = config.path(&choice.path_id).is_some();
            if !known {
                warn!(path_id = %choice.path_id, "Ignoring unknown path selected by model");
            }
            known
        });
        if decision.selected.is_empty() {
            return Ok(ActionResult::failure("model selected no known path").with_cost(cost));
        }

        let selection = config.selection(&decision);
        let chain_execution = if config.chains.is_empty() {
            None
        } else if let Some(scheduler) = context.scheduler() {
            let node = context
                .current_node()
                .map_or_else(|| NodeType::AiRouter.to_string(), NodeId::to_string);
            // a retry must not collide with steps the failed attempt persisted
            let namespace = match context.attempt() {
                0 => node,
                attempt => format!("{node}#{attempt}"),
            };
            let engine = ChainExecutionEngine::new(scheduler.clone(), Arc::new(config.catalog()))
                .with_namespace(namespace);
            Some(engine.execute_chains(&selection, context).await)
        } else {
            warn!("No scheduler bound to the context; selected chains were not run");
            None
        };
        info!(
            selected = ?decision.path_ids(),
            chains = chain_execution.as_ref().map_or(0, |r| r.chains.len()),
            cost,
            "Route decided"
        );

        let message = chain_execution
            .as_ref()
            .and_then(|result| result.summary.clone());
        let chains_failed = chain_execution
            .as_ref()
            .is_some_and(|result| !result.all_succeeded());
        let output = json!({
            "selectedPaths": decision.path_ids(),
            "reasoning": decision.reasoning,
            "selection": selection,
            "chainExecution": chain_execution,
            "cost": cost,
        });

        let mut result = if chains_failed && !config.continue_on_error {
            ActionResult::failure(failed_chain_text(chain_execution.as_ref())).with_output(output)
        } else {
            ActionResult::ok(output)
        }
        .with_cost(cost);
        if let Some(message) = message {
            result = result.with_message(message);
        }
        Ok(result)
    }
}

fn failed_chain_text(result: Option<&ChainExecutionResult>) -> String {
    result
        .and_then(|r| r.chains.iter().find(|c| c.error.is_some()))
        .map_or_else(
            || "chain execution failed".to_string(),
            |chain| {
                format!(
                    "chain {} failed: {}",
                    chain.chain_id,
                    chain.error.as_deref().unwrap_or("unknown error")
                )
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunRecord;
    use crate::node::Node;
    use crate::run_store::{InMemoryRunStore, RunStore};
    use crate::scheduler::Scheduler;
    use crate::testing::{Probe, ScriptedHandler};
    use chainweave_ai::{ModelError, StaticBackend, TokenUsage};
    use chainweave_core::{UserId, WorkflowId};
    use chainweave_usage::{InMemoryUsageStore, PlanTable, UsageStore};

    struct Fixture {
        backend: Arc<StaticBackend>,
        usage: Arc<InMemoryUsageStore>,
        handler: AiRouterHandler,
        context: ExecutionContext,
        store: Arc<InMemoryRunStore>,
        probe: Probe,
    }

    async fn fixture(backend: StaticBackend) -> Fixture {
        let backend = Arc::new(backend);
        let usage = Arc::new(InMemoryUsageStore::new());
        let governor = Arc::new(UsageGovernor::new(usage.clone(), PlanTable::standard()));
        let handler = AiRouterHandler::new(backend.clone(), governor, "gpt-4o-mini");

        let probe = Probe::default();
        let registry = NodeRegistry::new()
            .with_handler(ScriptedHandler::new(NodeType::SetFields, probe.clone()))
            .with_handler(ScriptedHandler::new(NodeType::Log, probe.clone()));
        let store = Arc::new(InMemoryRunStore::new());
        let run = RunRecord::start(WorkflowId::new(), UserId::new(), json!({}), false);
        store.create_run(&run).await.expect("create run");

        let mut context = ExecutionContext::new(run.id, run.workflow_id, run.user_id, json!({}))
            .for_node(NodeId::new("router"), json!({"ticket": "refund please"}));
        context.bind_scheduler(Scheduler::new(Arc::new(registry), store.clone()));

        Fixture {
            backend,
            usage,
            handler,
            context,
            store,
            probe,
        }
    }

    fn reply(content: &str) -> StaticBackend {
        StaticBackend::replying(
            content,
            TokenUsage {
                input_tokens: 1_000,
                output_tokens: 100,
            },
        )
    }

    fn config() -> JsonValue {
        json!({
            "instructions": "Route support tickets.",
            "outputPaths": [
                {"id": "refund", "name": "Refunds", "chainId": "refund-chain"},
                {"id": "billing", "name": "Billing"}
            ],
            "chains": [
                {"id": "refund-chain", "name": "Refund", "nodes": [
                    {"id": "r1", "type": "set_fields", "config": {"output": {"refunded": true}}}
                ]},
                {"id": "billing", "name": "Billing", "nodes": [
                    {"id": "b1", "type": "log", "config": {}}
                ]}
            ],
            "multiPath": true
        })
    }

    #[tokio::test]
    async fn denial_fails_without_calling_the_model() {
        let fx = fixture(reply(r#"{"selectedPaths": ["refund"]}"#)).await;
        let mut config = config();
        config["estimatedCost"] = json!(5.0);

        let result = fx.handler.execute(&config, &fx.context).await.expect("execute");

        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .is_some_and(|e| e.contains("usage limit exceeded"))
        );
        assert!(result.output.expect("output").get("usageLimitExceeded").is_some());
        assert_eq!(fx.backend.calls(), 0);
        assert_eq!(fx.probe.calls(&NodeId::new("r1")), 0);
    }

    #[tokio::test]
    async fn selected_paths_run_their_chains() {
        let fx = fixture(reply(
            r#"{"selectedPaths": [{"pathId": "refund", "priority": 0, "confidence": 0.9}], "reasoning": "asks for money back"}"#,
        ))
        .await;

        let result = fx.handler.execute(&config(), &fx.context).await.expect("execute");

        assert!(result.success, "{result:?}");
        assert_eq!(fx.backend.calls(), 1);
        let output = result.output.expect("output");
        assert_eq!(output["selectedPaths"], json!(["refund"]));
        assert_eq!(output["reasoning"], json!("asks for money back"));
        assert_eq!(output["selection"]["selectedChains"][0]["chainId"], json!("refund-chain"));
        assert_eq!(output["selection"]["unselectedChains"], json!(["billing"]));
        assert_eq!(output["chainExecution"]["summary"], json!("1/1 chains succeeded"));
        assert_eq!(
            output["chainExecution"]["chains"][0]["output"],
            json!({"refunded": true})
        );
        assert_eq!(fx.probe.calls(&NodeId::new("r1")), 1);
        assert_eq!(fx.probe.calls(&NodeId::new("b1")), 0);

        let steps = fx.store.list_steps(fx.context.execution_id).await.expect("steps");
        assert!(
            steps
                .iter()
                .any(|s| s.node_id == NodeId::new("router/refund-chain/r1"))
        );

        // gpt-4o-mini: 1000 * 0.15/M + 100 * 0.60/M
        let cost = result.cost.expect("cost");
        assert!((cost - 0.00021).abs() < 1e-12);
    }

    #[tokio::test]
    async fn retried_router_runs_chains_under_a_fresh_namespace() {
        let fx = fixture(reply(r#"{"selectedPaths": ["refund"]}"#)).await;

        let first = fx.handler.execute(&config(), &fx.context).await.expect("execute");
        let retry = fx
            .handler
            .execute(&config(), &fx.context.for_attempt(1))
            .await
            .expect("execute retry");

        assert!(first.success, "{first:?}");
        assert!(retry.success, "{retry:?}");
        let steps = fx.store.list_steps(fx.context.execution_id).await.expect("steps");
        let ids: Vec<&str> = steps.iter().map(|s| s.node_id.as_str()).collect();
        assert!(ids.contains(&"router/refund-chain/r1"));
        assert!(ids.contains(&"router#1/refund-chain/r1"));
    }

    #[tokio::test]
    async fn paths_sharing_a_chain_run_it_once() {
        let fx = fixture(reply(r#"{"selectedPaths": ["refund", "money-back"]}"#)).await;
        let mut config = config();
        config["outputPaths"]
            .as_array_mut()
            .expect("paths")
            .push(json!({"id": "money-back", "name": "Money back", "chainId": "refund-chain"}));

        let result = fx.handler.execute(&config, &fx.context).await.expect("execute");

        assert!(result.success, "{result:?}");
        let output = result.output.expect("output");
        assert_eq!(output["selectedPaths"], json!(["refund", "money-back"]));
        assert_eq!(output["chainExecution"]["summary"], json!("1/1 chains succeeded"));
        assert_eq!(fx.probe.calls(&NodeId::new("r1")), 1);
    }

    #[tokio::test]
    async fn admitted_calls_are_accounted() {
        let fx = fixture(reply(r#"{"selectedPaths": ["billing"]}"#)).await;
        let mut config = config();
        config["estimatedCost"] = json!(0.5);

        fx.handler.execute(&config, &fx.context).await.expect("execute");

        let daily = chainweave_usage::UsageWindow::Daily
            .key_at(chainweave_usage::BudgetScope::Plan, chrono::Utc::now());
        let record = fx
            .usage
            .get(fx.context.user_id, &daily)
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.execution_count, 1);
        assert!((record.cost_accrued - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mode_uses_test_paths_without_admission() {
        let mut fx = fixture(StaticBackend::failing(ModelError::Timeout)).await;
        fx.context = fx.context.clone().with_test_mode(true);
        let mut config = config();
        config["testPaths"] = json!(["billing"]);
        config["estimatedCost"] = json!(1_000.0);

        let result = fx.handler.execute(&config, &fx.context).await.expect("execute");

        assert!(result.success);
        assert_eq!(fx.backend.calls(), 0);
        assert_eq!(result.output.expect("output")["selectedPaths"], json!(["billing"]));
        assert_eq!(fx.probe.calls(&NodeId::new("b1")), 1);
    }

    #[tokio::test]
    async fn model_errors_are_transient() {
        let fx = fixture(StaticBackend::failing(ModelError::Timeout)).await;
        let result = fx.handler.execute(&config(), &fx.context).await;
        assert!(matches!(
            result,
            Err(NodeExecutionError::ExternalService { .. })
        ));
    }

    #[tokio::test]
    async fn unparseable_reply_is_a_final_failure() {
        let fx = fixture(reply("I think refunds?")).await;
        let result = fx.handler.execute(&config(), &fx.context).await.expect("execute");
        assert!(!result.success);
        assert!(result.cost.is_some());
    }

    #[tokio::test]
    async fn unknown_paths_only_fail_the_node() {
        let fx = fixture(reply(r#"{"selectedPaths": ["shipping"]}"#)).await;
        let result = fx.handler.execute(&config(), &fx.context).await.expect("execute");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("model selected no known path"));
    }

    #[test]
    fn validation_checks_paths_and_chain_nodes() {
        let registry = NodeRegistry::new()
            .with_handler(ScriptedHandler::new(NodeType::SetFields, Probe::default()));
        let handler = AiRouterHandler::new(
            Arc::new(reply("{}")),
            Arc::new(UsageGovernor::new(
                Arc::new(InMemoryUsageStore::new()),
                PlanTable::standard(),
            )),
            "gpt-4o-mini",
        );

        assert!(handler.validate_config(&json!({"outputPaths": []}), &registry).is_err());
        assert!(
            handler
                .validate_config(
                    &json!({"outputPaths": [{"id": "a", "name": "A"}, {"id": "a", "name": "B"}]}),
                    &registry
                )
                .is_err()
        );
        // `log` has no handler in this registry
        assert!(handler.validate_config(&config(), &registry).is_err());

        let only_refund = json!({
            "outputPaths": [{"id": "refund", "name": "Refunds"}],
            "chains": [{"id": "refund", "name": "Refund", "nodes": [
                Node::new("r1", NodeType::SetFields)
            ]}]
        });
        assert!(handler.validate_config(&only_refund, &registry).is_ok());
    }
}
