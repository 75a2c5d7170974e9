//! Wiring between configuration, stores, handlers and the workflow engine.

use crate::config::{EngineConfig, RunConfig};
use crate::db::{PgRunStore, PgUsageStore, PgWorkflowSource};
use crate::error::AppError;
use chainweave_ai::{ModelBackend, OpenAiCompatibleBackend};
use chainweave_core::UserId;
use chainweave_usage::{InMemoryUsageStore, UsageGovernor, UsageStore};
use chainweave_workflow::{
    AiRouterHandler, ExecutionRequest, ExecutionResponse, InMemoryRunStore,
    InMemoryWorkflowSource, NodeRegistry, RunStore, Scheduler, WorkflowDefinition, WorkflowEngine,
    WorkflowSource,
};
use rootcause::prelude::Report;
use serde_json::{Value as JsonValue, json};
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// A ready-to-run engine.
pub struct App {
    engine: WorkflowEngine,
    workflows: Option<PgWorkflowSource>,
}

impl App {
    /// Builds the engine from configuration.
    ///
    /// With a database URL, runs, usage and workflow graphs live in Postgres
    /// and migrations are applied first; otherwise everything is in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached or migrated, or if
    /// the model backend cannot be built.
    pub async fn connect(config: &EngineConfig) -> Result<Self, Report<AppError>> {
        let backend: Arc<dyn ModelBackend> = Arc::new(
            OpenAiCompatibleBackend::new(config.model.clone()).map_err(|e| AppError::Model {
                details: e.to_string(),
            })?,
        );

        let Some(database_url) = &config.database_url else {
            info!("No database configured; runs are kept in memory");
            return Ok(Self::in_memory(config, backend));
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.run.max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database {
                details: e.to_string(),
            })?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Database {
                details: e.to_string(),
            })?;

        let workflows = PgWorkflowSource::new(pool.clone());
        let engine = assemble(
            config,
            Arc::new(PgRunStore::new(pool.clone())),
            Arc::new(PgUsageStore::new(pool)),
            Arc::new(workflows.clone()),
            backend,
        );
        Ok(Self {
            engine,
            workflows: Some(workflows),
        })
    }

    /// Builds an engine that keeps everything in memory.
    pub fn in_memory(config: &EngineConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let engine = assemble(
            config,
            Arc::new(InMemoryRunStore::new()),
            Arc::new(InMemoryUsageStore::new()),
            Arc::new(InMemoryWorkflowSource::new()),
            backend,
        );
        Self {
            engine,
            workflows: None,
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Runs the workflow a run configuration points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be loaded or the workflow cannot
    /// be executed. Failed nodes are reported in the response instead.
    pub async fn execute(&self, run: &RunConfig) -> Result<ExecutionResponse, Report<AppError>> {
        let path = run.workflow_path.as_deref().ok_or(AppError::MissingWorkflow)?;
        let definition = load_definition(path)?;
        let payload = match &run.payload_path {
            Some(path) => load_payload(path)?,
            None => json!({}),
        };
        let user_id = resolve_user(run, &definition)?;

        if let Some(workflows) = &self.workflows
            && definition.data.is_some()
            && let Err(e) = workflows.save(&definition).await
        {
            warn!(workflow_id = %definition.id, error = %e, "Failed to store workflow definition");
        }

        let mut request = ExecutionRequest::new(user_id, payload)
            .with_test_mode(run.test_mode)
            .with_skip_triggers(run.skip_triggers);
        if let Some(trigger) = &run.trigger_node {
            request = request.with_trigger_node(trigger.as_str());
        }

        self.engine
            .execute(&definition, request)
            .await
            .map_err(|report| report.context(AppError::Execution))
    }
}

fn assemble(
    config: &EngineConfig,
    runs: Arc<dyn RunStore>,
    usage: Arc<dyn UsageStore>,
    workflows: Arc<dyn WorkflowSource>,
    backend: Arc<dyn ModelBackend>,
) -> WorkflowEngine {
    let governor = Arc::new(UsageGovernor::new(usage, config.governor.plan_table()));
    let registry = NodeRegistry::with_builtin_handlers().with_handler(AiRouterHandler::new(
        backend,
        governor,
        config.model.default_model.clone(),
    ));
    let scheduler = Scheduler::new(Arc::new(registry), runs);
    WorkflowEngine::new(scheduler, workflows).with_settings(config.scheduler.clone())
}

/// Reads a workflow definition file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a definition.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition, Report<AppError>> {
    let raw = read(path)?;
    let definition = serde_json::from_str(&raw).map_err(|e| AppError::Parse {
        path: path.to_path_buf(),
        details: e.to_string(),
    })?;
    Ok(definition)
}

/// Reads a JSON trigger payload file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not JSON.
pub fn load_payload(path: &Path) -> Result<JsonValue, Report<AppError>> {
    let raw = read(path)?;
    let payload = serde_json::from_str(&raw).map_err(|e| AppError::Parse {
        path: path.to_path_buf(),
        details: e.to_string(),
    })?;
    Ok(payload)
}

fn read(path: &Path) -> Result<String, AppError> {
    std::fs::read_to_string(path).map_err(|e| AppError::Read {
        path: path.to_path_buf(),
        details: e.to_string(),
    })
}

/// The configured user, else the workflow owner, else a fresh anonymous user.
fn resolve_user(run: &RunConfig, definition: &WorkflowDefinition) -> Result<UserId, AppError> {
    if let Some(value) = &run.user_id {
        return UserId::from_str(value).map_err(|_| AppError::InvalidUserId {
            value: value.clone(),
        });
    }
    Ok(definition.user_id.unwrap_or_else(|| {
        let user_id = UserId::new();
        warn!(%user_id, "No user configured; billing the run to a new user");
        user_id
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainweave_ai::{StaticBackend, TokenUsage};
    use chainweave_workflow::{NodeId, NodeStatus, RunStatus};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_json(value: &JsonValue) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(value.to_string().as_bytes()).expect("write temp file");
        file
    }

    fn app(reply: &str) -> App {
        let backend = StaticBackend::replying(
            reply,
            TokenUsage {
                input_tokens: 400,
                output_tokens: 40,
            },
        );
        App::in_memory(&EngineConfig::default(), Arc::new(backend))
    }

    fn run_config(workflow: &NamedTempFile, payload: Option<&NamedTempFile>) -> RunConfig {
        RunConfig {
            workflow_path: Some(workflow.path().to_path_buf()),
            payload_path: payload.map(|p| p.path().to_path_buf()),
            ..RunConfig::default()
        }
    }

    fn linear_workflow() -> JsonValue {
        json!({
            "id": chainweave_core::WorkflowId::new().as_ulid().to_string(),
            "name": "greet",
            "data": {
                "nodes": [
                    {"id": "start", "type": "manual_trigger"},
                    {"id": "tag", "type": "set_fields", "config": {"fields": {"greeted": true}}},
                    {"id": "log", "type": "log", "config": {"message": "greeting"}}
                ],
                "edges": [
                    {"id": "e1", "sourceNodeId": "start", "targetNodeId": "tag"},
                    {"id": "e2", "sourceNodeId": "tag", "targetNodeId": "log"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn runs_a_workflow_file_with_payload() {
        let workflow = write_json(&linear_workflow());
        let payload = write_json(&json!({"name": "Ada"}));
        let app = app("{}");

        let response = app
            .execute(&run_config(&workflow, Some(&payload)))
            .await
            .expect("execute");

        assert!(response.success);
        assert_eq!(response.status, RunStatus::Success);
        let tag = response
            .results
            .iter()
            .find(|r| r.node_id == NodeId::new("tag"))
            .expect("tag result");
        assert_eq!(tag.status, NodeStatus::Success);
        let output = tag.output.as_ref().expect("tag output");
        assert_eq!(output["name"], json!("Ada"));
        assert_eq!(output["greeted"], json!(true));
    }

    #[tokio::test]
    async fn routes_through_an_ai_router() {
        let workflow = write_json(&json!({
            "id": chainweave_core::WorkflowId::new().as_ulid().to_string(),
            "name": "support",
            "data": {
                "nodes": [
                    {"id": "start", "type": "manual_trigger"},
                    {"id": "router", "type": "ai_router", "config": {
                        "instructions": "Route support tickets.",
                        "outputPaths": [
                            {"id": "refund", "name": "Refunds"},
                            {"id": "other", "name": "Everything else"}
                        ],
                        "chains": [
                            {"id": "refund", "name": "Refund", "nodes": [
                                {"id": "mark", "type": "set_fields", "config": {"fields": {"refunded": true}}}
                            ]}
                        ]
                    }}
                ],
                "edges": [
                    {"id": "e1", "sourceNodeId": "start", "targetNodeId": "router"}
                ]
            }
        }));
        let payload = write_json(&json!({"ticket": "I want my money back"}));
        let app = app(r#"{"selectedPaths": ["refund"], "reasoning": "refund request"}"#);

        let response = app
            .execute(&run_config(&workflow, Some(&payload)))
            .await
            .expect("execute");

        assert!(response.success, "{response:?}");
        let router = response
            .results
            .iter()
            .find(|r| r.node_id == NodeId::new("router"))
            .expect("router result");
        let output = router.output.as_ref().expect("router output");
        assert_eq!(output["selectedPaths"], json!(["refund"]));
        assert!(router.cost.is_some_and(|c| c > 0.0));

        let steps = app
            .engine()
            .scheduler()
            .store()
            .list_steps(response.execution_id)
            .await
            .expect("steps");
        assert!(
            steps
                .iter()
                .any(|s| s.node_id == NodeId::new("router/refund/mark")
                    && s.status == NodeStatus::Success)
        );
    }

    #[tokio::test]
    async fn missing_payload_defaults_to_empty_object() {
        let workflow = write_json(&linear_workflow());
        let response = app("{}").execute(&run_config(&workflow, None)).await.expect("execute");
        assert!(response.success);
    }

    #[tokio::test]
    async fn missing_workflow_path_is_an_error() {
        let err = app("{}")
            .execute(&RunConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), AppError::MissingWorkflow));
    }

    #[test]
    fn unreadable_definition_is_a_read_error() {
        let err = load_definition(Path::new("/nonexistent/flow.json")).unwrap_err();
        assert!(matches!(err.current_context(), AppError::Read { .. }));
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"{not json").expect("write temp file");
        let err = load_payload(file.path()).unwrap_err();
        assert!(matches!(err.current_context(), AppError::Parse { .. }));
    }

    #[test]
    fn configured_user_wins_over_owner() {
        let owner = UserId::new();
        let configured = UserId::new();
        let definition = WorkflowDefinition::new("w").with_user(owner);
        let run = RunConfig {
            user_id: Some(configured.to_string()),
            ..RunConfig::default()
        };
        assert_eq!(resolve_user(&run, &definition).expect("configured user"), configured);
        assert_eq!(
            resolve_user(&RunConfig::default(), &definition).expect("owner"),
            owner
        );
    }

    #[test]
    fn malformed_user_id_is_rejected() {
        let run = RunConfig {
            user_id: Some("nobody".to_string()),
            ..RunConfig::default()
        };
        let definition = WorkflowDefinition::new("w");
        assert!(matches!(
            resolve_user(&run, &definition),
            Err(AppError::InvalidUserId { .. })
        ));
    }
}
