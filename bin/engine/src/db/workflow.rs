//! Workflow graph storage.

use async_trait::async_trait;
use chainweave_core::WorkflowId;
use chainweave_workflow::{
    Edge, Node, WorkflowData, WorkflowDefinition, WorkflowSource, WorkflowSourceError,
};
use sqlx::{FromRow, PgPool};

/// Row type for graph queries.
#[derive(FromRow)]
struct GraphRow {
    nodes: serde_json::Value,
    edges: serde_json::Value,
}

impl GraphRow {
    fn try_into_data(self) -> Result<WorkflowData, WorkflowSourceError> {
        let nodes: Vec<Node> =
            serde_json::from_value(self.nodes).map_err(|e| WorkflowSourceError::Decode {
                details: format!("nodes: {e}"),
            })?;
        let edges: Vec<Edge> =
            serde_json::from_value(self.edges).map_err(|e| WorkflowSourceError::Decode {
                details: format!("edges: {e}"),
            })?;
        Ok(WorkflowData::new(nodes, edges))
    }
}

fn unavailable(e: sqlx::Error) -> WorkflowSourceError {
    WorkflowSourceError::Unavailable {
        details: e.to_string(),
    }
}

/// Workflow source over the `workflows` table.
#[derive(Clone)]
pub struct PgWorkflowSource {
    pool: PgPool,
}

impl PgWorkflowSource {
    /// Creates a new source.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a workflow, including its graph if it carries one.
    ///
    /// A definition without graph data keeps whatever graph is stored.
    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowSourceError> {
        let encode = |e: serde_json::Error| WorkflowSourceError::Decode {
            details: e.to_string(),
        };
        let (nodes, edges) = match &definition.data {
            Some(data) => (
                Some(serde_json::to_value(&data.nodes).map_err(encode)?),
                Some(serde_json::to_value(&data.edges).map_err(encode)?),
            ),
            None => (None, None),
        };
        let settings = serde_json::to_value(&definition.settings).map_err(encode)?;

        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, user_id, name, description, nodes, edges, settings, variables)
            VALUES ($1, $2, $3, $4, COALESCE($5, '[]'::jsonb), COALESCE($6, '[]'::jsonb), $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET user_id = EXCLUDED.user_id, name = EXCLUDED.name,
                description = EXCLUDED.description,
                nodes = COALESCE($5, workflows.nodes), edges = COALESCE($6, workflows.edges),
                settings = EXCLUDED.settings, variables = EXCLUDED.variables,
                updated_at = NOW()
            "#,
        )
        .bind(definition.id.to_string())
        .bind(definition.user_id.map(|u| u.to_string()))
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(nodes)
        .bind(edges)
        .bind(settings)
        .bind(serde_json::Value::Object(definition.variables.clone()))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowSource for PgWorkflowSource {
    async fn load(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowData>, WorkflowSourceError> {
        let row: Option<GraphRow> =
            sqlx::query_as("SELECT nodes, edges FROM workflows WHERE id = $1")
                .bind(workflow_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;

        row.map(GraphRow::try_into_data).transpose()
    }
}
