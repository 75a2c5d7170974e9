//! Run and node step persistence.

use super::invalid_data;
use async_trait::async_trait;
use chainweave_core::{ExecutionId, NodeExecutionId, UserId, WorkflowId};
use chainweave_workflow::{
    NodeId, NodeResult, NodeStatus, RunRecord, RunStatus, RunStore, RunStoreError,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    id: String,
    workflow_id: String,
    user_id: String,
    status: String,
    trigger_payload: serde_json::Value,
    test_mode: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn try_into_record(self) -> Result<RunRecord, sqlx::Error> {
        let id = ExecutionId::from_str(&self.id)
            .map_err(|e| invalid_data(format!("invalid execution id '{}': {}", self.id, e)))?;
        let workflow_id = WorkflowId::from_str(&self.workflow_id).map_err(|e| {
            invalid_data(format!("invalid workflow id '{}': {}", self.workflow_id, e))
        })?;
        let user_id = UserId::from_str(&self.user_id)
            .map_err(|e| invalid_data(format!("invalid user id '{}': {}", self.user_id, e)))?;
        let status = RunStatus::from_str_value(&self.status)
            .ok_or_else(|| invalid_data(format!("invalid run status '{}'", self.status)))?;

        Ok(RunRecord {
            id,
            workflow_id,
            user_id,
            status,
            trigger_payload: self.trigger_payload,
            test_mode: self.test_mode,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Row type for node step queries.
#[derive(FromRow)]
struct StepRow {
    node_id: String,
    status: String,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    error: Option<String>,
    message: Option<String>,
    cost: Option<f64>,
    retry_count: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn try_into_result(self) -> Result<NodeResult, sqlx::Error> {
        let status = NodeStatus::from_str_value(&self.status).ok_or_else(|| {
            invalid_data(format!(
                "invalid status '{}' for node {}",
                self.status, self.node_id
            ))
        })?;

        Ok(NodeResult {
            node_id: NodeId::new(self.node_id),
            status,
            input: self.input,
            output: self.output,
            error: self.error,
            message: self.message,
            cost: self.cost,
            retry_count: u32::try_from(self.retry_count).unwrap_or_default(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn query_failed(e: sqlx::Error) -> RunStoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RunStoreError::Unavailable {
                details: e.to_string(),
            }
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => RunStoreError::Decode {
            details: e.to_string(),
        },
        _ => RunStoreError::QueryFailed {
            details: e.to_string(),
        },
    }
}

/// Run store over the `workflow_runs` and `node_executions` tables.
///
/// Steps are upserted on `(run_id, node_id)`; the update is guarded so that
/// a terminal row is never overwritten.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, run: &RunRecord) -> Result<(), RunStoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, user_id, status, trigger_payload, test_mode, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.user_id.to_string())
        .bind(run.status.as_str())
        .bind(&run.trigger_payload)
        .bind(run.test_mode)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(())
    }

    async fn record_step(
        &self,
        execution_id: ExecutionId,
        step: &NodeResult,
    ) -> Result<(), RunStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO node_executions
                (id, run_id, node_id, status, input, output, error, message, cost,
                 retry_count, started_at, finished_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (run_id, node_id) DO UPDATE
            SET status = EXCLUDED.status, input = EXCLUDED.input, output = EXCLUDED.output,
                error = EXCLUDED.error, message = EXCLUDED.message, cost = EXCLUDED.cost,
                retry_count = EXCLUDED.retry_count, started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at, duration_ms = EXCLUDED.duration_ms
            WHERE node_executions.status NOT IN ('success', 'failed', 'skipped')
            "#,
        )
        .bind(NodeExecutionId::new().to_string())
        .bind(execution_id.to_string())
        .bind(step.node_id.as_str())
        .bind(step.status.as_str())
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(&step.message)
        .bind(step.cost)
        .bind(i32::try_from(step.retry_count).unwrap_or(i32::MAX))
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.duration_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation()) {
                RunStoreError::RunNotFound { execution_id }
            } else {
                query_failed(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::StepAlreadyTerminal {
                execution_id,
                node_id: step.node_id.clone(),
            });
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        execution_id: ExecutionId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), RunStoreError> {
        // A finished run keeps its status; the update only proves existence.
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = CASE WHEN status = 'running' THEN $2 ELSE status END,
                finished_at = COALESCE(finished_at, $3)
            WHERE id = $1
            "#,
        )
        .bind(execution_id.to_string())
        .bind(status.as_str())
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::RunNotFound { execution_id });
        }
        Ok(())
    }

    async fn get_run(&self, execution_id: ExecutionId) -> Result<Option<RunRecord>, RunStoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, user_id, status, trigger_payload, test_mode,
                   started_at, finished_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)?;

        row.map(RunRow::try_into_record)
            .transpose()
            .map_err(query_failed)
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<NodeResult>, RunStoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT node_id, status, input, output, error, message, cost, retry_count,
                   started_at, finished_at
            FROM node_executions
            WHERE run_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        rows.into_iter()
            .map(StepRow::try_into_result)
            .collect::<Result<_, _>>()
            .map_err(query_failed)
    }

    async fn list_runs(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, RunStoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, user_id, status, trigger_payload, test_mode,
                   started_at, finished_at
            FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        rows.into_iter()
            .map(RunRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(query_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_row(status: &str) -> RunRow {
        RunRow {
            id: ExecutionId::new().to_string(),
            workflow_id: WorkflowId::new().to_string(),
            user_id: UserId::new().to_string(),
            status: status.to_string(),
            trigger_payload: json!({"orderId": 7}),
            test_mode: true,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn run_row_decodes() {
        let record = run_row("partial_success").try_into_record().expect("decode");
        assert_eq!(record.status, RunStatus::PartialSuccess);
        assert_eq!(record.trigger_payload["orderId"], 7);
        assert!(record.test_mode);
    }

    #[test]
    fn run_row_rejects_unknown_status() {
        let err = run_row("exploded").try_into_record().unwrap_err();
        assert!(matches!(query_failed(err), RunStoreError::Decode { .. }));
    }

    #[test]
    fn run_row_rejects_bad_id() {
        let mut row = run_row("running");
        row.workflow_id = "not-a-ulid".to_string();
        assert!(row.try_into_record().is_err());
    }

    #[test]
    fn step_row_decodes() {
        let result = StepRow {
            node_id: "fetch".to_string(),
            status: "failed".to_string(),
            input: Some(json!({})),
            output: None,
            error: Some("HTTP 502".to_string()),
            message: None,
            cost: Some(0.25),
            retry_count: 2,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
        }
        .try_into_result()
        .expect("decode");
        assert_eq!(result.node_id, NodeId::new("fetch"));
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("HTTP 502"));
        assert_eq!(result.retry_count, 2);
    }

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            query_failed(sqlx::Error::PoolTimedOut),
            RunStoreError::Unavailable { .. }
        ));
        assert!(matches!(
            query_failed(sqlx::Error::RowNotFound),
            RunStoreError::QueryFailed { .. }
        ));
    }
}
