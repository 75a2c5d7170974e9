//! Usage record persistence.
//!
//! Reservations lock every affected window row with `SELECT ... FOR UPDATE`
//! inside one transaction, so concurrent runs of the same user serialize on
//! their windows. Rows are locked in key order.

use super::invalid_data;
use async_trait::async_trait;
use chainweave_core::UserId;
use chainweave_usage::{
    PlanTier, ReserveOutcome, UsageRecord, UsageStore, UsageStoreError, WindowLimit,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::debug;

/// Row type for usage queries.
#[derive(FromRow)]
struct UsageRow {
    user_id: String,
    window_key: String,
    cost_accrued: f64,
    execution_count: i64,
    updated_at: DateTime<Utc>,
}

impl UsageRow {
    fn try_into_record(self) -> Result<UsageRecord, sqlx::Error> {
        let user_id = UserId::from_str(&self.user_id)
            .map_err(|e| invalid_data(format!("invalid user id '{}': {}", self.user_id, e)))?;
        let execution_count = u64::try_from(self.execution_count).map_err(|_| {
            invalid_data(format!(
                "negative execution count {} for {}",
                self.execution_count, self.window_key
            ))
        })?;

        Ok(UsageRecord {
            user_id,
            window_key: self.window_key,
            cost_accrued: self.cost_accrued,
            execution_count,
            updated_at: self.updated_at,
        })
    }
}

fn store_error(e: sqlx::Error) -> UsageStoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            UsageStoreError::Unavailable {
                details: e.to_string(),
            }
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => UsageStoreError::Decode {
            details: e.to_string(),
        },
        _ => UsageStoreError::QueryFailed {
            details: e.to_string(),
        },
    }
}

/// Usage store over the `usage_records` and `user_plans` tables.
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Locks a window row, creating it first if needed.
    async fn lock_window(
        tx: &mut Transaction<'_, Postgres>,
        user_id: UserId,
        window_key: &str,
    ) -> Result<UsageRecord, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (user_id, window_key)
            VALUES ($1, $2)
            ON CONFLICT (user_id, window_key) DO NOTHING
            "#,
        )
        .bind(user_id.to_string())
        .bind(window_key)
        .execute(&mut **tx)
        .await?;

        let row: UsageRow = sqlx::query_as(
            r#"
            SELECT user_id, window_key, cost_accrued, execution_count, updated_at
            FROM usage_records
            WHERE user_id = $1 AND window_key = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id.to_string())
        .bind(window_key)
        .fetch_one(&mut **tx)
        .await?;

        row.try_into_record()
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn plan_for(&self, user_id: UserId) -> Result<PlanTier, UsageStoreError> {
        let tier: Option<(String,)> =
            sqlx::query_as("SELECT tier FROM user_plans WHERE user_id = $1")
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(tier
            .map(|(tier,)| PlanTier::from_str_value(&tier))
            .unwrap_or_default())
    }

    async fn get(
        &self,
        user_id: UserId,
        window_key: &str,
    ) -> Result<Option<UsageRecord>, UsageStoreError> {
        let row: Option<UsageRow> = sqlx::query_as(
            r#"
            SELECT user_id, window_key, cost_accrued, execution_count, updated_at
            FROM usage_records
            WHERE user_id = $1 AND window_key = $2
            "#,
        )
        .bind(user_id.to_string())
        .bind(window_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(UsageRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        limits: &[WindowLimit],
        cost: f64,
    ) -> Result<ReserveOutcome, UsageStoreError> {
        let mut ordered: Vec<&WindowLimit> = limits.iter().collect();
        ordered.sort_by(|a, b| a.window_key.cmp(&b.window_key));

        let mut tx = self.pool.begin().await.map_err(store_error)?;

        for limit in &ordered {
            let record = Self::lock_window(&mut tx, user_id, &limit.window_key)
                .await
                .map_err(store_error)?;
            if let Some(denial) = record.check(limit, cost) {
                tx.rollback().await.map_err(store_error)?;
                debug!(user_id = %user_id, window_key = %limit.window_key, "Reservation denied");
                return Ok(ReserveOutcome::Denied(denial));
            }
        }

        let now = Utc::now();
        for limit in &ordered {
            sqlx::query(
                r#"
                UPDATE usage_records
                SET cost_accrued = cost_accrued + $3,
                    execution_count = execution_count + 1,
                    updated_at = $4
                WHERE user_id = $1 AND window_key = $2
                "#,
            )
            .bind(user_id.to_string())
            .bind(&limit.window_key)
            .bind(cost)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(ReserveOutcome::Reserved)
    }

    async fn accrue(
        &self,
        user_id: UserId,
        window_keys: &[String],
        cost: f64,
    ) -> Result<(), UsageStoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let now = Utc::now();

        for window_key in window_keys {
            sqlx::query(
                r#"
                INSERT INTO usage_records (user_id, window_key, cost_accrued, execution_count, updated_at)
                VALUES ($1, $2, $3, 0, $4)
                ON CONFLICT (user_id, window_key) DO UPDATE
                SET cost_accrued = usage_records.cost_accrued + EXCLUDED.cost_accrued,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(user_id.to_string())
            .bind(window_key)
            .bind(cost)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    async fn list(
        &self,
        user_id: UserId,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<UsageRecord>, UsageStoreError> {
        let rows: Vec<UsageRow> = sqlx::query_as(
            r#"
            SELECT user_id, window_key, cost_accrued, execution_count, updated_at
            FROM usage_records
            WHERE user_id = $1 AND window_key BETWEEN $2 AND $3
            ORDER BY window_key ASC
            "#,
        )
        .bind(user_id.to_string())
        .bind(from_key)
        .bind(to_key)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(UsageRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(execution_count: i64) -> UsageRow {
        UsageRow {
            user_id: UserId::new().to_string(),
            window_key: "daily:2026-03-01".to_string(),
            cost_accrued: 9.5,
            execution_count,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn usage_row_decodes() {
        let record = row(3).try_into_record().expect("decode");
        assert_eq!(record.window_key, "daily:2026-03-01");
        assert_eq!(record.execution_count, 3);
        assert!((record.cost_accrued - 9.5).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_counts_are_decode_errors() {
        let err = row(-1).try_into_record().unwrap_err();
        assert!(matches!(store_error(err), UsageStoreError::Decode { .. }));
    }

    #[test]
    fn closed_pool_is_unavailable() {
        assert!(matches!(
            store_error(sqlx::Error::PoolClosed),
            UsageStoreError::Unavailable { .. }
        ));
    }
}
