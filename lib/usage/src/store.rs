//! Usage persistence.
//!
//! The store owns the only state shared between concurrent runs of the same
//! user, so every mutation it exposes is an atomic increment performed inside
//! the store. Callers never read a record, add to it, and write it back.

use crate::error::{LimitKind, UsageLimitExceeded, UsageStoreError};
use crate::plan::PlanTier;
use async_trait::async_trait;
use chainweave_core::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Slack for floating point comparisons against dollar limits.
const COST_EPSILON: f64 = 1e-9;

/// Accrued usage for one user in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Owner of the usage.
    pub user_id: UserId,
    /// Window key, e.g. `daily:2026-03-01`.
    pub window_key: String,
    /// Dollars accrued in the window.
    pub cost_accrued: f64,
    /// Cost-bearing executions admitted in the window.
    pub execution_count: u64,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    /// An empty record for a window that has not accrued anything yet.
    #[must_use]
    pub fn empty(user_id: UserId, window_key: impl Into<String>) -> Self {
        Self {
            user_id,
            window_key: window_key.into(),
            cost_accrued: 0.0,
            execution_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Returns the denial this record would produce for `limit` and `cost`, if any.
    #[must_use]
    pub fn check(&self, limit: &WindowLimit, cost: f64) -> Option<UsageLimitExceeded> {
        if let Some(max_cost) = limit.max_cost
            && self.cost_accrued + cost > max_cost + COST_EPSILON
        {
            return Some(UsageLimitExceeded {
                user_id: self.user_id,
                window_key: self.window_key.clone(),
                kind: LimitKind::Cost,
                limit: max_cost,
                accrued: self.cost_accrued,
                requested: cost,
            });
        }
        if let Some(max_executions) = limit.max_executions
            && self.execution_count >= max_executions
        {
            return Some(UsageLimitExceeded {
                user_id: self.user_id,
                window_key: self.window_key.clone(),
                kind: LimitKind::Executions,
                limit: max_executions as f64,
                accrued: self.execution_count as f64,
                requested: 1.0,
            });
        }
        None
    }
}

/// The budget applied to one window during a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Window to check and increment.
    pub window_key: String,
    /// Dollar limit, if any.
    pub max_cost: Option<f64>,
    /// Execution count limit, if any.
    pub max_executions: Option<u64>,
}

impl WindowLimit {
    /// A window that is tracked but not limited.
    #[must_use]
    pub fn tracked(window_key: impl Into<String>) -> Self {
        Self {
            window_key: window_key.into(),
            max_cost: None,
            max_executions: None,
        }
    }
}

/// Result of an atomic reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// Every window was incremented.
    Reserved,
    /// No window was touched.
    Denied(UsageLimitExceeded),
}

/// Persistence for usage records and plan assignments.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// The plan a user is on.
    async fn plan_for(&self, user_id: UserId) -> Result<PlanTier, UsageStoreError>;

    /// Reads one window, if it has accrued anything.
    async fn get(
        &self,
        user_id: UserId,
        window_key: &str,
    ) -> Result<Option<UsageRecord>, UsageStoreError>;

    /// Atomically checks every limit and, only if all pass, adds `cost` and
    /// one execution to every window.
    async fn try_reserve(
        &self,
        user_id: UserId,
        limits: &[WindowLimit],
        cost: f64,
    ) -> Result<ReserveOutcome, UsageStoreError>;

    /// Atomically adds `cost` to every window without checking limits.
    async fn accrue(
        &self,
        user_id: UserId,
        window_keys: &[String],
        cost: f64,
    ) -> Result<(), UsageStoreError>;

    /// Records whose key lies in `from_key..=to_key`, ordered by key.
    async fn list(
        &self,
        user_id: UserId,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<UsageRecord>, UsageStoreError>;
}

/// Process-local usage store.
///
/// A single mutex guards all records, which makes every reservation atomic
/// across windows.
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    records: Mutex<HashMap<(UserId, String), UsageRecord>>,
    plans: Mutex<HashMap<UserId, PlanTier>>,
}

impl InMemoryUsageStore {
    /// Creates an empty store where everyone is on the free plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a plan.
    pub async fn set_plan(&self, user_id: UserId, tier: PlanTier) {
        self.plans.lock().await.insert(user_id, tier);
    }

    /// Overwrites a record; for seeding fixtures.
    pub async fn seed(&self, record: UsageRecord) {
        self.records
            .lock()
            .await
            .insert((record.user_id, record.window_key.clone()), record);
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn plan_for(&self, user_id: UserId) -> Result<PlanTier, UsageStoreError> {
        Ok(self
            .plans
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get(
        &self,
        user_id: UserId,
        window_key: &str,
    ) -> Result<Option<UsageRecord>, UsageStoreError> {
        Ok(self
            .records
            .lock()
            .await
            .get(&(user_id, window_key.to_string()))
            .cloned())
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        limits: &[WindowLimit],
        cost: f64,
    ) -> Result<ReserveOutcome, UsageStoreError> {
        let mut records = self.records.lock().await;

        for limit in limits {
            let key = (user_id, limit.window_key.clone());
            let denial = match records.get(&key) {
                Some(record) => record.check(limit, cost),
                None => UsageRecord::empty(user_id, &limit.window_key).check(limit, cost),
            };
            if let Some(denial) = denial {
                return Ok(ReserveOutcome::Denied(denial));
            }
        }

        let now = Utc::now();
        for limit in limits {
            let record = records
                .entry((user_id, limit.window_key.clone()))
                .or_insert_with(|| UsageRecord::empty(user_id, &limit.window_key));
            record.cost_accrued += cost;
            record.execution_count += 1;
            record.updated_at = now;
        }
        Ok(ReserveOutcome::Reserved)
    }

    async fn accrue(
        &self,
        user_id: UserId,
        window_keys: &[String],
        cost: f64,
    ) -> Result<(), UsageStoreError> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        for window_key in window_keys {
            let record = records
                .entry((user_id, window_key.clone()))
                .or_insert_with(|| UsageRecord::empty(user_id, window_key));
            record.cost_accrued += cost;
            record.updated_at = now;
        }
        Ok(())
    }

    async fn list(
        &self,
        user_id: UserId,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<UsageRecord>, UsageStoreError> {
        let records = self.records.lock().await;
        let mut matching: Vec<UsageRecord> = records
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && r.window_key.as_str() >= from_key
                    && r.window_key.as_str() <= to_key
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.window_key.cmp(&b.window_key));
        Ok(matching)
    }
}
