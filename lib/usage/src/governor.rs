//! The usage governor.
//!
//! Handlers of cost-bearing nodes call [`UsageGovernor::check_admission`]
//! before doing anything expensive. An allowed admission has already
//! reserved the estimated cost in every applicable window, so two concurrent
//! checks can never both pass when together they would overflow a budget.
//! After the work finishes, [`UsageGovernor::settle`] accrues any cost above
//! the estimate. Nothing is ever refunded; accrual within a window is
//! monotonic.

use crate::error::{UsageError, UsageLimitExceeded};
use crate::plan::{PlanLimits, PlanTable, PlanTier};
use crate::store::{ReserveOutcome, UsageRecord, UsageStore, WindowLimit};
use crate::window::{BudgetScope, Granularity, UsageWindow};
use chainweave_core::UserId;
use chrono::{DateTime, NaiveDate, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Governor configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GovernorSettings {
    /// Per-tier overrides of the default plan table.
    #[serde(default)]
    pub plans: HashMap<PlanTier, PlanLimits>,
}

impl GovernorSettings {
    /// The default plan table with overrides applied.
    #[must_use]
    pub fn plan_table(&self) -> PlanTable {
        self.plans
            .iter()
            .fold(PlanTable::standard(), |table, (tier, limits)| {
                table.with_limits(*tier, *limits)
            })
    }
}

/// A budget configured by a caller that brings its own provider credentials.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerBudget {
    /// Dollars per calendar day.
    #[serde(default)]
    pub daily_cost: Option<f64>,
    /// Dollars per calendar month.
    #[serde(default)]
    pub monthly_cost: Option<f64>,
}

/// Whose credentials pay for the execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CredentialSource {
    /// Platform credentials; plan limits apply.
    #[default]
    Platform,
    /// The caller's own credentials; plan limits are bypassed.
    CallerSupplied {
        /// Optional budget the caller set for itself.
        #[serde(default)]
        budget: Option<CallerBudget>,
    },
}

/// An admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    /// The user the execution is billed to.
    pub user_id: UserId,
    /// Upper-bound cost of the execution in dollars.
    pub estimated_cost: f64,
    /// Who pays.
    pub credentials: CredentialSource,
}

impl AdmissionRequest {
    /// A platform-paid request.
    #[must_use]
    pub fn new(user_id: UserId, estimated_cost: f64) -> Self {
        Self {
            user_id,
            estimated_cost,
            credentials: CredentialSource::Platform,
        }
    }

    /// Sets the credential source.
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialSource) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Proof of an admitted execution, needed to settle its final cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionTicket {
    /// The billed user.
    pub user_id: UserId,
    /// Windows the reservation was applied to.
    pub window_keys: Vec<String>,
    /// Dollars reserved at admission.
    pub reserved_cost: f64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The execution may proceed; its estimate is reserved.
    Allowed(AdmissionTicket),
    /// The execution must not run.
    Denied(UsageLimitExceeded),
}

impl Admission {
    /// Returns true if the execution may proceed.
    #[must_use]
    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Human-readable denial reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(denial) => Some(denial.to_string()),
        }
    }
}

/// Current usage for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// The user's plan.
    pub plan: PlanTier,
    /// The plan's limits.
    pub limits: PlanLimits,
    /// Today's window.
    pub daily: UsageRecord,
    /// This month's window.
    pub monthly: UsageRecord,
}

/// Admission control over an injected usage store.
pub struct UsageGovernor {
    store: Arc<dyn UsageStore>,
    plans: PlanTable,
}

impl UsageGovernor {
    /// Creates a governor.
    #[must_use]
    pub fn new(store: Arc<dyn UsageStore>, plans: PlanTable) -> Self {
        Self { store, plans }
    }

    /// Checks and reserves budget for an execution starting now.
    ///
    /// # Errors
    ///
    /// Returns an error if the cost is invalid or the store fails. A denial is
    /// not an error; it is `Ok(Admission::Denied(..))`.
    pub async fn check_admission(
        &self,
        request: &AdmissionRequest,
    ) -> Result<Admission, Report<UsageError>> {
        self.check_admission_at(request, Utc::now()).await
    }

    /// Checks and reserves budget for an execution starting at `at`.
    ///
    /// # Errors
    ///
    /// See [`Self::check_admission`].
    #[instrument(skip(self, request), fields(user_id = %request.user_id, estimated_cost = request.estimated_cost))]
    pub async fn check_admission_at(
        &self,
        request: &AdmissionRequest,
        at: DateTime<Utc>,
    ) -> Result<Admission, Report<UsageError>> {
        let cost = validate_cost(request.estimated_cost)?;
        let limits = self.window_limits(request, at).await?;

        let outcome = self
            .store
            .try_reserve(request.user_id, &limits, cost)
            .await
            .map_err(UsageError::from)?;

        match outcome {
            ReserveOutcome::Reserved => {
                debug!("Admission granted");
                Ok(Admission::Allowed(AdmissionTicket {
                    user_id: request.user_id,
                    window_keys: limits.into_iter().map(|l| l.window_key).collect(),
                    reserved_cost: cost,
                }))
            }
            ReserveOutcome::Denied(denial) => {
                warn!(window = %denial.window_key, reason = %denial, "Admission denied");
                Ok(Admission::Denied(denial))
            }
        }
    }

    /// Accrues the part of `actual_cost` that exceeds the reserved estimate.
    ///
    /// # Errors
    ///
    /// Returns an error if the cost is invalid or the store fails.
    #[instrument(skip(self, ticket), fields(user_id = %ticket.user_id, reserved = ticket.reserved_cost))]
    pub async fn settle(
        &self,
        ticket: &AdmissionTicket,
        actual_cost: f64,
    ) -> Result<(), Report<UsageError>> {
        let actual = validate_cost(actual_cost)?;
        let excess = actual - ticket.reserved_cost;
        if excess <= 0.0 {
            return Ok(());
        }
        debug!(excess, "Accruing cost above estimate");
        self.store
            .accrue(ticket.user_id, &ticket.window_keys, excess)
            .await
            .map_err(UsageError::from)?;
        Ok(())
    }

    /// The user's plan and current plan windows.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn snapshot(&self, user_id: UserId) -> Result<UsageSnapshot, Report<UsageError>> {
        let now = Utc::now();
        let plan = self.store.plan_for(user_id).await.map_err(UsageError::from)?;
        let daily_key = UsageWindow::Daily.key_at(BudgetScope::Plan, now);
        let monthly_key = UsageWindow::Monthly.key_at(BudgetScope::Plan, now);

        let daily = self
            .store
            .get(user_id, &daily_key)
            .await
            .map_err(UsageError::from)?
            .unwrap_or_else(|| UsageRecord::empty(user_id, daily_key));
        let monthly = self
            .store
            .get(user_id, &monthly_key)
            .await
            .map_err(UsageError::from)?
            .unwrap_or_else(|| UsageRecord::empty(user_id, monthly_key));

        Ok(UsageSnapshot {
            plan,
            limits: self.plans.limits_for(plan),
            daily,
            monthly,
        })
    }

    /// Usage per day or month between two dates, inclusive.
    ///
    /// Periods without usage are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn usage_report(
        &self,
        user_id: UserId,
        scope: BudgetScope,
        granularity: Granularity,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UsageRecord>, Report<UsageError>> {
        let window = granularity.window();
        let records = self
            .store
            .list(
                user_id,
                &window.key_for_date(scope, from),
                &window.key_for_date(scope, to),
            )
            .await
            .map_err(UsageError::from)?;
        Ok(records)
    }

    async fn window_limits(
        &self,
        request: &AdmissionRequest,
        at: DateTime<Utc>,
    ) -> Result<Vec<WindowLimit>, Report<UsageError>> {
        match request.credentials {
            CredentialSource::Platform => {
                let tier = self
                    .store
                    .plan_for(request.user_id)
                    .await
                    .map_err(UsageError::from)?;
                let limits = self.plans.limits_for(tier);
                Ok(vec![
                    WindowLimit {
                        window_key: UsageWindow::Daily.key_at(BudgetScope::Plan, at),
                        max_cost: limits.daily_cost,
                        max_executions: limits.daily_executions,
                    },
                    WindowLimit {
                        window_key: UsageWindow::Monthly.key_at(BudgetScope::Plan, at),
                        max_cost: limits.monthly_cost,
                        max_executions: None,
                    },
                ])
            }
            CredentialSource::CallerSupplied { budget } => {
                let budget = budget.unwrap_or_default();
                let scope = BudgetScope::CallerCredentials;
                Ok(vec![
                    WindowLimit {
                        window_key: UsageWindow::Daily.key_at(scope, at),
                        max_cost: budget.daily_cost,
                        max_executions: None,
                    },
                    WindowLimit {
                        window_key: UsageWindow::Monthly.key_at(scope, at),
                        max_cost: budget.monthly_cost,
                        max_executions: None,
                    },
                ])
            }
        }
    }
}

fn validate_cost(cost: f64) -> Result<f64, Report<UsageError>> {
    if !cost.is_finite() || cost < 0.0 {
        return Err(UsageError::InvalidCost { cost }.into());
    }
    Ok(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUsageStore;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("timestamp")
    }

    fn daily_budget(limit: f64) -> PlanTable {
        PlanTable::standard().with_limits(
            PlanTier::Free,
            PlanLimits {
                daily_cost: Some(limit),
                monthly_cost: None,
                daily_executions: None,
            },
        )
    }

    fn record(user_id: UserId, key: &str, cost: f64) -> UsageRecord {
        UsageRecord {
            cost_accrued: cost,
            ..UsageRecord::empty(user_id, key)
        }
    }

    #[tokio::test]
    async fn denies_when_estimate_would_exceed_daily_budget() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        store.seed(record(user, "daily:2026-03-01", 9.50)).await;
        let governor = UsageGovernor::new(store.clone(), daily_budget(10.0));

        let admission = governor
            .check_admission_at(&AdmissionRequest::new(user, 1.0), at())
            .await
            .expect("admission");

        assert!(!admission.allowed());
        match &admission {
            Admission::Denied(denial) => {
                assert_eq!(denial.window_key, "daily:2026-03-01");
                assert!((denial.accrued - 9.5).abs() < f64::EPSILON);
            }
            Admission::Allowed(_) => panic!("expected denial"),
        }
        assert!(admission.reason().expect("denial reason").contains("usage limit exceeded"));

        let daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        assert!((daily.cost_accrued - 9.5).abs() < f64::EPSILON);
        assert_eq!(daily.execution_count, 0);
        assert!(store.get(user, "monthly:2026-03").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn allowed_admission_reserves_estimate() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        let governor = UsageGovernor::new(store.clone(), daily_budget(10.0));

        let admission = governor
            .check_admission_at(&AdmissionRequest::new(user, 0.25), at())
            .await
            .expect("admission");

        let Admission::Allowed(ticket) = admission else {
            panic!("expected admission");
        };
        assert_eq!(
            ticket.window_keys,
            vec!["daily:2026-03-01".to_string(), "monthly:2026-03".to_string()]
        );
        let daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        assert!((daily.cost_accrued - 0.25).abs() < f64::EPSILON);
        assert_eq!(daily.execution_count, 1);
    }

    #[tokio::test]
    async fn concurrent_checks_cannot_overdraw() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        let governor = Arc::new(UsageGovernor::new(store.clone(), daily_budget(1.0)));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .check_admission_at(&AdmissionRequest::new(user, 0.6), at())
                    .await
                    .expect("admission")
                    .allowed()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.expect("join") {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);

        let daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        assert!((daily.cost_accrued - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn caller_credentials_bypass_plan_limits() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        store.seed(record(user, "daily:2026-03-01", 10.0)).await;
        let governor = UsageGovernor::new(store.clone(), daily_budget(10.0));

        let request = AdmissionRequest::new(user, 5.0)
            .with_credentials(CredentialSource::CallerSupplied { budget: None });
        let admission = governor.check_admission_at(&request, at()).await.expect("admission");

        assert!(admission.allowed());
        let plan_daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        assert!((plan_daily.cost_accrued - 10.0).abs() < f64::EPSILON);
        let byok = store
            .get(user, "byok:daily:2026-03-01")
            .await
            .expect("get")
            .expect("record");
        assert!((byok.cost_accrued - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn caller_budget_still_applies() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        let governor = UsageGovernor::new(store.clone(), PlanTable::standard());

        let request = AdmissionRequest::new(user, 3.0).with_credentials(
            CredentialSource::CallerSupplied {
                budget: Some(CallerBudget {
                    daily_cost: Some(2.0),
                    monthly_cost: None,
                }),
            },
        );
        let admission = governor.check_admission_at(&request, at()).await.expect("admission");

        match admission {
            Admission::Denied(denial) => {
                assert_eq!(denial.window_key, "byok:daily:2026-03-01");
            }
            Admission::Allowed(_) => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn settle_accrues_only_the_excess() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        let governor = UsageGovernor::new(store.clone(), daily_budget(10.0));

        let Admission::Allowed(ticket) = governor
            .check_admission_at(&AdmissionRequest::new(user, 1.0), at())
            .await
            .expect("admission")
        else {
            panic!("expected admission");
        };

        governor.settle(&ticket, 0.4).await.expect("settle");
        let daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        assert!((daily.cost_accrued - 1.0).abs() < f64::EPSILON);

        governor.settle(&ticket, 1.5).await.expect("settle");
        let daily = store.get(user, "daily:2026-03-01").await.expect("get").expect("record");
        let monthly = store.get(user, "monthly:2026-03").await.expect("get").expect("record");
        assert!((daily.cost_accrued - 1.5).abs() < 1e-9);
        assert!((monthly.cost_accrued - 1.5).abs() < 1e-9);
        assert_eq!(daily.execution_count, 1);
    }

    #[tokio::test]
    async fn new_day_starts_a_fresh_window() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        store.seed(record(user, "daily:2026-03-01", 10.0)).await;
        let governor = UsageGovernor::new(store.clone(), daily_budget(10.0));

        let next_day = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 1).single().expect("timestamp");
        let admission = governor
            .check_admission_at(&AdmissionRequest::new(user, 1.0), next_day)
            .await
            .expect("admission");
        assert!(admission.allowed());
    }

    #[tokio::test]
    async fn rejects_negative_estimates() {
        let store = Arc::new(InMemoryUsageStore::new());
        let governor = UsageGovernor::new(store, PlanTable::standard());
        let result = governor
            .check_admission_at(&AdmissionRequest::new(UserId::new(), -1.0), at())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn report_lists_periods_in_range() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        store.seed(record(user, "daily:2026-02-28", 1.0)).await;
        store.seed(record(user, "daily:2026-03-01", 2.0)).await;
        store.seed(record(user, "daily:2026-03-03", 3.0)).await;
        store.seed(record(user, "monthly:2026-03", 5.0)).await;
        let governor = UsageGovernor::new(store, PlanTable::standard());

        let days = governor
            .usage_report(
                user,
                BudgetScope::Plan,
                Granularity::Day,
                NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"),
                NaiveDate::from_ymd_opt(2026, 3, 31).expect("date"),
            )
            .await
            .expect("usage report");
        let keys: Vec<_> = days.iter().map(|r| r.window_key.as_str()).collect();
        assert_eq!(keys, vec!["daily:2026-03-01", "daily:2026-03-03"]);

        let months = governor
            .usage_report(
                user,
                BudgetScope::Plan,
                Granularity::Month,
                NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
                NaiveDate::from_ymd_opt(2026, 12, 31).expect("date"),
            )
            .await
            .expect("usage report");
        assert_eq!(months.len(), 1);
        assert!((months[0].cost_accrued - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn snapshot_reports_plan_and_empty_windows() {
        let store = Arc::new(InMemoryUsageStore::new());
        let user = UserId::new();
        store.set_plan(user, PlanTier::Pro).await;
        let governor = UsageGovernor::new(store, PlanTable::standard());

        let snapshot = governor.snapshot(user).await.expect("snapshot");
        assert_eq!(snapshot.plan, PlanTier::Pro);
        assert_eq!(snapshot.limits, PlanLimits::for_tier(PlanTier::Pro));
        assert_eq!(snapshot.daily.execution_count, 0);
    }

    #[test]
    fn settings_override_plan_table() {
        let mut settings = GovernorSettings::default();
        settings.plans.insert(
            PlanTier::Pro,
            PlanLimits {
                daily_cost: Some(3.0),
                monthly_cost: None,
                daily_executions: None,
            },
        );
        let table = settings.plan_table();
        assert_eq!(table.limits_for(PlanTier::Pro).daily_cost, Some(3.0));
        assert_eq!(
            table.limits_for(PlanTier::Free),
            PlanLimits::for_tier(PlanTier::Free)
        );
    }

    #[test]
    fn credential_source_wire_format() {
        let source: CredentialSource = serde_json::from_str(
            r#"{"type": "callerSupplied", "budget": {"dailyCost": 4.0}}"#,
        )
        .expect("deserialize");
        assert_eq!(
            source,
            CredentialSource::CallerSupplied {
                budget: Some(CallerBudget {
                    daily_cost: Some(4.0),
                    monthly_cost: None,
                }),
            }
        );
    }
}
