//! Usage governance for cost-bearing node executions.
//!
//! This crate provides:
//!
//! - **Plans**: Per-tier daily and monthly budgets
//! - **Windows**: Daily and monthly usage windows keyed by calendar period
//! - **Store**: The `UsageStore` persistence seam with atomic reserve and accrue
//! - **Governor**: Admission checks, settlement, and usage reporting

pub mod error;
pub mod governor;
pub mod plan;
pub mod store;
pub mod window;

pub use error::{LimitKind, UsageError, UsageLimitExceeded, UsageStoreError};
pub use governor::{
    Admission, AdmissionRequest, AdmissionTicket, CallerBudget, CredentialSource,
    GovernorSettings, UsageGovernor, UsageSnapshot,
};
pub use plan::{PlanLimits, PlanTable, PlanTier};
pub use store::{InMemoryUsageStore, ReserveOutcome, UsageRecord, UsageStore, WindowLimit};
pub use window::{BudgetScope, Granularity, UsageWindow};
