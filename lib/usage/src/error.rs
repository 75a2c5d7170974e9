//! Error types for usage governance.
//!
//! - `UsageLimitExceeded`: A denial; not a fault, callers surface it as a failed node
//! - `UsageStoreError`: Persistence failures
//! - `UsageError`: Governor-level failures (wraps store errors)

use chainweave_core::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which limit a denial hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Dollar budget for the window.
    Cost,
    /// Number of cost-bearing executions in the window.
    Executions,
}

/// An admission check was denied because a window budget would be exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimitExceeded {
    /// The user whose budget was checked.
    pub user_id: UserId,
    /// The window that would overflow (e.g. `daily:2026-03-01`).
    pub window_key: String,
    /// Which limit was hit.
    pub kind: LimitKind,
    /// The configured limit.
    pub limit: f64,
    /// Usage already accrued in the window.
    pub accrued: f64,
    /// What the denied request asked for.
    pub requested: f64,
}

impl fmt::Display for UsageLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LimitKind::Cost => write!(
                f,
                "usage limit exceeded for {}: ${:.2} accrued + ${:.2} requested exceeds ${:.2} limit",
                self.window_key, self.accrued, self.requested, self.limit
            ),
            LimitKind::Executions => write!(
                f,
                "usage limit exceeded for {}: {} executions already used of {}",
                self.window_key, self.accrued, self.limit
            ),
        }
    }
}

impl std::error::Error for UsageLimitExceeded {}

/// Errors from usage persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageStoreError {
    /// The store could not be reached.
    Unavailable { details: String },
    /// A query or transaction failed.
    QueryFailed { details: String },
    /// A stored row could not be decoded.
    Decode { details: String },
}

impl fmt::Display for UsageStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "usage store unavailable: {details}"),
            Self::QueryFailed { details } => write!(f, "usage store query failed: {details}"),
            Self::Decode { details } => write!(f, "failed to decode usage record: {details}"),
        }
    }
}

impl std::error::Error for UsageStoreError {}

/// Errors from the governor.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageError {
    /// The backing store failed.
    Store(UsageStoreError),
    /// The requested cost is negative or not a number.
    InvalidCost { cost: f64 },
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "usage store error: {e}"),
            Self::InvalidCost { cost } => write!(f, "invalid cost estimate: {cost}"),
        }
    }
}

impl std::error::Error for UsageError {}

impl From<UsageStoreError> for UsageError {
    fn from(e: UsageStoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_denial_reads_like_a_budget() {
        let err = UsageLimitExceeded {
            user_id: UserId::new(),
            window_key: "daily:2026-03-01".to_string(),
            kind: LimitKind::Cost,
            limit: 10.0,
            accrued: 9.5,
            requested: 1.0,
        };
        assert_eq!(
            err.to_string(),
            "usage limit exceeded for daily:2026-03-01: $9.50 accrued + $1.00 requested exceeds $10.00 limit"
        );
    }

    #[test]
    fn store_error_wraps() {
        let err: UsageError = UsageStoreError::QueryFailed {
            details: "deadlock".to_string(),
        }
        .into();
        assert!(err.to_string().contains("deadlock"));
    }
}
