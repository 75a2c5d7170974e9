//! Usage windows.
//!
//! A window key names one calendar period, e.g. `daily:2026-03-01` or
//! `monthly:2026-03`. Accrual within a key only grows; a new period simply
//! produces a new key, which is how windows roll over.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A calendar window over which usage accrues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    /// One UTC calendar day.
    Daily,
    /// One UTC calendar month.
    Monthly,
}

impl UsageWindow {
    fn label(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    fn period(self, date: NaiveDate) -> String {
        match self {
            Self::Daily => date.format("%Y-%m-%d").to_string(),
            Self::Monthly => format!("{:04}-{:02}", date.year(), date.month()),
        }
    }

    /// Key of the window containing `date` within `scope`.
    #[must_use]
    pub fn key_for_date(self, scope: BudgetScope, date: NaiveDate) -> String {
        format!("{}{}:{}", scope.prefix(), self.label(), self.period(date))
    }

    /// Key of the window containing `at` within `scope`.
    #[must_use]
    pub fn key_at(self, scope: BudgetScope, at: DateTime<Utc>) -> String {
        self.key_for_date(scope, at.date_naive())
    }
}

/// Whose budget a window belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Executions paid through the platform, limited by the plan.
    #[default]
    Plan,
    /// Executions using the caller's own provider credentials.
    CallerCredentials,
}

impl BudgetScope {
    fn prefix(self) -> &'static str {
        match self {
            Self::Plan => "",
            Self::CallerCredentials => "byok:",
        }
    }
}

/// Reporting granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One row per day.
    #[default]
    Day,
    /// One row per month.
    Month,
}

impl Granularity {
    /// The window that backs this granularity.
    #[must_use]
    pub fn window(self) -> UsageWindow {
        match self {
            Self::Day => UsageWindow::Daily,
            Self::Month => UsageWindow::Monthly,
        }
    }
}
