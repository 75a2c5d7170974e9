//! Subscription plans and their budgets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// No subscription.
    #[default]
    Free,
    /// Individual paid plan.
    Pro,
    /// Team plan.
    Business,
    /// Contracted plan without platform limits.
    Enterprise,
}

impl PlanTier {
    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parses the database representation, treating unknown values as `Free`.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "pro" => Self::Pro,
            "business" => Self::Business,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        }
    }
}

/// Budgets for one tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Dollars per calendar day.
    #[serde(default)]
    pub daily_cost: Option<f64>,
    /// Dollars per calendar month.
    #[serde(default)]
    pub monthly_cost: Option<f64>,
    /// Cost-bearing executions per calendar day.
    #[serde(default)]
    pub daily_executions: Option<u64>,
}

impl PlanLimits {
    /// No limits at all.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            daily_cost: None,
            monthly_cost: None,
            daily_executions: None,
        }
    }

    /// Default budgets for a tier.
    #[must_use]
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                daily_cost: Some(1.0),
                monthly_cost: Some(10.0),
                daily_executions: Some(100),
            },
            PlanTier::Pro => Self {
                daily_cost: Some(10.0),
                monthly_cost: Some(100.0),
                daily_executions: Some(2_000),
            },
            PlanTier::Business => Self {
                daily_cost: Some(50.0),
                monthly_cost: Some(1_000.0),
                daily_executions: None,
            },
            PlanTier::Enterprise => Self::unlimited(),
        }
    }
}

/// Limit lookup per tier.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTable {
    limits: HashMap<PlanTier, PlanLimits>,
}

impl PlanTable {
    /// The default table.
    #[must_use]
    pub fn standard() -> Self {
        let limits = [
            PlanTier::Free,
            PlanTier::Pro,
            PlanTier::Business,
            PlanTier::Enterprise,
        ]
        .into_iter()
        .map(|tier| (tier, PlanLimits::for_tier(tier)))
        .collect();
        Self { limits }
    }

    /// Replaces the limits of one tier.
    #[must_use]
    pub fn with_limits(mut self, tier: PlanTier, limits: PlanLimits) -> Self {
        self.limits.insert(tier, limits);
        self
    }

    /// Limits for `tier`.
    #[must_use]
    pub fn limits_for(&self, tier: PlanTier) -> PlanLimits {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| PlanLimits::for_tier(tier))
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        Self::standard()
    }
}
