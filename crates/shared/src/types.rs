//! Plan catalog types shared by the billing core, the API and the worker

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returned when a tier or billing period string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseCatalogError {
    pub kind: &'static str,
    pub value: String,
}

// =============================================================================
// Plan tiers
// =============================================================================

/// Subscription tier of a workspace.
///
/// Tiers are ordered: `Starter < Growth < Scale < Enterprise`. The ordering is
/// what classifies a plan change as an upgrade or a downgrade.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Growth,
    Scale,
    Enterprise,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Starter
    }
}

impl PlanTier {
    /// Every tier, lowest first
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Starter,
        PlanTier::Growth,
        PlanTier::Scale,
        PlanTier::Enterprise,
    ];

    /// Position in the tier ordering (0 = lowest)
    pub fn position(&self) -> usize {
        match self {
            Self::Starter => 0,
            Self::Growth => 1,
            Self::Scale => 2,
            Self::Enterprise => 3,
        }
    }

    /// Seats bundled into the base price
    pub fn included_seats(&self) -> u32 {
        match self {
            Self::Starter => 10,
            Self::Growth => 30,
            Self::Scale => 75,
            Self::Enterprise => 150,
        }
    }

    /// Hard ceiling on active users, extra seats included
    pub fn max_seats(&self) -> u32 {
        match self {
            Self::Starter => 20,
            Self::Growth => 60,
            Self::Scale => 150,
            Self::Enterprise => 500,
        }
    }

    /// Maximum workspace members with a login (u32::MAX = unlimited)
    pub fn max_team_members(&self) -> u32 {
        match self {
            Self::Starter => 3,
            Self::Growth => 10,
            Self::Scale => 25,
            Self::Enterprise => u32::MAX,
        }
    }

    /// Maximum active projects (u32::MAX = unlimited)
    pub fn max_projects(&self) -> u32 {
        match self {
            Self::Starter => 10,
            Self::Growth => 50,
            Self::Scale => 200,
            Self::Enterprise => u32::MAX,
        }
    }

    /// The next tier up, if any
    pub fn next(&self) -> Option<PlanTier> {
        Self::ALL.get(self.position() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Growth => "growth",
            Self::Scale => "scale",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = ParseCatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "growth" => Ok(Self::Growth),
            "scale" => Ok(Self::Scale),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(ParseCatalogError {
                kind: "plan tier",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Billing periods
// =============================================================================

/// How often the subscription renews
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl Default for BillingPeriod {
    fn default() -> Self {
        Self::Monthly
    }
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = ParseCatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            // "annual" is what the checkout pages used historically
            "yearly" | "year" | "annual" => Ok(Self::Yearly),
            _ => Err(ParseCatalogError {
                kind: "billing period",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(PlanTier::Starter < PlanTier::Growth);
        assert!(PlanTier::Growth < PlanTier::Scale);
        assert!(PlanTier::Scale < PlanTier::Enterprise);

        for (index, tier) in PlanTier::ALL.iter().enumerate() {
            assert_eq!(tier.position(), index);
        }
    }

    #[test]
    fn test_next_tier() {
        assert_eq!(PlanTier::Starter.next(), Some(PlanTier::Growth));
        assert_eq!(PlanTier::Growth.next(), Some(PlanTier::Scale));
        assert_eq!(PlanTier::Scale.next(), Some(PlanTier::Enterprise));
        assert_eq!(PlanTier::Enterprise.next(), None);
    }

    #[test]
    fn test_included_never_exceeds_max() {
        for tier in PlanTier::ALL {
            assert!(tier.included_seats() <= tier.max_seats(), "{tier}");
        }
    }

    #[test]
    fn test_growth_limits() {
        assert_eq!(PlanTier::Growth.included_seats(), 30);
        assert_eq!(PlanTier::Growth.max_seats(), 60);
        assert_eq!(PlanTier::Growth.max_team_members(), 10);
    }

    #[test]
    fn test_parse_round_trip() {
        for tier in PlanTier::ALL {
            assert_eq!(tier.as_str().parse::<PlanTier>().unwrap(), tier);
        }
        assert_eq!(" Growth ".parse::<PlanTier>().unwrap(), PlanTier::Growth);
        assert!("free".parse::<PlanTier>().is_err());
    }

    #[test]
    fn test_billing_period_parsing() {
        assert_eq!("monthly".parse::<BillingPeriod>().unwrap(), BillingPeriod::Monthly);
        assert_eq!("annual".parse::<BillingPeriod>().unwrap(), BillingPeriod::Yearly);
        assert_eq!("YEARLY".parse::<BillingPeriod>().unwrap(), BillingPeriod::Yearly);

        let err = "weekly".parse::<BillingPeriod>().unwrap_err();
        assert_eq!(err.kind, "billing period");
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&PlanTier::Enterprise).unwrap();
        assert_eq!(json, "\"enterprise\"");
        let period: BillingPeriod = serde_json::from_str("\"yearly\"").unwrap();
        assert_eq!(period, BillingPeriod::Yearly);
    }
}
