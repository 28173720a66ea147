use serde::{Deserialize, Serialize};
use std::fmt;

/// How consequential a change is. Ordered `R0 < R1 < R2 < R3`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskTier {
    R0,
    R1,
    R2,
    R3,
}

/// Plans at or above this tier only run for real when the request's
/// auto-approve tier also covers them.
pub const REQUIRES_APPROVAL_TIER: RiskTier = RiskTier::R2;

impl RiskTier {
    pub const ALL: [RiskTier; 4] = [RiskTier::R0, RiskTier::R1, RiskTier::R2, RiskTier::R3];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::R0 => "R0",
            RiskTier::R1 => "R1",
            RiskTier::R2 => "R2",
            RiskTier::R3 => "R3",
        }
    }

    pub fn requires_approval(&self) -> bool {
        *self >= REQUIRES_APPROVAL_TIER
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff `candidate` does not exceed `ceiling`.
pub fn meets_risk_tier(ceiling: RiskTier, candidate: RiskTier) -> bool {
    candidate <= ceiling
}

/// Issue severity. Declaration order is sort order: critical sorts first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}
