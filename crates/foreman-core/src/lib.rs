pub mod approval;
pub mod clock;
pub mod request;
pub mod risk;
pub mod types;

pub use approval::{ApprovalRecord, ScopeToken};
pub use request::{PipelineRequest, PipelineType, RequestError};
pub use risk::{meets_risk_tier, RiskTier, Severity, REQUIRES_APPROVAL_TIER};
pub use types::*;
