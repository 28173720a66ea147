use serde::{Deserialize, Serialize};

use crate::approval::ApprovalRecord;
use crate::risk::RiskTier;

/// Kind of maintenance pipeline. Unrecognized names deserialize to `Custom`
/// and run the full stage sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Full,
    SecurityScan,
    AuditOnly,
    PlanOnly,
    TargetedFix,
    DocsRefresh,
    #[serde(other)]
    Custom,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Full => "full",
            PipelineType::SecurityScan => "security_scan",
            PipelineType::AuditOnly => "audit_only",
            PipelineType::PlanOnly => "plan_only",
            PipelineType::TargetedFix => "targeted_fix",
            PipelineType::DocsRefresh => "docs_refresh",
            PipelineType::Custom => "custom",
        }
    }
}

/// Input to the runner. Validate with [`PipelineRequest::validate`] before
/// admitting a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub pipeline_id: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    /// `owner/name`
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    pub max_risk_tier: RiskTier,
    pub auto_approve_tier: RiskTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issue_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed pipeline request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("pipelineId must not be empty")]
    EmptyPipelineId,
    #[error("pipelineId \"{0}\" may only contain ASCII letters, digits, '-', '_' and '.'")]
    InvalidPipelineId(String),
    #[error("repo \"{0}\" must be of the form owner/name")]
    InvalidRepo(String),
    #[error("tokenBudget must be greater than zero")]
    ZeroTokenBudget,
    #[error("targeted_fix requires at least one issue id")]
    MissingIssueIds,
    #[error("run \"{0}\" is already running")]
    RunAlreadyActive(String),
}

impl PipelineRequest {
    /// Parse and validate a request from JSON.
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        let request: PipelineRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.pipeline_id.is_empty() {
            return Err(RequestError::EmptyPipelineId);
        }
        let id_ok = self
            .pipeline_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !id_ok || self.pipeline_id.starts_with('.') {
            return Err(RequestError::InvalidPipelineId(self.pipeline_id.clone()));
        }
        if self.repo_parts().is_none() {
            return Err(RequestError::InvalidRepo(self.repo.clone()));
        }
        if self.token_budget == Some(0) {
            return Err(RequestError::ZeroTokenBudget);
        }
        if self.pipeline_type == PipelineType::TargetedFix && self.issue_ids.is_empty() {
            return Err(RequestError::MissingIssueIds);
        }
        Ok(())
    }

    /// Split `repo` into `(owner, name)`.
    pub fn repo_parts(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.repo.split_once('/')?;
        if owner.trim().is_empty() || name.trim().is_empty() || name.contains('/') {
            return None;
        }
        Some((owner, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json(extra: &str) -> String {
        format!(
            r#"{{"pipelineId":"p-1","type":"full","repo":"acme/widgets","maxRiskTier":"R1","autoApproveTier":"R0"{extra}}}"#
        )
    }

    #[test]
    fn parses_minimal_request() {
        let req = PipelineRequest::from_json(&base_json("")).unwrap();
        assert_eq!(req.pipeline_type, PipelineType::Full);
        assert_eq!(req.repo_parts(), Some(("acme", "widgets")));
        assert!(req.approval.is_none());
    }

    #[test]
    fn unknown_type_is_custom() {
        let json = base_json("").replace(r#""type":"full""#, r#""type":"nightly_sweep""#);
        let req = PipelineRequest::from_json(&json).unwrap();
        assert_eq!(req.pipeline_type, PipelineType::Custom);
    }

    #[test]
    fn rejects_bad_repo() {
        let json = base_json("").replace("acme/widgets", "widgets");
        let err = PipelineRequest::from_json(&json).unwrap_err();
        assert!(matches!(err, RequestError::InvalidRepo(_)), "{err}");
    }

    #[test]
    fn rejects_path_like_pipeline_id() {
        let json = base_json("").replace(r#""p-1""#, r#""../etc""#);
        let err = PipelineRequest::from_json(&json).unwrap_err();
        assert!(matches!(err, RequestError::InvalidPipelineId(_)), "{err}");
    }

    #[test]
    fn rejects_zero_budget() {
        let err = PipelineRequest::from_json(&base_json(r#","tokenBudget":0"#)).unwrap_err();
        assert!(matches!(err, RequestError::ZeroTokenBudget));
    }

    #[test]
    fn targeted_fix_needs_issue_ids() {
        let json = base_json("").replace(r#""type":"full""#, r#""type":"targeted_fix""#);
        let err = PipelineRequest::from_json(&json).unwrap_err();
        assert!(matches!(err, RequestError::MissingIssueIds));

        let json = base_json(r#","issueIds":["SEC-1"]"#)
            .replace(r#""type":"full""#, r#""type":"targeted_fix""#);
        assert!(PipelineRequest::from_json(&json).is_ok());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = PipelineRequest::from_json("{not json").unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }

    #[test]
    fn missing_tier_is_rejected() {
        let json = r#"{"pipelineId":"p","type":"full","repo":"a/b","autoApproveTier":"R0"}"#;
        assert!(PipelineRequest::from_json(json).is_err());
    }
}
