use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use time::OffsetDateTime;

use crate::clock::parse_rfc3339;

/// Mutation category a human approval can authorize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeToken {
    Commit,
    Push,
    OpenPr,
    Merge,
}

impl ScopeToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeToken::Commit => "commit",
            ScopeToken::Push => "push",
            ScopeToken::OpenPr => "open_pr",
            ScopeToken::Merge => "merge",
        }
    }
}

impl fmt::Display for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller-supplied approval for destructive operations within one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub run_id: String,
    pub approved_by: String,
    pub approved_at: String,
    pub scope: BTreeSet<ScopeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl ApprovalRecord {
    pub fn new(
        run_id: impl Into<String>,
        approved_by: impl Into<String>,
        scope: impl IntoIterator<Item = ScopeToken>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            approved_by: approved_by.into(),
            approved_at: crate::clock::now_rfc3339(),
            scope: scope.into_iter().collect(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: impl Into<String>) -> Self {
        self.expires_at = Some(expires_at.into());
        self
    }

    pub fn grants(&self, token: ScopeToken) -> bool {
        self.scope.contains(&token)
    }

    /// An approval whose `expiresAt` cannot be parsed counts as expired.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        match &self.expires_at {
            None => false,
            Some(raw) => match parse_rfc3339(raw) {
                Some(expiry) => now >= expiry,
                None => true,
            },
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> OffsetDateTime {
        parse_rfc3339(s).unwrap()
    }

    #[test]
    fn scope_membership() {
        let a = ApprovalRecord::new("run-1", "alice", [ScopeToken::Commit, ScopeToken::Push]);
        assert!(a.grants(ScopeToken::Push));
        assert!(!a.grants(ScopeToken::OpenPr));
    }

    #[test]
    fn no_expiry_never_expires() {
        let a = ApprovalRecord::new("run-1", "alice", [ScopeToken::Push]);
        assert!(!a.is_expired_at(at("2100-01-01T00:00:00Z")));
    }

    #[test]
    fn expiry_is_exclusive() {
        let a = ApprovalRecord::new("run-1", "alice", [ScopeToken::Push])
            .with_expiry("2026-03-01T12:00:00Z");
        assert!(!a.is_expired_at(at("2026-03-01T11:59:59Z")));
        assert!(a.is_expired_at(at("2026-03-01T12:00:00Z")));
    }

    #[test]
    fn unparseable_expiry_counts_as_expired() {
        let a = ApprovalRecord::new("run-1", "alice", [ScopeToken::Push]).with_expiry("tomorrow");
        assert!(a.is_expired_at(at("2000-01-01T00:00:00Z")));
    }

    #[test]
    fn wire_format() {
        let json = r#"{
            "runId": "run-1",
            "approvedBy": "alice",
            "approvedAt": "2026-03-01T10:00:00Z",
            "scope": ["push", "open_pr"],
            "expiresAt": "2026-03-02T10:00:00Z"
        }"#;
        let a: ApprovalRecord = serde_json::from_str(json).unwrap();
        assert!(a.grants(ScopeToken::OpenPr));
        assert_eq!(a.expires_at.as_deref(), Some("2026-03-02T10:00:00Z"));
    }
}
