use foreman_core::{ApprovalRecord, ScopeToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Destructiveness class of an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Read,
    NonDestructive,
    Destructive,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::NonDestructive => "non-destructive",
            OperationType::Destructive => "destructive",
        }
    }
}

// ── Required scopes ──

const REQUIRED_SCOPES: &[(&str, ScopeToken)] = &[
    ("createBranch", ScopeToken::Push),
    ("pushCommit", ScopeToken::Push),
    ("commitChanges", ScopeToken::Commit),
    ("createPullRequest", ScopeToken::OpenPr),
    ("updatePullRequest", ScopeToken::OpenPr),
    ("mergePullRequest", ScopeToken::Merge),
];

/// Scope token a destructive operation needs. `None` for names outside the
/// table, which the gate always denies.
pub fn required_scope(operation: &str) -> Option<ScopeToken> {
    REQUIRED_SCOPES
        .iter()
        .find(|(name, _)| *name == operation)
        .map(|(_, token)| *token)
}

// ── Decisions ──

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DecisionReason {
    ReadOnly,
    NonDestructive,
    Approved {
        operation: String,
        scope: ScopeToken,
    },
    /// No approval supplied. Expired approvals land here too.
    ApprovalRequired {
        operation: String,
        scope: ScopeToken,
    },
    /// An approval was supplied but does not carry the required token.
    MissingScope {
        operation: String,
        required: ScopeToken,
    },
    UnknownOperation {
        operation: String,
    },
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::ReadOnly => write!(f, "read operations are always allowed"),
            DecisionReason::NonDestructive => {
                write!(f, "non-destructive operations are allowed by policy")
            }
            DecisionReason::Approved { operation, scope } => {
                write!(f, "{operation} approved under scope `{scope}`")
            }
            DecisionReason::ApprovalRequired { operation, scope } => write!(
                f,
                "{operation} is destructive and needs an approval with scope `{scope}`"
            ),
            DecisionReason::MissingScope {
                operation,
                required,
            } => write!(
                f,
                "approval does not grant scope `{required}` required by {operation}"
            ),
            DecisionReason::UnknownOperation { operation } => write!(
                f,
                "{operation} has no scope mapping; destructive operations without one are denied"
            ),
        }
    }
}

/// Gate output. Recomputed for every call, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub operation_type: OperationType,
    pub reason: DecisionReason,
}

impl PolicyDecision {
    fn allow(operation_type: OperationType, reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            requires_approval: operation_type == OperationType::Destructive,
            operation_type,
            reason,
        }
    }

    fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            requires_approval: true,
            operation_type: OperationType::Destructive,
            reason,
        }
    }

    pub fn message(&self) -> String {
        self.reason.to_string()
    }
}

// ── Gate ──

/// Stateless policy gate. Never mutates state, never calls out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyGate;

impl PolicyGate {
    pub fn new() -> Self {
        Self
    }

    pub fn check(
        &self,
        operation: &str,
        operation_type: OperationType,
        approval: Option<&ApprovalRecord>,
    ) -> PolicyDecision {
        self.check_at(operation, operation_type, approval, OffsetDateTime::now_utc())
    }

    /// [`PolicyGate::check`] against an explicit clock.
    pub fn check_at(
        &self,
        operation: &str,
        operation_type: OperationType,
        approval: Option<&ApprovalRecord>,
        now: OffsetDateTime,
    ) -> PolicyDecision {
        match operation_type {
            OperationType::Read => PolicyDecision::allow(operation_type, DecisionReason::ReadOnly),
            OperationType::NonDestructive => {
                PolicyDecision::allow(operation_type, DecisionReason::NonDestructive)
            }
            OperationType::Destructive => {
                let Some(scope) = required_scope(operation) else {
                    return PolicyDecision::deny(DecisionReason::UnknownOperation {
                        operation: operation.to_string(),
                    });
                };
                let approval = approval.filter(|a| !a.is_expired_at(now));
                match approval {
                    None => PolicyDecision::deny(DecisionReason::ApprovalRequired {
                        operation: operation.to_string(),
                        scope,
                    }),
                    Some(a) if a.grants(scope) => PolicyDecision::allow(
                        operation_type,
                        DecisionReason::Approved {
                            operation: operation.to_string(),
                            scope,
                        },
                    ),
                    Some(_) => PolicyDecision::deny(DecisionReason::MissingScope {
                        operation: operation.to_string(),
                        required: scope,
                    }),
                }
            }
        }
    }
}
