use anyhow::Result;
use foreman_core::ApprovalRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::gate::{PolicyDecision, PolicyGate};
use crate::mutation::Mutation;

/// External system that performs mutations (GitHub, GitLab, an outbox, ...).
/// Never called directly by the pipeline; see [`GatedConnector`].
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn apply(&self, mutation: &Mutation) -> Result<serde_json::Value>;
}

/// Result of a gated mutation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub policy_decision: PolicyDecision,
}

impl MutationOutcome {
    /// True when the gate refused the mutation (as opposed to a connector error).
    pub fn denied(&self) -> bool {
        !self.policy_decision.allowed
    }
}

/// Pairs a connector with the policy gate. The connector is only invoked
/// after the gate allows the mutation under the same approval.
#[derive(Clone)]
pub struct GatedConnector {
    gate: PolicyGate,
    inner: Arc<dyn Connector>,
}

impl GatedConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            gate: PolicyGate::new(),
            inner,
        }
    }

    pub fn gate(&self) -> &PolicyGate {
        &self.gate
    }

    pub async fn execute(
        &self,
        mutation: &Mutation,
        approval: Option<&ApprovalRecord>,
    ) -> MutationOutcome {
        let operation = mutation.operation_name();
        let decision = self
            .gate
            .check(operation, mutation.operation_type(), approval);

        if !decision.allowed {
            warn!(operation, repo = mutation.repo(), reason = %decision.reason, "mutation denied");
            return MutationOutcome {
                success: false,
                data: None,
                error: Some(decision.message()),
                policy_decision: decision,
            };
        }

        debug!(operation, repo = mutation.repo(), "dispatching mutation");
        match self.inner.apply(mutation).await {
            Ok(data) => {
                info!(operation, repo = mutation.repo(), "mutation applied");
                MutationOutcome {
                    success: true,
                    data: Some(data),
                    error: None,
                    policy_decision: decision,
                }
            }
            Err(e) => {
                warn!(operation, repo = mutation.repo(), error = %e, "mutation failed");
                MutationOutcome {
                    success: false,
                    data: None,
                    error: Some(format!("{e:#}")),
                    policy_decision: decision,
                }
            }
        }
    }
}

/// In-memory connector: records every applied mutation and can be told to
/// fail specific operations. Used by tests and dry environments.
pub struct RecordingConnector {
    applied: Mutex<Vec<Mutation>>,
    failures: Mutex<HashMap<String, String>>,
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make every future call to `operation` fail with `error`.
    pub fn fail_operation(&self, operation: &str, error: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), error.to_string());
    }

    pub fn applied(&self) -> Vec<Mutation> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Connector for RecordingConnector {
    async fn apply(&self, mutation: &Mutation) -> Result<serde_json::Value> {
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mutation.operation_name())
            .cloned();
        if let Some(error) = failure {
            anyhow::bail!("{error}");
        }
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        applied.push(mutation.clone());
        let data = match mutation {
            Mutation::CreatePullRequest { repo, .. } => {
                let number = applied.len() as u64;
                serde_json::json!({
                    "number": number,
                    "url": format!("https://example.invalid/{repo}/pull/{number}"),
                })
            }
            _ => serde_json::json!({ "ok": true }),
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::DecisionReason;
    use foreman_core::ScopeToken;

    fn branch() -> Mutation {
        Mutation::CreateBranch {
            repo: "acme/widgets".into(),
            branch: "foreman/fix".into(),
            from_ref: "main".into(),
        }
    }

    #[tokio::test]
    async fn denied_mutation_never_reaches_connector() {
        let rec = Arc::new(RecordingConnector::new());
        let gated = GatedConnector::new(rec.clone());

        let outcome = gated.execute(&branch(), None).await;
        assert!(!outcome.success);
        assert!(outcome.denied());
        assert!(rec.applied().is_empty());
    }

    #[tokio::test]
    async fn approved_mutation_is_applied() {
        let rec = Arc::new(RecordingConnector::new());
        let gated = GatedConnector::new(rec.clone());
        let approval = ApprovalRecord::new("run-1", "alice", [ScopeToken::Push]);

        let outcome = gated.execute(&branch(), Some(&approval)).await;
        assert!(outcome.success);
        assert!(matches!(
            outcome.policy_decision.reason,
            DecisionReason::Approved { .. }
        ));
        assert_eq!(rec.applied(), vec![branch()]);
    }

    #[tokio::test]
    async fn non_destructive_needs_no_approval() {
        let rec = Arc::new(RecordingConnector::new());
        let gated = GatedConnector::new(rec.clone());
        let comment = Mutation::PostComment {
            repo: "acme/widgets".into(),
            number: 7,
            body: "triaged".into(),
        };
        let outcome = gated.execute(&comment, None).await;
        assert!(outcome.success);
        assert!(!outcome.policy_decision.requires_approval);
    }

    #[tokio::test]
    async fn connector_error_is_not_a_denial() {
        let rec = Arc::new(RecordingConnector::new());
        rec.fail_operation("createBranch", "422 reference already exists");
        let gated = GatedConnector::new(rec.clone());
        let approval = ApprovalRecord::new("run-1", "alice", [ScopeToken::Push]);

        let outcome = gated.execute(&branch(), Some(&approval)).await;
        assert!(!outcome.success);
        assert!(!outcome.denied());
        assert!(outcome.error.unwrap().contains("already exists"));
    }
}
