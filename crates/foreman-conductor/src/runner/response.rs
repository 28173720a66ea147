use foreman_core::clock::{elapsed_ms, now_rfc3339};
use foreman_core::{DocUpdate, FixPlan, FixResult, FixStatus, IssueSpec, QaOutcome, QaVerdict, TokenUsage};
use serde::{Deserialize, Serialize};

use crate::stage::PipelineStage;
use crate::state::run::{PendingApproval, PipelineRun, RunStatus, StageResult};

/// Counts over a run's artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub issues_found: usize,
    pub issues_fixed: usize,
    pub fixes_failed: usize,
    /// Skipped and dry-run fixes.
    pub fixes_skipped: usize,
    pub awaiting_approval: usize,
    pub verdicts_passed: usize,
    pub docs_updated: usize,
    pub budget_exhausted: bool,
}

impl RunSummary {
    pub fn of(run: &PipelineRun) -> Self {
        let count = |pred: fn(&FixResult) -> bool| run.fixes.iter().filter(|f| pred(f)).count();
        Self {
            issues_found: run.issues.len(),
            issues_fixed: count(|f| f.status == FixStatus::Applied),
            fixes_failed: count(|f| f.status == FixStatus::Failed),
            fixes_skipped: count(|f| matches!(f.status, FixStatus::Skipped | FixStatus::DryRun)),
            awaiting_approval: count(|f| f.status == FixStatus::AwaitingApproval),
            verdicts_passed: run
                .verdicts
                .iter()
                .filter(|v| v.outcome == QaOutcome::Passed)
                .count(),
            docs_updated: run.docs.len(),
            budget_exhausted: run.budget_exhausted,
        }
    }
}

/// Aggregate returned to callers for every run, whatever its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub run_id: String,
    pub pipeline_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<PipelineStage>,
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    pub issues: Vec<IssueSpec>,
    pub plans: Vec<FixPlan>,
    pub fixes: Vec<FixResult>,
    pub verdicts: Vec<QaVerdict>,
    pub docs: Vec<DocUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_approvals: Vec<PendingApproval>,
    pub summary: RunSummary,
    pub total_tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResponse {
    pub fn from_run(run: &PipelineRun) -> Self {
        // A paused run has no completion stamp yet; report time so far.
        let duration_ms = run.started_at.as_deref().and_then(|start| {
            let end = run.completed_at.clone().unwrap_or_else(now_rfc3339);
            elapsed_ms(start, &end)
        });
        Self {
            run_id: run.id.clone(),
            pipeline_id: run.request.pipeline_id.clone(),
            status: run.status,
            paused_at: run.paused_at(),
            stages: run.stages.to_vec(),
            issues: run.issues.clone(),
            plans: run.plans.clone(),
            fixes: run.fixes.clone(),
            verdicts: run.verdicts.clone(),
            docs: run.docs.clone(),
            pending_approvals: run.pending_approvals.clone(),
            summary: RunSummary::of(run),
            total_tokens: run.total_tokens,
            duration_ms,
            error: run.error.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}
