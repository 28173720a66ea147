use anyhow::{bail, Result};
use foreman_core::clock::{elapsed_ms, now_rfc3339};
use foreman_core::{
    DocUpdate, FixPlan, FixResult, IssueSpec, PipelineRequest, QaVerdict, ScopeToken, TokenUsage,
};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::stage::PipelineStage;

// ── Status enums ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
    WaitingApproval,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Blocked => "blocked",
            StageStatus::WaitingApproval => "waiting_approval",
        }
    }

    /// Completed, failed and skipped stages are never re-entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Halts the run without failing it.
    pub fn is_pause(&self) -> bool {
        matches!(self, StageStatus::Blocked | StageStatus::WaitingApproval)
    }
}

// ── Valid run transitions ──

const VALID_TRANSITIONS: &[(RunStatus, &[RunStatus])] = &[
    (RunStatus::Pending, &[RunStatus::Running, RunStatus::Cancelled]),
    (
        RunStatus::Running,
        &[RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled],
    ),
    // Completed, Failed and Cancelled are terminal
];

fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Stage results ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: PipelineStage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Usage reported by agent calls made during this stage.
    #[serde(default)]
    pub tokens: TokenUsage,
}

impl StageResult {
    pub fn started(stage: PipelineStage) -> Self {
        Self {
            stage,
            status: StageStatus::InProgress,
            started_at: Some(now_rfc3339()),
            completed_at: None,
            duration_ms: None,
            error: None,
            skip_reason: None,
            tokens: TokenUsage::default(),
        }
    }

    pub fn skipped(stage: PipelineStage, reason: &str) -> Self {
        let now = now_rfc3339();
        Self {
            stage,
            status: StageStatus::Skipped,
            started_at: Some(now.clone()),
            completed_at: Some(now),
            duration_ms: Some(0),
            error: None,
            skip_reason: Some(reason.to_string()),
            tokens: TokenUsage::default(),
        }
    }

    /// Stamp completion with the final status.
    pub fn finish(&mut self, status: StageStatus, error: Option<String>) {
        let now = now_rfc3339();
        self.duration_ms = self
            .started_at
            .as_deref()
            .and_then(|start| elapsed_ms(start, &now));
        self.completed_at = Some(now);
        self.status = status;
        self.error = error;
    }
}

/// Stage results in execution order. Serialized as an object keyed by stage
/// name; deserialization keeps the key order of the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageMap {
    entries: Vec<StageResult>,
}

impl StageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. An overwritten stage keeps its original position.
    pub fn insert(&mut self, result: StageResult) {
        match self.entries.iter_mut().find(|r| r.stage == result.stage) {
            Some(existing) => *existing = result,
            None => self.entries.push(result),
        }
    }

    pub fn get(&self, stage: PipelineStage) -> Option<&StageResult> {
        self.entries.iter().find(|r| r.stage == stage)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageResult> {
        self.entries.iter()
    }

    pub fn stages(&self) -> Vec<PipelineStage> {
        self.entries.iter().map(|r| r.stage).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<StageResult> {
        self.entries.clone()
    }
}

impl Serialize for StageMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for r in &self.entries {
            map.serialize_entry(r.stage.as_str(), r)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageMapVisitor;

        impl<'de> Visitor<'de> for StageMapVisitor {
            type Value = StageMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object keyed by stage name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StageMap, A::Error> {
                let mut map = StageMap::new();
                while let Some((key, mut result)) = access.next_entry::<String, StageResult>()? {
                    let stage = PipelineStage::parse(&key).ok_or_else(|| {
                        serde::de::Error::custom(format!("unknown stage \"{key}\""))
                    })?;
                    result.stage = stage;
                    map.insert(result);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(StageMapVisitor)
    }
}

// ── Pending approvals ──

/// A destructive operation the gate refused, kept so callers know which
/// scope to approve before resuming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub fix_id: String,
    pub plan_id: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<ScopeToken>,
    pub reason: String,
}

// ── Run ──

/// Aggregate root for one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub request: PipelineRequest,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<PipelineStage>,
    #[serde(default)]
    pub stages: StageMap,
    #[serde(default)]
    pub issues: Vec<IssueSpec>,
    #[serde(default)]
    pub plans: Vec<FixPlan>,
    #[serde(default)]
    pub fixes: Vec<FixResult>,
    #[serde(default)]
    pub verdicts: Vec<QaVerdict>,
    #[serde(default)]
    pub docs: Vec<DocUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_approvals: Vec<PendingApproval>,
    #[serde(default)]
    pub total_tokens: TokenUsage,
    /// Set when the planning loop stopped early on the token budget.
    #[serde(default)]
    pub budget_exhausted: bool,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    /// New run in `pending`. The run id is the request's pipeline id.
    pub fn new(request: PipelineRequest) -> Self {
        Self {
            id: request.pipeline_id.clone(),
            request,
            status: RunStatus::Pending,
            current_stage: None,
            stages: StageMap::new(),
            issues: Vec::new(),
            plans: Vec::new(),
            fixes: Vec::new(),
            verdicts: Vec::new(),
            docs: Vec::new(),
            pending_approvals: Vec::new(),
            total_tokens: TokenUsage::default(),
            budget_exhausted: false,
            created_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `to`, stamping start/completion times.
    pub fn transition(&mut self, to: RunStatus) -> Result<()> {
        if !is_valid_transition(self.status, to) {
            bail!("invalid run transition: {} {:?} → {:?}", self.id, self.status, to);
        }
        self.status = to;
        match to {
            RunStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now_rfc3339());
                }
            }
            s if s.is_terminal() => self.completed_at = Some(now_rfc3339()),
            _ => {}
        }
        Ok(())
    }

    /// Nothing has been found, planned or fixed yet.
    pub fn has_no_work(&self) -> bool {
        self.issues.is_empty() && self.plans.is_empty() && self.fixes.is_empty()
    }

    /// Stage the run stopped at, if it is paused.
    pub fn paused_at(&self) -> Option<PipelineStage> {
        if self.status != RunStatus::Running {
            return None;
        }
        self.stages
            .iter()
            .rev()
            .find(|r| r.status.is_pause())
            .map(|r| r.stage)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&FixPlan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    pub fn issue(&self, issue_id: &str) -> Option<&IssueSpec> {
        self.issues.iter().find(|i| i.id == issue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{PipelineType, RiskTier};

    fn request() -> PipelineRequest {
        PipelineRequest {
            pipeline_id: "run-1".into(),
            pipeline_type: PipelineType::Full,
            repo: "acme/widgets".into(),
            branch: None,
            targets: vec![],
            max_risk_tier: RiskTier::R2,
            auto_approve_tier: RiskTier::R0,
            token_budget: None,
            issue_ids: vec![],
            context: None,
            approval: None,
        }
    }

    fn result(stage: PipelineStage, status: StageStatus) -> StageResult {
        let mut r = StageResult::started(stage);
        r.finish(status, None);
        r
    }

    #[test]
    fn new_run_is_pending() {
        let run = PipelineRun::new(request());
        assert_eq!(run.id, "run-1");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.stages.is_empty());
        assert!(run.has_no_work());
    }

    #[test]
    fn valid_transitions_stamp_times() {
        let mut run = PipelineRun::new(request());
        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_none());
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        let mut run = PipelineRun::new(request());
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        assert!(run.transition(RunStatus::Running).is_err());
        assert!(run.transition(RunStatus::Cancelled).is_err());
    }

    #[test]
    fn pending_cannot_complete_directly() {
        let mut run = PipelineRun::new(request());
        assert!(run.transition(RunStatus::Completed).is_err());
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut map = StageMap::new();
        map.insert(result(PipelineStage::Audit, StageStatus::Completed));
        map.insert(result(PipelineStage::Fixes, StageStatus::WaitingApproval));
        map.insert(result(PipelineStage::Audit, StageStatus::Failed));
        assert_eq!(map.stages(), vec![PipelineStage::Audit, PipelineStage::Fixes]);
        assert_eq!(
            map.get(PipelineStage::Audit).unwrap().status,
            StageStatus::Failed
        );
    }

    #[test]
    fn stage_map_serializes_as_object_in_order() {
        let mut map = StageMap::new();
        map.insert(result(PipelineStage::Issues, StageStatus::Completed));
        map.insert(result(PipelineStage::Plans, StageStatus::Skipped));
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.starts_with(r#"{"issues":"#), "{json}");
        let issues_pos = json.find(r#""issues":"#).unwrap();
        let plans_pos = json.find(r#""plans":"#).unwrap();
        assert!(issues_pos < plans_pos);
    }

    #[test]
    fn stage_map_roundtrip_preserves_order() {
        // Deliberately non-alphabetical to catch a sorted map sneaking in.
        let mut map = StageMap::new();
        for (stage, status) in [
            (PipelineStage::Qa, StageStatus::Completed),
            (PipelineStage::Audit, StageStatus::Completed),
            (PipelineStage::Fixes, StageStatus::Blocked),
        ] {
            map.insert(result(stage, status));
        }
        let json = serde_json::to_string(&map).unwrap();
        let restored: StageMap = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, map);
        assert_eq!(
            restored.stages(),
            vec![PipelineStage::Qa, PipelineStage::Audit, PipelineStage::Fixes]
        );
    }

    #[test]
    fn stage_map_rejects_unknown_stage() {
        let json = r#"{"deploy":{"stage":"audit","status":"completed"}}"#;
        assert!(serde_json::from_str::<StageMap>(json).is_err());
    }

    #[test]
    fn paused_at_reports_pausing_stage() {
        let mut run = PipelineRun::new(request());
        run.transition(RunStatus::Running).unwrap();
        run.stages
            .insert(result(PipelineStage::Audit, StageStatus::Completed));
        assert_eq!(run.paused_at(), None);
        run.stages
            .insert(result(PipelineStage::Fixes, StageStatus::WaitingApproval));
        assert_eq!(run.paused_at(), Some(PipelineStage::Fixes));
        run.stages.insert(result(PipelineStage::Qa, StageStatus::Blocked));
        assert_eq!(run.paused_at(), Some(PipelineStage::Qa));
        assert_eq!(
            run.stages.iter().rev().next().map(|r| r.stage),
            Some(PipelineStage::Qa)
        );
    }

    #[test]
    fn run_roundtrip_json() {
        let mut run = PipelineRun::new(request());
        run.transition(RunStatus::Running).unwrap();
        run.stages
            .insert(result(PipelineStage::Audit, StageStatus::Completed));
        run.total_tokens = TokenUsage::new(12, 4);
        let json = serde_json::to_string_pretty(&run).unwrap();
        let restored: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, run);
    }
}
