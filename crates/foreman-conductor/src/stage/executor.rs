use anyhow::Result;
use foreman_core::{
    meets_risk_tier, ApprovalRecord, DocUpdate, FixPlan, FixResult, FixStatus, IssueSpec,
    PipelineRequest, PullRequestRef, QaOutcome, QaVerdict, TokenUsage,
};
use foreman_policy::{required_scope, GatedConnector, Mutation};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agent::budget::TokenBudget;
use crate::agent::protocol::{task_id, AgentError, AgentResponse, AgentRole, Priority, TaskMessage};
use crate::agent::AgentSet;
use crate::stage::PipelineStage;
use crate::state::run::{PendingApproval, PipelineRun, StageResult, StageStatus};

/// Base branch used when the request names none.
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Runs one stage against a run: calls the stage's agent role, folds the typed
/// output into the run, and records a [`StageResult`].
pub struct StageExecutor {
    agents: AgentSet,
    connector: GatedConnector,
}

impl StageExecutor {
    pub fn new(agents: AgentSet, connector: GatedConnector) -> Self {
        Self { agents, connector }
    }

    /// Execute `stage`. Errors are caught here and recorded as a failed
    /// stage; the returned status tells the runner whether to go on.
    pub async fn execute_stage(
        &self,
        run: &mut PipelineRun,
        stage: PipelineStage,
        request: &PipelineRequest,
    ) -> StageStatus {
        let mut result = StageResult::started(stage);
        run.current_stage = Some(stage);
        run.stages.insert(result.clone());
        let before = run.total_tokens;

        let outcome = match stage {
            PipelineStage::Audit => self.audit(run, request).await,
            PipelineStage::Issues => self.triage(run, request).await,
            PipelineStage::Plans => self.plan(run, request).await,
            PipelineStage::Fixes => self.fix(run, request).await,
            PipelineStage::Qa => self.review(run, request).await,
            PipelineStage::Docs => self.document(run, request).await,
        };

        let (status, error) = match outcome {
            Ok(status) => (status, None),
            Err(e) => {
                warn!(run_id = %run.id, %stage, error = %format!("{e:#}"), "stage failed");
                (StageStatus::Failed, Some(format!("{e:#}")))
            }
        };

        result.tokens = TokenUsage::new(
            run.total_tokens.input.saturating_sub(before.input),
            run.total_tokens.output.saturating_sub(before.output),
        );
        result.finish(status, error);
        info!(
            run_id = %run.id,
            %stage,
            status = ?status,
            duration_ms = result.duration_ms.unwrap_or(0),
            "stage finished"
        );
        run.stages.insert(result);
        status
    }

    /// Send one task and account for its tokens.
    async fn call(
        &self,
        run: &mut PipelineRun,
        stage: PipelineStage,
        item: &str,
        task_type: &str,
        input: Value,
        priority: Priority,
    ) -> Result<AgentResponse, AgentError> {
        let role = AgentRole::for_stage(stage);
        let task = TaskMessage::request(task_id(&run.id, stage, item), role, task_type, input, priority);
        debug!(run_id = %run.id, %stage, %role, task_type, task_id = %task.id, "dispatching task");

        let response = self
            .agents
            .for_role(role)
            .handle(&task)
            .await
            .map_err(|e| AgentError::Transport {
                role,
                message: format!("{e:#}"),
            })?;

        if response.success {
            if let Some(tokens) = response.tokens_used {
                run.total_tokens.add(tokens);
            }
        }
        Ok(response)
    }

    // ── audit ──

    async fn audit(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        let input = json!({
            "repo": request.repo,
            "branch": request.branch,
            "targets": request.targets,
            "context": request.context,
        });
        let response = self
            .call(run, PipelineStage::Audit, "audit", "audit", input, Priority::Normal)
            .await?;
        let found: Vec<IssueSpec> = response.field("issues")?;

        let mut added = 0;
        for issue in found {
            if run.issue(&issue.id).is_none() {
                run.issues.push(issue);
                added += 1;
            }
        }
        debug!(run_id = %run.id, added, "audit collected issues");
        Ok(StageStatus::Completed)
    }

    // ── issues ──

    async fn triage(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        let input = json!({
            "repo": request.repo,
            "issues": run.issues,
            "issueIds": request.issue_ids,
        });
        let response = self
            .call(run, PipelineStage::Issues, "triage", "triage_issues", input, Priority::Normal)
            .await?;
        let triaged: Vec<IssueSpec> = response.field("issues")?;

        let total = triaged.len();
        let mut kept: Vec<IssueSpec> = triaged
            .into_iter()
            .filter(|i| meets_risk_tier(request.max_risk_tier, i.risk_tier))
            .filter(|i| request.issue_ids.is_empty() || request.issue_ids.contains(&i.id))
            .collect();
        kept.sort_by_key(|i| i.severity);

        if kept.len() < total {
            info!(
                run_id = %run.id,
                dropped = total - kept.len(),
                ceiling = %request.max_risk_tier,
                "issues dropped by triage filter"
            );
        }
        run.issues = kept;
        Ok(StageStatus::Completed)
    }

    // ── plans ──

    async fn plan(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        let mut budget = TokenBudget::new(request.token_budget, run.total_tokens);
        let issues = run.issues.clone();

        for issue in &issues {
            if run.plans.iter().any(|p| p.issue_id == issue.id) {
                continue;
            }
            if budget.is_exhausted() {
                info!(run_id = %run.id, spent = budget.spent(), "token budget exhausted, planning stopped");
                run.budget_exhausted = true;
                break;
            }
            let input = json!({ "repo": request.repo, "issue": issue });
            let response = self
                .call(
                    run,
                    PipelineStage::Plans,
                    &issue.id,
                    "plan_fix",
                    input,
                    issue.severity.into(),
                )
                .await?;
            if let Some(tokens) = response.tokens_used {
                budget.record(tokens);
            }
            let mut plan: FixPlan = response.field("plan")?;
            plan.issue_id = issue.id.clone();
            plan.id = unique_id(&plan.id, &issue.id, |id| run.plan(id).is_some());
            run.plans.push(plan);
        }
        Ok(StageStatus::Completed)
    }

    // ── fixes ──

    async fn fix(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        let approval = request.approval.as_ref().filter(|a| a.run_id == run.id);
        run.pending_approvals.clear();
        let plans = run.plans.clone();

        for plan in &plans {
            let existing = run.fixes.iter().position(|f| f.plan_id == plan.id);
            if let Some(idx) = existing {
                if run.fixes[idx].status.is_settled() {
                    continue;
                }
            }

            let dry_run = plan.risk_tier.requires_approval()
                && !meets_risk_tier(request.auto_approve_tier, plan.risk_tier);

            let mut fix = match existing {
                // Paused earlier: the coder already produced the change.
                Some(idx) => run.fixes[idx].clone(),
                None => {
                    let severity = run.issue(&plan.issue_id).map(|i| i.severity);
                    let input = json!({
                        "repo": request.repo,
                        "plan": plan,
                        "issue": run.issue(&plan.issue_id),
                        "dryRun": dry_run,
                    });
                    let response = self
                        .call(
                            run,
                            PipelineStage::Fixes,
                            &plan.id,
                            "apply_fix",
                            input,
                            severity.map(Priority::from).unwrap_or(Priority::Normal),
                        )
                        .await?;
                    let mut fix: FixResult = response.field("result")?;
                    fix.plan_id = plan.id.clone();
                    fix.issue_id = plan.issue_id.clone();
                    fix.id =
                        unique_id(&fix.id, &plan.id, |id| run.fixes.iter().any(|f| f.id == id));
                    fix
                }
            };
            fix.dry_run = dry_run;

            if dry_run {
                info!(run_id = %run.id, plan_id = %plan.id, tier = %plan.risk_tier, "plan above auto-approve tier, dry run");
                // Failed and skipped results are kept as the coder reported them.
                if matches!(fix.status, FixStatus::Applied | FixStatus::AwaitingApproval) {
                    fix.status = FixStatus::DryRun;
                }
            } else if !fix.changes.is_empty()
                && matches!(fix.status, FixStatus::Applied | FixStatus::AwaitingApproval)
            {
                let pending = self
                    .dispatch(&run.id, request, plan, &mut fix, approval)
                    .await;
                run.pending_approvals.extend(pending);
            }

            match existing {
                Some(idx) => run.fixes[idx] = fix,
                None => run.fixes.push(fix),
            }
        }

        if run.pending_approvals.is_empty() {
            Ok(StageStatus::Completed)
        } else {
            Ok(StageStatus::WaitingApproval)
        }
    }

    /// Push a fix through the gate: branch, commit, pull request. Operations
    /// recorded in `applied_operations` are not repeated.
    async fn dispatch(
        &self,
        run_id: &str,
        request: &PipelineRequest,
        plan: &FixPlan,
        fix: &mut FixResult,
        approval: Option<&ApprovalRecord>,
    ) -> Option<PendingApproval> {
        let branch = fix
            .branch
            .clone()
            .unwrap_or_else(|| format!("foreman/{run_id}/{}", plan.id));
        let base = request
            .branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string());
        let message = fix
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("fix({}): {}", plan.issue_id, plan.summary));
        fix.branch = Some(branch.clone());

        let mut body = plan.summary.clone();
        for step in &plan.steps {
            body.push_str(&format!("\n- {step}"));
        }

        let mutations = [
            Mutation::CreateBranch {
                repo: request.repo.clone(),
                branch: branch.clone(),
                from_ref: base.clone(),
            },
            Mutation::PushCommit {
                repo: request.repo.clone(),
                branch: branch.clone(),
                message: message.clone(),
                files: fix.changes.clone(),
            },
            Mutation::CreatePullRequest {
                repo: request.repo.clone(),
                head: branch,
                base,
                title: message.lines().next().unwrap_or_default().to_string(),
                body,
            },
        ];

        for mutation in &mutations {
            let operation = mutation.operation_name();
            if fix.applied_operations.iter().any(|op| op == operation) {
                continue;
            }
            let outcome = self.connector.execute(mutation, approval).await;

            if outcome.denied() {
                fix.status = FixStatus::AwaitingApproval;
                fix.error = outcome.error.clone();
                return Some(PendingApproval {
                    fix_id: fix.id.clone(),
                    plan_id: plan.id.clone(),
                    operation: operation.to_string(),
                    required_scope: required_scope(operation),
                    reason: outcome.policy_decision.message(),
                });
            }
            if !outcome.success {
                fix.status = FixStatus::Failed;
                fix.error = outcome.error;
                return None;
            }

            fix.applied_operations.push(operation.to_string());
            if let (Mutation::CreatePullRequest { .. }, Some(data)) = (mutation, outcome.data) {
                fix.pull_request = serde_json::from_value::<PullRequestRef>(data).ok();
            }
        }

        fix.status = FixStatus::Applied;
        fix.error = None;
        None
    }

    // ── qa ──

    async fn review(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        // Blocked verdicts are re-reviewed on resume.
        run.verdicts.retain(|v| v.outcome != QaOutcome::Blocked);
        let fixes = run.fixes.clone();

        for fix in &fixes {
            if !matches!(fix.status, FixStatus::Applied | FixStatus::DryRun) {
                continue;
            }
            if run.verdicts.iter().any(|v| v.fix_id == fix.id) {
                continue;
            }
            let input = json!({
                "repo": request.repo,
                "fix": fix,
                "plan": run.plan(&fix.plan_id),
            });
            let response = self
                .call(run, PipelineStage::Qa, &fix.id, "review_fix", input, Priority::Normal)
                .await?;
            let mut verdict: QaVerdict = response.field("verdict")?;
            verdict.fix_id = fix.id.clone();
            verdict.plan_id = fix.plan_id.clone();
            verdict.issue_id = fix.issue_id.clone();
            run.verdicts.push(verdict);
        }

        if run.verdicts.iter().any(|v| v.outcome == QaOutcome::Blocked) {
            Ok(StageStatus::Blocked)
        } else {
            Ok(StageStatus::Completed)
        }
    }

    // ── docs ──

    async fn document(&self, run: &mut PipelineRun, request: &PipelineRequest) -> Result<StageStatus> {
        let input = json!({
            "repo": request.repo,
            "issues": run.issues,
            "fixes": run.fixes,
        });
        let response = self
            .call(run, PipelineStage::Docs, "docs", "update_docs", input, Priority::Low)
            .await?;
        let updates: Vec<DocUpdate> = response.field("updates")?;
        run.docs.extend(updates);
        Ok(StageStatus::Completed)
    }
}

/// Keep an agent-chosen id unless it is already taken in this run; then
/// scope it by `owner` (the issue or plan it belongs to).
fn unique_id(candidate: &str, owner: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = if candidate.is_empty() {
        owner.to_string()
    } else {
        candidate.to_string()
    };
    if !taken(&base) {
        return base;
    }
    let scoped = format!("{owner}-{base}");
    if !taken(&scoped) {
        return scoped;
    }
    (2..)
        .map(|n| format!("{scoped}-{n}"))
        .find(|id| !taken(id))
        .unwrap_or(scoped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{MockAgent, MOCK_TOKENS};
    use crate::state::run::RunStatus;
    use foreman_core::{PipelineType, RiskTier, ScopeToken};
    use foreman_policy::RecordingConnector;
    use std::sync::Arc;

    fn request(pipeline_type: PipelineType) -> PipelineRequest {
        PipelineRequest {
            pipeline_id: "run-1".into(),
            pipeline_type,
            repo: "acme/widgets".into(),
            branch: None,
            targets: vec![],
            max_risk_tier: RiskTier::R1,
            auto_approve_tier: RiskTier::R0,
            token_budget: None,
            issue_ids: vec![],
            context: None,
            approval: None,
        }
    }

    fn issue(id: &str, severity: &str, tier: &str) -> Value {
        json!({"id": id, "title": id, "severity": severity, "riskTier": tier})
    }

    fn plan(id: &str, issue_id: &str, tier: RiskTier) -> FixPlan {
        FixPlan {
            id: id.into(),
            issue_id: issue_id.into(),
            summary: format!("fix {issue_id}"),
            steps: vec![],
            files: vec!["src/lib.rs".into()],
            risk_tier: tier,
        }
    }

    struct Harness {
        agent: Arc<MockAgent>,
        connector: Arc<RecordingConnector>,
        executor: StageExecutor,
    }

    fn harness() -> Harness {
        let agent = Arc::new(MockAgent::new());
        let connector = Arc::new(RecordingConnector::new());
        let executor = StageExecutor::new(
            AgentSet::uniform(agent.clone()),
            GatedConnector::new(connector.clone()),
        );
        Harness {
            agent,
            connector,
            executor,
        }
    }

    fn running(req: PipelineRequest) -> PipelineRun {
        let mut run = PipelineRun::new(req);
        run.transition(RunStatus::Running).unwrap();
        run
    }

    #[tokio::test]
    async fn issues_are_risk_filtered_and_severity_sorted() {
        let h = harness();
        h.agent.respond(
            "triage_issues",
            json!({"issues": [
                issue("low-1", "low", "R0"),
                issue("crit-risky", "critical", "R3"),
                issue("high-1", "high", "R1"),
                issue("crit-1", "critical", "R0"),
                issue("info-1", "info", "R1"),
            ]}),
        );
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());

        let status = h.executor.execute_stage(&mut run, PipelineStage::Issues, &req).await;
        assert_eq!(status, StageStatus::Completed);
        let ids: Vec<&str> = run.issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["crit-1", "high-1", "low-1", "info-1"]);
        assert!(run
            .issues
            .iter()
            .all(|i| meets_risk_tier(req.max_risk_tier, i.risk_tier)));
    }

    #[tokio::test]
    async fn audit_appends_without_duplicates() {
        let h = harness();
        h.agent
            .respond("audit", json!({"issues": [issue("A", "low", "R0"), issue("B", "low", "R0")]}));
        h.agent
            .respond("audit", json!({"issues": [issue("B", "low", "R0"), issue("C", "high", "R0")]}));
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());

        h.executor.execute_stage(&mut run, PipelineStage::Audit, &req).await;
        h.executor.execute_stage(&mut run, PipelineStage::Audit, &req).await;
        assert_eq!(run.issues.len(), 3);
        assert_eq!(run.stages.len(), 1);
    }

    #[tokio::test]
    async fn agent_error_fails_stage_with_message() {
        let h = harness();
        h.agent.fail("audit", "connection reset");
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());

        let status = h.executor.execute_stage(&mut run, PipelineStage::Audit, &req).await;
        assert_eq!(status, StageStatus::Failed);
        let result = run.stages.get(PipelineStage::Audit).unwrap();
        assert!(result.error.as_deref().unwrap().contains("connection reset"));
        assert!(result.completed_at.is_some());
    }

    #[tokio::test]
    async fn unsuccessful_response_fails_stage_without_tokens() {
        let h = harness();
        let mut resp = AgentResponse::failed("model overloaded");
        resp.tokens_used = Some(TokenUsage::new(100, 100));
        h.agent.respond_with("update_docs", resp);
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());

        let status = h.executor.execute_stage(&mut run, PipelineStage::Docs, &req).await;
        assert_eq!(status, StageStatus::Failed);
        assert_eq!(run.total_tokens, TokenUsage::default());
    }

    #[tokio::test]
    async fn missing_output_field_fails_stage() {
        let h = harness();
        h.agent.respond("audit", json!({"findings": []}));
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());

        let status = h.executor.execute_stage(&mut run, PipelineStage::Audit, &req).await;
        assert_eq!(status, StageStatus::Failed);
        let err = run.stages.get(PipelineStage::Audit).unwrap().error.clone().unwrap();
        assert!(err.contains("issues"), "{err}");
    }

    #[tokio::test]
    async fn stage_result_carries_token_delta() {
        let h = harness();
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());
        run.total_tokens = TokenUsage::new(1000, 1000);

        h.executor.execute_stage(&mut run, PipelineStage::Audit, &req).await;
        assert_eq!(run.stages.get(PipelineStage::Audit).unwrap().tokens, MOCK_TOKENS);
        assert_eq!(run.total_tokens, TokenUsage::new(1010, 1005));
    }

    #[tokio::test]
    async fn budget_stops_planning_early() {
        let h = harness();
        let mut req = request(PipelineType::Full);
        // Each mock call costs 15 tokens.
        req.token_budget = Some(30);
        let mut run = running(req.clone());
        for id in ["A", "B", "C", "D"] {
            run.issues.push(serde_json::from_value(issue(id, "low", "R0")).unwrap());
        }

        let status = h.executor.execute_stage(&mut run, PipelineStage::Plans, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.plans.len(), 2);
        assert!(run.budget_exhausted);
    }

    #[tokio::test]
    async fn budget_already_spent_plans_nothing() {
        let h = harness();
        let mut req = request(PipelineType::Full);
        req.token_budget = Some(10);
        let mut run = running(req.clone());
        run.total_tokens = TokenUsage::new(10, 0);
        run.issues.push(serde_json::from_value(issue("A", "low", "R0")).unwrap());

        h.executor.execute_stage(&mut run, PipelineStage::Plans, &req).await;
        assert!(run.plans.is_empty());
        assert!(h.agent.calls_for("plan_fix").is_empty());
    }

    #[tokio::test]
    async fn high_risk_plan_runs_dry_without_mutations() {
        let h = harness();
        let req = request(PipelineType::TargetedFix);
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "SEC-1", RiskTier::R2));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.fixes.len(), 1);
        assert!(run.fixes[0].dry_run);
        assert_eq!(run.fixes[0].status, FixStatus::DryRun);
        assert!(h.connector.applied().is_empty());

        let sent = &h.agent.calls_for("apply_fix")[0];
        assert_eq!(sent.payload.input["dryRun"], true);
    }

    #[tokio::test]
    async fn low_risk_fix_without_approval_waits() {
        let h = harness();
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R0));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::WaitingApproval);
        assert_eq!(run.fixes[0].status, FixStatus::AwaitingApproval);
        assert_eq!(run.pending_approvals.len(), 1);
        assert_eq!(run.pending_approvals[0].operation, "createBranch");
        assert_eq!(run.pending_approvals[0].required_scope, Some(ScopeToken::Push));
        assert!(h.connector.applied().is_empty());
    }

    #[tokio::test]
    async fn approved_fix_opens_pull_request() {
        let h = harness();
        let mut req = request(PipelineType::Full);
        req.approval = Some(ApprovalRecord::new(
            "run-1",
            "alice",
            [ScopeToken::Push, ScopeToken::OpenPr],
        ));
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R1));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::Completed);
        let fix = &run.fixes[0];
        assert_eq!(fix.status, FixStatus::Applied);
        assert_eq!(fix.branch.as_deref(), Some("foreman/run-1/p1"));
        assert!(fix.pull_request.is_some());
        let ops: Vec<&str> = h.connector.applied().iter().map(|m| m.operation_name()).collect();
        assert_eq!(ops, vec!["createBranch", "pushCommit", "createPullRequest"]);
    }

    #[tokio::test]
    async fn partial_scope_stops_at_pull_request() {
        let h = harness();
        let mut req = request(PipelineType::Full);
        req.approval = Some(ApprovalRecord::new("run-1", "alice", [ScopeToken::Push]));
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R0));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::WaitingApproval);
        assert_eq!(run.fixes[0].applied_operations, vec!["createBranch", "pushCommit"]);
        assert_eq!(run.pending_approvals[0].required_scope, Some(ScopeToken::OpenPr));

        // Re-running with the missing scope only opens the pull request.
        req.approval = Some(ApprovalRecord::new("run-1", "alice", [ScopeToken::OpenPr]));
        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(h.connector.applied().len(), 3);
        assert_eq!(h.agent.calls_for("apply_fix").len(), 1);
        assert!(run.pending_approvals.is_empty());
    }

    #[tokio::test]
    async fn approval_for_other_run_is_ignored() {
        let h = harness();
        let mut req = request(PipelineType::Full);
        req.approval = Some(ApprovalRecord::new(
            "someone-else",
            "alice",
            [ScopeToken::Push, ScopeToken::OpenPr],
        ));
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R0));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::WaitingApproval);
        assert!(h.connector.applied().is_empty());
    }

    #[tokio::test]
    async fn connector_error_fails_fix_not_stage() {
        let h = harness();
        h.connector.fail_operation("pushCommit", "403 protected branch");
        let mut req = request(PipelineType::Full);
        req.approval = Some(ApprovalRecord::new(
            "run-1",
            "alice",
            [ScopeToken::Push, ScopeToken::OpenPr],
        ));
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R0));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.fixes[0].status, FixStatus::Failed);
        assert!(run.fixes[0].error.as_deref().unwrap().contains("protected"));
    }

    #[tokio::test]
    async fn blocked_verdict_blocks_stage() {
        let h = harness();
        h.agent.respond(
            "review_fix",
            json!({"verdict": {"id": "v1", "fixId": "x", "planId": "x", "issueId": "x", "outcome": "blocked"}}),
        );
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "A", RiskTier::R2));
        h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;

        let status = h.executor.execute_stage(&mut run, PipelineStage::Qa, &req).await;
        assert_eq!(status, StageStatus::Blocked);
        assert_eq!(run.verdicts[0].fix_id, run.fixes[0].id);

        // A second review replaces the blocked verdict.
        let status = h.executor.execute_stage(&mut run, PipelineStage::Qa, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.verdicts.len(), 1);
        assert_eq!(run.verdicts[0].outcome, QaOutcome::Passed);
    }

    #[tokio::test]
    async fn docs_collects_updates() {
        let h = harness();
        let req = request(PipelineType::DocsRefresh);
        let mut run = running(req.clone());

        let status = h.executor.execute_stage(&mut run, PipelineStage::Docs, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.docs.len(), 1);
        assert_eq!(run.current_stage, Some(PipelineStage::Docs));
    }

    #[tokio::test]
    async fn dry_run_keeps_coder_failure() {
        let h = harness();
        h.agent.respond(
            "apply_fix",
            json!({"result": {"id": "f1", "planId": "p1", "issueId": "SEC-1", "status": "failed", "error": "could not compile"}}),
        );
        let req = request(PipelineType::Full);
        let mut run = running(req.clone());
        run.plans.push(plan("p1", "SEC-1", RiskTier::R2));

        let status = h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(status, StageStatus::Completed);
        assert_eq!(run.fixes[0].status, FixStatus::Failed);
        assert!(run.fixes[0].dry_run);

        h.executor.execute_stage(&mut run, PipelineStage::Qa, &req).await;
        assert!(run.verdicts.is_empty());
        assert!(h.agent.calls_for("review_fix").is_empty());
    }

    #[tokio::test]
    async fn repeated_agent_ids_are_scoped_per_issue() {
        let h = harness();
        for _ in 0..2 {
            h.agent.respond(
                "plan_fix",
                json!({"plan": {"id": "plan-1", "issueId": "?", "summary": "s", "files": ["a.rs"], "riskTier": "R0"}}),
            );
            h.agent.respond(
                "apply_fix",
                json!({"result": {"id": "fix-1", "planId": "?", "issueId": "?", "status": "applied",
                                  "changes": [{"path": "a.rs", "content": "x"}]}}),
            );
        }
        let mut req = request(PipelineType::Full);
        req.approval = Some(ApprovalRecord::new(
            "run-1",
            "alice",
            [ScopeToken::Push, ScopeToken::OpenPr],
        ));
        let mut run = running(req.clone());
        for id in ["A", "B"] {
            run.issues.push(serde_json::from_value(issue(id, "low", "R0")).unwrap());
        }

        h.executor.execute_stage(&mut run, PipelineStage::Plans, &req).await;
        let plan_ids: Vec<&str> = run.plans.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(plan_ids, vec!["plan-1", "B-plan-1"]);

        h.executor.execute_stage(&mut run, PipelineStage::Fixes, &req).await;
        assert_eq!(run.fixes.len(), 2);
        assert_eq!(h.agent.calls_for("apply_fix").len(), 2);
        assert_eq!(run.fixes[1].id, "B-plan-1-fix-1");
        assert_ne!(run.fixes[0].branch, run.fixes[1].branch);
        assert!(run.fixes.iter().all(|f| f.status == FixStatus::Applied));
    }

    #[test]
    fn unique_id_falls_back_to_counter() {
        let taken = ["x", "o-x", "o-x-2"];
        assert_eq!(unique_id("y", "o", |id| taken.contains(&id)), "y");
        assert_eq!(unique_id("x", "o", |id| taken.contains(&id)), "o-x-3");
        assert_eq!(unique_id("", "o", |id| taken.contains(&id)), "o");
    }
}
