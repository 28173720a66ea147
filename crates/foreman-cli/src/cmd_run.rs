use anyhow::{bail, Context, Result};
use foreman_conductor::runner::notify::StdoutNotifier;
use foreman_conductor::runner::{Foreman, PipelineResponse};
use foreman_conductor::state::run::RunStatus;
use foreman_conductor::state::table::RunTable;
use foreman_core::{ApprovalRecord, PipelineRequest};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::outbox::OutboxConnector;

/// Execute `foreman run <request.json>`
pub fn run(request_file: &Path, config: &Config, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(request_file)
        .with_context(|| format!("reading {}", request_file.display()))?;
    let request = PipelineRequest::from_json(&content)
        .with_context(|| format!("invalid request: {}", request_file.display()))?;

    let foreman = build_foreman(config)?;
    foreman.restore()?;
    ctrlc_cancel(foreman.table().clone(), request.pipeline_id.clone());

    if !json {
        println!(
            "Starting run \"{}\" ({}) on {}",
            request.pipeline_id,
            request.pipeline_type.as_str(),
            request.repo
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    let response = rt.block_on(foreman.run_pipeline(request))?;
    foreman.persist()?;
    finish(&response, json)
}

/// Execute `foreman resume <run-id> [--approval approval.json]`
pub fn resume(run_id: &str, approval_file: Option<&Path>, config: &Config, json: bool) -> Result<()> {
    let approval = approval_file.map(load_approval).transpose()?;
    if let Some(a) = &approval {
        if a.run_id != run_id {
            bail!(
                "approval is for run \"{}\", not \"{run_id}\"; it would be ignored",
                a.run_id
            );
        }
    }

    let foreman = build_foreman(config)?;
    foreman.restore()?;
    ctrlc_cancel(foreman.table().clone(), run_id.to_string());

    let rt = tokio::runtime::Runtime::new()?;
    let response = rt.block_on(foreman.resume_run(run_id, approval))?;
    foreman.persist()?;
    finish(&response, json)
}

pub fn load_approval(path: &Path) -> Result<ApprovalRecord> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid approval: {}", path.display()))
}

fn build_foreman(config: &Config) -> Result<Foreman> {
    let agents = config.agent_set()?;
    let connector = Arc::new(OutboxConnector::new(config.outbox_path()));
    Ok(
        Foreman::new(agents, connector, Arc::new(RunTable::new()))
            .with_notifier(Arc::new(StdoutNotifier))
            .with_state_dir(config.state_dir()),
    )
}

fn finish(response: &PipelineResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        print_response(response);
    }
    if response.status == RunStatus::Failed {
        bail!(
            "run \"{}\" failed: {}",
            response.run_id,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub fn print_response(resp: &PipelineResponse) {
    let status = match resp.paused_at {
        Some(stage) => format!("paused at {stage}"),
        None => resp.status.as_str().to_string(),
    };
    let duration = resp
        .duration_ms
        .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!("Run \"{}\": {status}{duration}", resp.run_id);

    for s in &resp.stages {
        let detail = s
            .error
            .as_deref()
            .or(s.skip_reason.as_deref())
            .map(|d| format!("  {d}"))
            .unwrap_or_default();
        println!(
            "  {:<7} {:<17} {:>7} tokens{detail}",
            s.stage.as_str(),
            s.status.as_str(),
            s.tokens.total()
        );
    }

    let sum = &resp.summary;
    println!(
        "  issues: {}  fixed: {}  failed: {}  skipped: {}  awaiting approval: {}",
        sum.issues_found, sum.issues_fixed, sum.fixes_failed, sum.fixes_skipped, sum.awaiting_approval
    );
    println!(
        "  verdicts passed: {}  docs updated: {}  tokens: {} in / {} out",
        sum.verdicts_passed, sum.docs_updated, resp.total_tokens.input, resp.total_tokens.output
    );
    if sum.budget_exhausted {
        println!("  token budget exhausted; planning stopped early");
    }

    if !resp.pending_approvals.is_empty() {
        println!("  pending approvals:");
        for p in &resp.pending_approvals {
            let scope = p
                .required_scope
                .map(|s| format!(" needs `{s}`"))
                .unwrap_or_default();
            println!("    {} {}{scope}", p.fix_id, p.operation);
        }
        println!(
            "  Resume with: foreman resume {} --approval <approval.json>",
            resp.run_id
        );
    }
    if let Some(err) = &resp.error {
        println!("  error: {err}");
    }
}

/// Ctrl+C requests cooperative cancellation of `run_id`.
fn ctrlc_cancel(table: Arc<RunTable>, run_id: String) {
    let _ = ctrlc::set_handler(move || {
        table.cancel(&run_id);
    });
}
