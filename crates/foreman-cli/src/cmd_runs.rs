use anyhow::{bail, Result};
use foreman_conductor::runner::event_log::{Event, EventLogger};
use foreman_conductor::runner::PipelineResponse;
use foreman_conductor::state::persist::{load_runs, save_runs};
use foreman_conductor::state::run::{PipelineRun, StageStatus};
use foreman_conductor::state::table::RunTable;

use crate::cmd_run::print_response;
use crate::config::Config;

/// Execute `foreman status [run-id]`
pub fn status(config: &Config, run_id: Option<&str>, json: bool) -> Result<()> {
    let runs = load_runs(&config.state_dir())?;

    if let Some(id) = run_id {
        let Some(run) = runs.iter().find(|r| r.id == id) else {
            bail!("run \"{id}\" not found");
        };
        let resp = PipelineResponse::from_run(run);
        if json {
            println!("{}", serde_json::to_string_pretty(&resp)?);
        } else {
            print_response(&resp);
        }
        return Ok(());
    }

    if json {
        let all: Vec<PipelineResponse> = runs.iter().map(PipelineResponse::from_run).collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    for run in &runs {
        println!("{}", status_line(run));
    }
    Ok(())
}

fn status_line(run: &PipelineRun) -> String {
    let state = match run.paused_at() {
        Some(stage) => format!("paused at {stage}"),
        None => run.status.as_str().to_string(),
    };
    let done = run
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Completed)
        .count();
    format!(
        "{:<24} {:<14} {:<20} {done}/{} stages  {}",
        run.id,
        run.request.pipeline_type.as_str(),
        state,
        run.stages.len(),
        run.request.repo
    )
}

/// Execute `foreman cancel <run-id>`. Only runs persisted as running can be
/// cancelled; a process still driving the run stops at its next stage.
pub fn cancel(config: &Config, run_id: &str) -> Result<()> {
    let state_dir = config.state_dir();
    let table = RunTable::new();
    table.restore(load_runs(&state_dir)?);

    let Some(run) = table.get(run_id) else {
        bail!("run \"{run_id}\" not found");
    };
    if !table.cancel(run_id) {
        println!(
            "Run \"{run_id}\" is {}; nothing to cancel.",
            run.status.as_str()
        );
        return Ok(());
    }
    save_runs(&state_dir, &table.changed())?;

    let stages_completed = run
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Completed)
        .count();
    EventLogger::new(Some(&state_dir), run_id).record(Event::RunCancelled { stages_completed });
    println!("Run \"{run_id}\" cancelled.");
    Ok(())
}
