use anyhow::{bail, Result};
use foreman_core::{ApprovalRecord, PipelineRequest, PipelineType, RequestError};
use foreman_policy::{Connector, GatedConnector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentSet;
use crate::runner::event_log::{Event, EventLogger};
use crate::runner::notify::{Notifier, NullNotifier, RunNotice};
use crate::runner::response::PipelineResponse;
use crate::stage::executor::StageExecutor;
use crate::stage::{stages_for, PipelineStage};
use crate::state::persist::{load_runs, save_runs};
use crate::state::run::{PipelineRun, RunStatus, StageResult, StageStatus};
use crate::state::table::RunTable;

/// Why `stage` should not run for `run`, if it should not.
pub fn skip_reason(run: &PipelineRun, stage: PipelineStage) -> Option<&'static str> {
    if stage == PipelineStage::Docs && run.request.pipeline_type == PipelineType::SecurityScan {
        return Some("security scans do not update docs");
    }
    if !stage.is_discovery() && run.has_no_work() {
        return Some("no issues, plans or fixes to work on");
    }
    None
}

/// Pipeline runner. Owns the stage loop; runs live in the shared [`RunTable`].
pub struct Foreman {
    executor: StageExecutor,
    table: Arc<RunTable>,
    notifier: Arc<dyn Notifier>,
    state_dir: Option<PathBuf>,
}

impl Foreman {
    pub fn new(agents: AgentSet, connector: Arc<dyn Connector>, table: Arc<RunTable>) -> Self {
        Self {
            executor: StageExecutor::new(agents, GatedConnector::new(connector)),
            table,
            notifier: Arc::new(NullNotifier),
            state_dir: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Persist the run table and event logs under `state_dir`.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    pub fn table(&self) -> &Arc<RunTable> {
        &self.table
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Validate, admit and drive a new run. Only validation and admission
    /// errors are returned as `Err`; stage failures come back in the response.
    pub async fn run_pipeline(
        &self,
        request: PipelineRequest,
    ) -> Result<PipelineResponse, RequestError> {
        request.validate()?;
        let mut run = PipelineRun::new(request);
        if let Err(e) = run.transition(RunStatus::Running) {
            warn!(run_id = %run.id, error = %e, "could not start run");
        }
        let cancel = self.table.admit(run.clone())?;
        Ok(self.drive(run, cancel, false).await)
    }

    /// Re-enter a paused run at its first stage without a terminal result.
    /// A supplied approval replaces the one the run was started with.
    pub async fn resume_run(
        &self,
        id: &str,
        approval: Option<ApprovalRecord>,
    ) -> Result<PipelineResponse> {
        let (mut run, cancel) = self.table.claim(id)?;
        if let Some(approval) = approval {
            run.request.approval = Some(approval);
        }
        Ok(self.drive(run, cancel, true).await)
    }

    /// Cancel a running run. Returns false if the run is not running.
    pub async fn cancel_run(&self, id: &str) -> Result<bool> {
        if self.table.get(id).is_none() {
            bail!("run \"{id}\" not found");
        }
        if !self.table.cancel(id) {
            return Ok(false);
        }
        info!(run_id = id, "cancellation requested");

        // A paused run has no driving task to observe the token.
        if !self.table.is_in_flight(id) {
            if let Some(run) = self.table.get(id) {
                EventLogger::new(self.state_dir(), id).record(Event::RunCancelled {
                    stages_completed: completed_count(&run),
                });
                self.save_best_effort();
                self.notifier
                    .notify(&RunNotice::of(
                        &run,
                        format!("Run \"{id}\" cancelled while paused."),
                    ))
                    .await;
            }
        }
        Ok(true)
    }

    pub fn get_run(&self, id: &str) -> Option<PipelineRun> {
        self.table.get(id)
    }

    pub fn list_runs(&self) -> Vec<PipelineRun> {
        self.table.list()
    }

    /// Merge this process's runs into the persisted table. Unlike checkpoint
    /// writes, failure is an error.
    pub fn persist(&self) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            bail!("no state directory configured");
        };
        save_runs(dir, &self.table.changed())
    }

    /// Load persisted runs into the table. Returns how many were added.
    pub fn restore(&self) -> Result<usize> {
        let Some(dir) = &self.state_dir else {
            return Ok(0);
        };
        let runs = load_runs(dir)?;
        let restored = self.table.restore(runs);
        debug!(restored, state_dir = %dir.display(), "run table restored");
        Ok(restored)
    }

    /// The stage loop.
    async fn drive(
        &self,
        mut run: PipelineRun,
        cancel: CancellationToken,
        resumed: bool,
    ) -> PipelineResponse {
        let stages = stages_for(run.request.pipeline_type);
        let request = run.request.clone();
        let mut log = EventLogger::new(self.state_dir(), &run.id);

        log.record(Event::RunStart {
            run_id: run.id.clone(),
            pipeline_type: request.pipeline_type,
            stages: stages.to_vec(),
            resumed,
        });
        info!(run_id = %run.id, pipeline_type = ?request.pipeline_type, resumed, "run started");

        let mut paused: Option<(PipelineStage, StageStatus)> = None;

        for &stage in stages {
            if run
                .stages
                .get(stage)
                .map(|r| r.status.is_terminal())
                .unwrap_or(false)
            {
                continue;
            }

            self.checkpoint(&mut run);
            if cancel.is_cancelled() || run.status != RunStatus::Running {
                break;
            }

            if let Some(reason) = skip_reason(&run, stage) {
                debug!(run_id = %run.id, %stage, reason, "stage skipped");
                run.stages.insert(StageResult::skipped(stage, reason));
                log.record(Event::StageSkipped {
                    stage,
                    reason: reason.to_string(),
                });
                continue;
            }

            log.record(Event::StageStart { stage });
            let status = self.executor.execute_stage(&mut run, stage, &request).await;
            let result = run.stages.get(stage).cloned();
            let duration_ms = result.as_ref().and_then(|r| r.duration_ms).unwrap_or(0);

            match status {
                StageStatus::Failed => {
                    let error = result
                        .and_then(|r| r.error)
                        .unwrap_or_else(|| "stage failed".to_string());
                    log.record(Event::StageFailed {
                        stage,
                        duration_ms,
                        error: error.clone(),
                    });
                    run.error = Some(format!("{stage} stage failed: {error}"));
                    if let Err(e) = run.transition(RunStatus::Failed) {
                        warn!(run_id = %run.id, error = %e, "could not mark run failed");
                    }
                    log.record(Event::RunFailed {
                        stage: Some(stage),
                        error,
                    });
                    break;
                }
                s if s.is_pause() => {
                    for pending in &run.pending_approvals {
                        log.record(Event::PolicyDenied {
                            fix_id: pending.fix_id.clone(),
                            operation: pending.operation.clone(),
                            required_scope: pending.required_scope,
                            reason: pending.reason.clone(),
                        });
                    }
                    log.record(Event::StagePaused {
                        stage,
                        status: s.as_str().to_string(),
                    });
                    paused = Some((stage, s));
                    break;
                }
                _ => log.record(Event::StageCompleted {
                    stage,
                    duration_ms,
                    tokens: result.map(|r| r.tokens).unwrap_or_default(),
                }),
            }
        }

        // Picks up a cancellation that arrived during the last stage.
        self.table.checkpoint(&mut run);
        if run.status == RunStatus::Running && paused.is_none() {
            if let Err(e) = run.transition(RunStatus::Completed) {
                warn!(run_id = %run.id, error = %e, "could not complete run");
            }
            log.record(Event::RunCompleted {
                stages_completed: completed_count(&run),
                total_tokens: run.total_tokens,
            });
        } else if run.status == RunStatus::Cancelled {
            log.record(Event::RunCancelled {
                stages_completed: completed_count(&run),
            });
        }

        self.table.checkpoint(&mut run);
        self.table.release(&run.id);
        self.save_best_effort();

        let message = match (run.status, paused) {
            (RunStatus::Running, Some((stage, status))) => format!(
                "Run \"{}\" paused at {stage} ({}). Resume once resolved.",
                run.id,
                status.as_str()
            ),
            (RunStatus::Failed, _) => format!(
                "Run \"{}\" failed: {}",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            ),
            (RunStatus::Cancelled, _) => format!("Run \"{}\" cancelled.", run.id),
            (status, _) => format!(
                "Run \"{}\" {}: {} issues, {} fixes, {} tokens.",
                run.id,
                status.as_str(),
                run.issues.len(),
                run.fixes.len(),
                run.total_tokens.total()
            ),
        };
        info!(run_id = %run.id, status = ?run.status, "run finished");
        self.notifier.notify(&RunNotice::of(&run, message)).await;

        PipelineResponse::from_run(&run)
    }

    /// Publish the run and write the table. Write failures are logged only.
    fn checkpoint(&self, run: &mut PipelineRun) {
        self.table.checkpoint(run);
        self.save_best_effort();
    }

    fn save_best_effort(&self) {
        if let Some(dir) = &self.state_dir {
            if let Err(e) = save_runs(dir, &self.table.changed()) {
                warn!(error = %format!("{e:#}"), "checkpoint write failed");
            }
        }
    }
}

fn completed_count(run: &PipelineRun) -> usize {
    run.stages
        .iter()
        .filter(|r| r.status == StageStatus::Completed)
        .count()
}
