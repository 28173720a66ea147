use std::sync::{Mutex, PoisonError};

use crate::stage::PipelineStage;
use crate::state::run::{PipelineRun, RunStatus};

/// Outcome of a run as handed to a [`Notifier`]: emitted when a run
/// completes, fails, pauses or is cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RunNotice {
    pub run_id: String,
    pub repo: String,
    pub status: RunStatus,
    /// Set while the run waits for approval or review.
    pub paused_at: Option<PipelineStage>,
    pub message: String,
}

impl RunNotice {
    pub fn of(run: &PipelineRun, message: impl Into<String>) -> Self {
        Self {
            run_id: run.id.clone(),
            repo: run.request.repo.clone(),
            status: run.status,
            paused_at: run.paused_at(),
            message: message.into(),
        }
    }

    /// Short state label: the status, or `paused` for a paused run.
    pub fn label(&self) -> &'static str {
        if self.paused_at.is_some() {
            "paused"
        } else {
            self.status.as_str()
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &RunNotice);
}

/// Prints one line per notice to stdout.
pub struct StdoutNotifier;

#[async_trait::async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(&self, notice: &RunNotice) {
        println!("[foreman:{}] {} {}", notice.label(), notice.repo, notice.message);
    }
}

pub struct NullNotifier;

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _notice: &RunNotice) {}
}

/// Keeps notices in memory.
#[derive(Default)]
pub struct CollectNotifier {
    notices: Mutex<Vec<RunNotice>>,
}

impl CollectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<RunNotice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Notifier for CollectNotifier {
    async fn notify(&self, notice: &RunNotice) {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice.clone());
    }
}
