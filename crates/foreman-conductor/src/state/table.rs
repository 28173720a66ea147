use anyhow::{bail, Result};
use foreman_core::RequestError;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::state::run::{PipelineRun, RunStatus};

struct RunSlot {
    run: PipelineRun,
    cancel: CancellationToken,
    /// A task is currently driving this run.
    in_flight: bool,
    /// Changed by this process since it was loaded from disk.
    dirty: bool,
}

/// Shared table of runs keyed by run id. Each slot holds the latest snapshot
/// published by the task driving the run.
#[derive(Default)]
pub struct RunTable {
    slots: RwLock<HashMap<String, RunSlot>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RunSlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunSlot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new run and mark it in flight. A run with the same id that
    /// is still running is rejected; finished runs are replaced.
    pub fn admit(&self, run: PipelineRun) -> Result<CancellationToken, RequestError> {
        let mut slots = self.write();
        if let Some(existing) = slots.get(&run.id) {
            if existing.run.status == RunStatus::Running {
                return Err(RequestError::RunAlreadyActive(run.id));
            }
        }
        let cancel = CancellationToken::new();
        slots.insert(
            run.id.clone(),
            RunSlot {
                run,
                cancel: cancel.clone(),
                in_flight: true,
                dirty: true,
            },
        );
        Ok(cancel)
    }

    /// Take a paused run so a task can drive it again.
    pub fn claim(&self, id: &str) -> Result<(PipelineRun, CancellationToken)> {
        let mut slots = self.write();
        let Some(slot) = slots.get_mut(id) else {
            bail!("run \"{id}\" not found");
        };
        if slot.run.status != RunStatus::Running {
            bail!(
                "run \"{id}\" is {:?}; only paused running runs can be resumed",
                slot.run.status
            );
        }
        if slot.in_flight {
            bail!("run \"{id}\" is already being driven");
        }
        slot.in_flight = true;
        slot.dirty = true;
        Ok((slot.run.clone(), slot.cancel.clone()))
    }

    /// Publish `run` as the latest snapshot. If cancellation was requested
    /// while the run is still running, `run` is moved to cancelled first.
    pub fn checkpoint(&self, run: &mut PipelineRun) {
        let mut slots = self.write();
        let slot = slots.entry(run.id.clone()).or_insert_with(|| RunSlot {
            run: run.clone(),
            cancel: CancellationToken::new(),
            in_flight: true,
            dirty: true,
        });
        if slot.cancel.is_cancelled() && run.status == RunStatus::Running {
            if let Err(e) = run.transition(RunStatus::Cancelled) {
                warn!(run_id = %run.id, error = %e, "cancel transition rejected");
            }
        }
        slot.run = run.clone();
        slot.dirty = true;
    }

    /// The driving task is done with the run.
    pub fn release(&self, id: &str) {
        if let Some(slot) = self.write().get_mut(id) {
            slot.in_flight = false;
        }
    }

    pub fn get(&self, id: &str) -> Option<PipelineRun> {
        self.read().get(id).map(|s| s.run.clone())
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.read().get(id).map(|s| s.in_flight).unwrap_or(false)
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self.read().values().map(|s| s.run.clone()).collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    /// Runs this process admitted, drove or cancelled. Runs only loaded by
    /// [`RunTable::restore`] are left out, so saving never writes back a
    /// stale copy of a run another process owns.
    pub fn changed(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .read()
            .values()
            .filter(|s| s.dirty)
            .map(|s| s.run.clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    /// Request cancellation. Only effective while the run is running; returns
    /// whether it took effect. An in-flight task stops at its next stage
    /// boundary.
    pub fn cancel(&self, id: &str) -> bool {
        let mut slots = self.write();
        let Some(slot) = slots.get_mut(id) else {
            return false;
        };
        if slot.run.status != RunStatus::Running {
            return false;
        }
        slot.cancel.cancel();
        slot.dirty = true;
        slot.run.transition(RunStatus::Cancelled).is_ok()
    }

    /// Drop a run that no task is driving.
    pub fn evict(&self, id: &str) -> Option<PipelineRun> {
        let mut slots = self.write();
        if slots.get(id).map(|s| s.in_flight).unwrap_or(true) {
            return None;
        }
        slots.remove(id).map(|s| s.run)
    }

    /// Load persisted runs. Runs already in the table are kept as they are.
    pub fn restore(&self, runs: Vec<PipelineRun>) -> usize {
        let mut slots = self.write();
        let mut restored = 0;
        for run in runs {
            if slots.contains_key(&run.id) {
                continue;
            }
            slots.insert(
                run.id.clone(),
                RunSlot {
                    run,
                    cancel: CancellationToken::new(),
                    in_flight: false,
                    dirty: false,
                },
            );
            restored += 1;
        }
        restored
    }
}
