use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::state::run::PipelineRun;

/// Run table location: `{state_dir}/runs.json`.
pub fn table_path(state_dir: &Path) -> PathBuf {
    state_dir.join("runs.json")
}

fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join("runs.lock")
}

/// Load the persisted run table. Empty if nothing was saved yet.
pub fn load_runs(state_dir: &Path) -> Result<Vec<PipelineRun>> {
    let path = table_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading run table: {}", path.display()))?;
    let runs: Vec<PipelineRun> = serde_json::from_str(&content)
        .with_context(|| format!("parsing run table: {}", path.display()))?;
    Ok(runs)
}

/// Merge `runs` into the persisted table and write it back atomically.
/// The read-merge-write happens under one exclusive lock, so runs saved by
/// other processes sharing `state_dir` survive. On an id clash `runs` wins.
pub fn save_runs(state_dir: &Path, runs: &[PipelineRun]) -> Result<()> {
    let path = table_path(state_dir);
    let _guard = lock_file(&lock_path(state_dir))?;

    let mut merged = load_runs(state_dir)?;
    for run in runs {
        match merged.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => merged.push(run.clone()),
        }
    }

    let data = serde_json::to_string_pretty(&merged)?;
    write_atomic(&path, data.as_bytes())
        .with_context(|| format!("saving run table: {}", path.display()))?;
    Ok(())
}

/// Write to a temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// Held for the duration of a table write.
pub struct LockGuard {
    _file: fs::File,
}

pub fn lock_file(path: &Path) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(LockGuard { _file: file })
}
