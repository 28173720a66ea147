use anyhow::{Context, Result};
use foreman_core::clock::now_rfc3339;
use foreman_policy::{Connector, Mutation};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Connector that queues approved mutations as JSONL for a downstream
/// GitHub/GitLab worker. The gate has already run when `apply` is called.
pub struct OutboxConnector {
    path: PathBuf,
    // Serializes appends from concurrent runs.
    write_lock: Mutex<()>,
}

#[derive(Serialize)]
struct OutboxEntry<'a> {
    ts: String,
    mutation: &'a Mutation,
}

impl OutboxConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl Connector for OutboxConnector {
    async fn apply(&self, mutation: &Mutation) -> Result<serde_json::Value> {
        let line = serde_json::to_string(&OutboxEntry {
            ts: now_rfc3339(),
            mutation,
        })?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("outbox lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening outbox {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        debug!(operation = mutation.operation_name(), repo = mutation.repo(), "mutation queued");
        Ok(serde_json::json!({ "queued": true, "outbox": self.path.display().to_string() }))
    }
}
