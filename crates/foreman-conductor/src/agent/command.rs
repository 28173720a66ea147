use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::protocol::{AgentResponse, AgentRole, TaskMessage};
use super::Agent;

const DEFAULT_TIMEOUT_SEC: u64 = 1800;

/// Runs an external process per task. The task envelope is written to stdin
/// as one JSON document; the last non-empty stdout line must be the response
/// envelope.
pub struct CommandAgent {
    role: AgentRole,
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(role: AgentRole, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SEC),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout_sec: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_sec);
        self
    }
}

#[async_trait::async_trait]
impl Agent for CommandAgent {
    async fn handle(&self, task: &TaskMessage) -> Result<AgentResponse> {
        let body = serde_json::to_vec(task)?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("FOREMAN_AGENT_ROLE", self.role.as_str())
            .env("FOREMAN_TASK_TYPE", task.task_type());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        debug!(role = %self.role, task_type = task.task_type(), program = ?self.program, "spawning agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {} agent {:?}", self.role, self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdin"))?;
        // The write shares the deadline with the wait: a child that never
        // reads a large envelope must not stall us before the timeout starts.
        let feed = async move {
            stdin.write_all(&body).await?;
            stdin.shutdown().await
        };
        let exchange = async { tokio::join!(feed, child.wait_with_output()) };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok((written, result)) => {
                if let Err(e) = written {
                    debug!(role = %self.role, error = %e, "agent closed stdin early");
                }
                result?
            }
            Err(_) => anyhow::bail!(
                "{} agent timed out after {}s",
                self.role,
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} agent exited with {}: {}",
                self.role,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_response(&stdout).with_context(|| format!("reading {} agent response", self.role))
    }
}

/// Parse the last non-empty line of `stdout` as a response envelope.
fn parse_response(stdout: &str) -> Result<AgentResponse> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow::anyhow!("agent produced no output"))?;
    Ok(serde_json::from_str(line)?)
}
