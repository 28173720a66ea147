use anyhow::{Context, Result};
use foreman_conductor::agent::command::CommandAgent;
use foreman_conductor::agent::protocol::AgentRole;
use foreman_conductor::agent::AgentSet;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_STATE_DIR: &str = ".foreman";

/// `foreman.yaml`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// JSONL file approved mutations are appended to.
    #[serde(default)]
    pub outbox: Option<PathBuf>,
    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    pub triage: Option<AgentCommand>,
    pub coder: Option<AgentCommand>,
    pub reviewer: Option<AgentCommand>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Config {
    /// Load `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.outbox
            .clone()
            .unwrap_or_else(|| self.state_dir().join("outbox.jsonl"))
    }

    /// One process-backed agent per role. Every role must be configured.
    pub fn agent_set(&self) -> Result<AgentSet> {
        Ok(AgentSet::new(
            Arc::new(build_agent(AgentRole::Triage, self.agents.triage.as_ref())?),
            Arc::new(build_agent(AgentRole::Coder, self.agents.coder.as_ref())?),
            Arc::new(build_agent(AgentRole::Reviewer, self.agents.reviewer.as_ref())?),
        ))
    }
}

fn build_agent(role: AgentRole, spec: Option<&AgentCommand>) -> Result<CommandAgent> {
    let spec = spec.ok_or_else(|| {
        anyhow::anyhow!("no `{role}` agent configured (agents.{role}.program in foreman.yaml)")
    })?;
    let mut agent = CommandAgent::new(role, &spec.program)
        .with_args(spec.args.clone())
        .with_env(spec.env.clone());
    if let Some(timeout) = spec.timeout_sec {
        agent = agent.with_timeout(timeout);
    }
    Ok(agent)
}
