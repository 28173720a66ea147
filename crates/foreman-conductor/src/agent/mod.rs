pub mod budget;
pub mod command;
pub mod mock;
pub mod protocol;

use anyhow::Result;
use std::sync::Arc;

use protocol::{AgentResponse, AgentRole, TaskMessage};

/// A collaborator agent. One implementation per transport; the runner only
/// sees the role it addresses.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    async fn handle(&self, task: &TaskMessage) -> Result<AgentResponse>;
}

/// The three agent roles the executor dispatches to.
#[derive(Clone)]
pub struct AgentSet {
    pub triage: Arc<dyn Agent>,
    pub coder: Arc<dyn Agent>,
    pub reviewer: Arc<dyn Agent>,
}

impl AgentSet {
    pub fn new(triage: Arc<dyn Agent>, coder: Arc<dyn Agent>, reviewer: Arc<dyn Agent>) -> Self {
        Self {
            triage,
            coder,
            reviewer,
        }
    }

    /// Same agent behind every role.
    pub fn uniform(agent: Arc<dyn Agent>) -> Self {
        Self {
            triage: agent.clone(),
            coder: agent.clone(),
            reviewer: agent,
        }
    }

    pub fn for_role(&self, role: AgentRole) -> &Arc<dyn Agent> {
        match role {
            AgentRole::Triage => &self.triage,
            AgentRole::Coder => &self.coder,
            AgentRole::Reviewer => &self.reviewer,
        }
    }
}
