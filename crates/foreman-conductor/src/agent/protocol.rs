use foreman_core::clock::now_rfc3339;
use foreman_core::{Severity, TokenUsage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::stage::PipelineStage;

/// Sender name stamped on every task the runner emits.
pub const SENDER: &str = "foreman";

/// Fixed namespace UUID for task message ids.
const TASK_NS: Uuid = Uuid::from_bytes([
    0xf0, 0x4e, 0x3a, 0x11, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
]);

/// Deterministic task id per run+stage+item. A resumed run re-sends the same
/// id for the same unit of work.
pub fn task_id(run_id: &str, stage: PipelineStage, item: &str) -> Uuid {
    Uuid::new_v5(&TASK_NS, format!("{run_id}-{stage}-{item}").as_bytes())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Triage,
    Coder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Triage => "triage",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
        }
    }

    /// Role that handles a stage.
    pub fn for_stage(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Audit | PipelineStage::Issues => AgentRole::Triage,
            PipelineStage::Plans | PipelineStage::Fixes | PipelineStage::Docs => AgentRole::Coder,
            PipelineStage::Qa => AgentRole::Reviewer,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl From<Severity> for Priority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Priority::Critical,
            Severity::High => Priority::High,
            Severity::Medium => Priority::Normal,
            Severity::Low | Severity::Info => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_type: String,
    pub input: serde_json::Value,
}

/// Envelope sent to a collaborator agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: String,
    pub from: String,
    pub to: AgentRole,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: TaskPayload,
    pub timestamp: String,
    pub priority: Priority,
}

impl TaskMessage {
    pub fn request(
        id: Uuid,
        to: AgentRole,
        task_type: &str,
        input: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.to_string(),
            from: SENDER.to_string(),
            to,
            kind: "task_request".to_string(),
            payload: TaskPayload {
                task_type: task_type.to_string(),
                input,
            },
            timestamp: now_rfc3339(),
            priority,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.payload.task_type
    }
}

/// Envelope returned by a collaborator agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
}

impl AgentResponse {
    pub fn ok(output: serde_json::Value, tokens: TokenUsage) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            tokens_used: Some(tokens),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            tokens_used: None,
        }
    }

    /// Extract and deserialize `output[field]`.
    pub fn field<T: DeserializeOwned>(&self, field: &'static str) -> Result<T, AgentError> {
        if !self.success {
            return Err(AgentError::Failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ));
        }
        let value = self
            .output
            .as_ref()
            .and_then(|o| o.get(field))
            .ok_or(AgentError::MissingField(field))?;
        serde_json::from_value(value.clone()).map_err(|source| AgentError::InvalidOutput {
            field,
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),
    #[error("agent output is missing `{0}`")]
    MissingField(&'static str),
    #[error("agent output field `{field}` is malformed: {source}")]
    InvalidOutput {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{role} agent unreachable: {message}")]
    Transport { role: AgentRole, message: String },
}
