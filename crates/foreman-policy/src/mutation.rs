use foreman_core::FileChange;
use serde::{Deserialize, Serialize};

use crate::gate::OperationType;

/// A structured request for an external system to change something.
/// Serialized with the operation name as the `operation` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum Mutation {
    #[serde(rename_all = "camelCase")]
    CreateBranch {
        repo: String,
        branch: String,
        from_ref: String,
    },
    #[serde(rename_all = "camelCase")]
    PushCommit {
        repo: String,
        branch: String,
        message: String,
        files: Vec<FileChange>,
    },
    #[serde(rename_all = "camelCase")]
    CreatePullRequest {
        repo: String,
        head: String,
        base: String,
        title: String,
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdatePullRequest {
        repo: String,
        number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MergePullRequest { repo: String, number: u64 },
    #[serde(rename_all = "camelCase")]
    PostComment {
        repo: String,
        number: u64,
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    AddLabels {
        repo: String,
        number: u64,
        labels: Vec<String>,
    },
}

impl Mutation {
    /// Operation name as used by the scope table.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Mutation::CreateBranch { .. } => "createBranch",
            Mutation::PushCommit { .. } => "pushCommit",
            Mutation::CreatePullRequest { .. } => "createPullRequest",
            Mutation::UpdatePullRequest { .. } => "updatePullRequest",
            Mutation::MergePullRequest { .. } => "mergePullRequest",
            Mutation::PostComment { .. } => "postComment",
            Mutation::AddLabels { .. } => "addLabels",
        }
    }

    pub fn operation_type(&self) -> OperationType {
        match self {
            Mutation::PostComment { .. } | Mutation::AddLabels { .. } => {
                OperationType::NonDestructive
            }
            _ => OperationType::Destructive,
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            Mutation::CreateBranch { repo, .. }
            | Mutation::PushCommit { repo, .. }
            | Mutation::CreatePullRequest { repo, .. }
            | Mutation::UpdatePullRequest { repo, .. }
            | Mutation::MergePullRequest { repo, .. }
            | Mutation::PostComment { repo, .. }
            | Mutation::AddLabels { repo, .. } => repo,
        }
    }
}
