use anyhow::Result;
use foreman_core::TokenUsage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use super::protocol::{AgentResponse, TaskMessage};
use super::Agent;

/// Usage reported by default mock responses.
pub const MOCK_TOKENS: TokenUsage = TokenUsage {
    input: 10,
    output: 5,
};

enum Reply {
    Respond(AgentResponse),
    Error(String),
}

/// Mock agent for testing. Pops queued replies per task type; once the queue
/// for a task type is empty, answers with a plausible default derived from
/// the task input.
pub struct MockAgent {
    replies: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<Vec<TaskMessage>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response with `output` for the next `task_type` call.
    pub fn respond(&self, task_type: &str, output: Value) {
        self.push(task_type, Reply::Respond(AgentResponse::ok(output, MOCK_TOKENS)));
    }

    /// Queue a full response envelope.
    pub fn respond_with(&self, task_type: &str, response: AgentResponse) {
        self.push(task_type, Reply::Respond(response));
    }

    /// Queue a transport error.
    pub fn fail(&self, task_type: &str, error: &str) {
        self.push(task_type, Reply::Error(error.to_string()));
    }

    /// Every task received so far, in order.
    pub fn calls(&self) -> Vec<TaskMessage> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, task_type: &str) -> Vec<TaskMessage> {
        self.calls()
            .into_iter()
            .filter(|t| t.task_type() == task_type)
            .collect()
    }

    fn push(&self, task_type: &str, reply: Reply) {
        if let Ok(mut map) = self.replies.lock() {
            map.entry(task_type.to_string()).or_default().push(reply);
        }
    }

    fn next_reply(&self, task_type: &str) -> Option<Reply> {
        let mut map = self.replies.lock().ok()?;
        let queue = map.get_mut(task_type)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait::async_trait]
impl Agent for MockAgent {
    async fn handle(&self, task: &TaskMessage) -> Result<AgentResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(task.clone());
        }
        match self.next_reply(task.task_type()) {
            Some(Reply::Respond(resp)) => Ok(resp),
            Some(Reply::Error(e)) => anyhow::bail!("{e}"),
            None => Ok(AgentResponse::ok(
                default_output(task.task_type(), &task.payload.input),
                MOCK_TOKENS,
            )),
        }
    }
}

fn default_output(task_type: &str, input: &Value) -> Value {
    match task_type {
        "audit" => json!({ "issues": [] }),
        "triage_issues" => json!({ "issues": input.get("issues").cloned().unwrap_or(json!([])) }),
        "plan_fix" => {
            let issue = &input["issue"];
            let issue_id = issue["id"].as_str().unwrap_or("unknown");
            let file = issue.get("file").cloned().unwrap_or(json!("README.md"));
            json!({
                "plan": {
                    "id": format!("plan-{issue_id}"),
                    "issueId": issue_id,
                    "summary": format!("fix {issue_id}"),
                    "steps": ["edit"],
                    "files": [file],
                    "riskTier": issue.get("riskTier").cloned().unwrap_or(json!("R0")),
                }
            })
        }
        "apply_fix" => {
            let plan = &input["plan"];
            let plan_id = plan["id"].as_str().unwrap_or("unknown");
            let path = plan["files"][0].as_str().unwrap_or("README.md");
            json!({
                "result": {
                    "id": format!("fix-{plan_id}"),
                    "planId": plan_id,
                    "issueId": plan["issueId"],
                    "status": "applied",
                    "changes": [{ "path": path, "content": "fixed\n" }],
                    "commitMessage": format!("fix: {}", plan["summary"].as_str().unwrap_or(plan_id)),
                }
            })
        }
        "review_fix" => {
            let fix = &input["fix"];
            let fix_id = fix["id"].as_str().unwrap_or("unknown");
            json!({
                "verdict": {
                    "id": format!("qa-{fix_id}"),
                    "fixId": fix_id,
                    "planId": fix["planId"],
                    "issueId": fix["issueId"],
                    "outcome": "passed",
                }
            })
        }
        "update_docs" => json!({
            "updates": [{ "path": "CHANGELOG.md", "summary": "record maintenance fixes" }]
        }),
        _ => json!({}),
    }
}
