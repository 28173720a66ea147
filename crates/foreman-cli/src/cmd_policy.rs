use anyhow::Result;
use clap::ValueEnum;
use foreman_policy::{OperationType, PolicyDecision, PolicyGate};
use std::path::Path;

use crate::cmd_run::load_approval;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OpTypeArg {
    Read,
    NonDestructive,
    Destructive,
}

impl From<OpTypeArg> for OperationType {
    fn from(arg: OpTypeArg) -> Self {
        match arg {
            OpTypeArg::Read => OperationType::Read,
            OpTypeArg::NonDestructive => OperationType::NonDestructive,
            OpTypeArg::Destructive => OperationType::Destructive,
        }
    }
}

/// Execute `foreman policy check <operation> --type <type> [--approval file]`
pub fn check(operation: &str, op_type: OpTypeArg, approval: Option<&Path>, json: bool) -> Result<()> {
    let approval = approval.map(load_approval).transpose()?;
    let decision = PolicyGate::new().check(operation, op_type.into(), approval.as_ref());
    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        println!("{}", decision_line(operation, &decision));
    }
    Ok(())
}

fn decision_line(operation: &str, decision: &PolicyDecision) -> String {
    let verdict = if decision.allowed { "allowed" } else { "denied" };
    format!(
        "{operation} ({}): {verdict}. {}",
        decision.operation_type.as_str(),
        decision.message()
    )
}
