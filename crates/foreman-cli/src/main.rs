mod cmd_policy;
mod cmd_run;
mod cmd_runs;
mod config;
mod logging;
mod outbox;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::cmd_policy::OpTypeArg;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Agent-driven repository maintenance pipelines")]
struct Cli {
    /// Path to foreman.yaml
    #[arg(long, global = true, default_value = "foreman.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a pipeline run from a request file
    Run {
        /// Pipeline request (JSON)
        request: PathBuf,
        /// Output the run response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue a paused run
    Resume {
        run_id: String,
        /// Approval record (JSON) granting scopes for this run
        #[arg(long)]
        approval: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show one run, or list all runs
    Status {
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a running or paused run
    Cancel { run_id: String },
    /// Policy gate utilities
    Policy {
        #[command(subcommand)]
        cmd: PolicyCmd,
    },
}

#[derive(Subcommand)]
enum PolicyCmd {
    /// Ask the gate whether an operation would be allowed
    Check {
        /// Operation name, e.g. createPullRequest
        operation: String,
        #[arg(long = "type", value_enum)]
        op_type: OpTypeArg,
        #[arg(long)]
        approval: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Run { request, json } => {
            let config = Config::load(&cli.config)?;
            cmd_run::run(&request, &config, json)
        }
        Command::Resume {
            run_id,
            approval,
            json,
        } => {
            let config = Config::load(&cli.config)?;
            cmd_run::resume(&run_id, approval.as_deref(), &config, json)
        }
        Command::Status { run_id, json } => {
            let config = Config::load(&cli.config)?;
            cmd_runs::status(&config, run_id.as_deref(), json)
        }
        Command::Cancel { run_id } => {
            let config = Config::load(&cli.config)?;
            cmd_runs::cancel(&config, &run_id)
        }
        Command::Policy {
            cmd:
                PolicyCmd::Check {
                    operation,
                    op_type,
                    approval,
                    json,
                },
        } => cmd_policy::check(&operation, op_type, approval.as_deref(), json),
    }
}
