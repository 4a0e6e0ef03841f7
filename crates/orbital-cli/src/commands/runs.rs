// Run lifecycle commands: trigger, inspect, resume, cancel.

use crate::client::Client;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// Trigger a workflow run manually
    Trigger {
        /// Workflow id to run
        workflow_id: String,

        /// JSON payload to seed the run with (default `{}`)
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Inspect a run and its per-step states
    Inspect {
        /// Run id
        run_id: Uuid,
    },

    /// Resume a paused run via its pause token
    Resume {
        /// Pause token returned when the run paused
        token: Uuid,

        /// JSON payload to resume with (default `{}`)
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Cancel a run
    Cancel {
        /// Run id
        run_id: Uuid,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerResponse {
    run_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunDto {
    id: Uuid,
    workflow_id: String,
    status: String,
    payload: Value,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    last_output: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepStateDto {
    step_id: String,
    attempt: u32,
    status: String,
    output: Option<Value>,
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunSnapshotDto {
    run: RunDto,
    steps: Vec<StepStateDto>,
}

pub async fn run(command: RunsCommand, client: &Client, output: OutputFormat, quiet: bool) -> Result<()> {
    match command {
        RunsCommand::Trigger { workflow_id, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let body = serde_json::json!({ "workflow_id": workflow_id, "payload": payload });
            let resp: TriggerResponse = client.post("/v1/runs/trigger", &body).await?;
            if output.is_text() {
                if !quiet {
                    print_field("Run", &resp.run_id.to_string());
                }
            } else {
                output.print_value(&resp);
            }
        }
        RunsCommand::Inspect { run_id } => {
            let snapshot: RunSnapshotDto = client.get(&format!("/v1/runs/{run_id}")).await?;
            if output.is_text() {
                print_field("Run", &snapshot.run.id.to_string());
                print_field("Workflow", &snapshot.run.workflow_id);
                print_field("Status", &snapshot.run.status);
                print_field("Started", &snapshot.run.started_at.to_rfc3339());
                if let Some(completed) = snapshot.run.completed_at {
                    print_field("Completed", &completed.to_rfc3339());
                }
                if let Some(err) = &snapshot.run.error {
                    print_field("Error", err);
                }
                println!();
                print_table_header(&[("STEP", 24), ("ATTEMPT", 8), ("STATUS", 12), ("ERROR", 30)]);
                for step in &snapshot.steps {
                    print_table_row(&[
                        (step.step_id.as_str(), 24),
                        (&step.attempt.to_string(), 8),
                        (step.status.as_str(), 12),
                        (step.error.as_deref().unwrap_or(""), 30),
                    ]);
                }
            } else {
                output.print_value(&snapshot);
            }
        }
        RunsCommand::Resume { token, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let body = serde_json::json!({ "token": token, "payload": payload });
            let resp: TriggerResponse = client.post("/v1/runs/resume", &body).await?;
            if output.is_text() {
                if !quiet {
                    print_field("Run", &resp.run_id.to_string());
                    print_field("Status", "resumed");
                }
            } else {
                output.print_value(&resp);
            }
        }
        RunsCommand::Cancel { run_id } => {
            client.post_empty(&format!("/v1/runs/{run_id}/cancel")).await?;
            if output.is_text() && !quiet {
                print_field("Run", &run_id.to_string());
                print_field("Status", "cancelled");
            }
        }
    }
    Ok(())
}
