// Event publication commands.

use crate::client::Client;
use crate::output::{print_field, OutputFormat};
use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum EventsCommand {
    /// Publish a named event, resuming every run paused on a matching `waitForEvent` step
    Publish {
        /// Event name
        name: String,

        /// JSON payload delivered to waiters (default `{}`)
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PublishEventResponse {
    resumed_runs: Vec<Uuid>,
}

pub async fn run(command: EventsCommand, client: &Client, output: OutputFormat, quiet: bool) -> Result<()> {
    match command {
        EventsCommand::Publish { name, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            let body = serde_json::json!({ "name": name, "payload": payload });
            let resp: PublishEventResponse = client.post("/v1/events", &body).await?;
            if output.is_text() {
                if !quiet {
                    print_field("Event", &name);
                    print_field("Resumed", &resp.resumed_runs.len().to_string());
                    for run_id in &resp.resumed_runs {
                        println!("  {run_id}");
                    }
                }
            } else {
                output.print_value(&resp);
            }
        }
    }
    Ok(())
}
