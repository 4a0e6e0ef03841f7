// Workflow registration commands.

use std::path::PathBuf;

use crate::client::Client;
use crate::output::{print_field, OutputFormat};
use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Subcommand)]
pub enum WorkflowsCommand {
    /// Register a workflow definition (JSON document) from a file
    Register {
        /// Path to the workflow definition JSON file
        file: PathBuf,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterResponse {
    id: String,
}

pub async fn run(command: WorkflowsCommand, client: &Client, output: OutputFormat, quiet: bool) -> Result<()> {
    match command {
        WorkflowsCommand::Register { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("reading workflow definition from {}", file.display()))?;
            let def: Value = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {} as JSON", file.display()))?;

            let resp: RegisterResponse = client.post("/v1/workflows", &def).await?;
            if output.is_text() {
                if !quiet {
                    print_field("Workflow", &resp.id);
                    print_field("Status", "registered");
                }
            } else {
                output.print_value(&resp);
            }
            Ok(())
        }
    }
}
