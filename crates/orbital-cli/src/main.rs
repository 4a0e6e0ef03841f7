// Orbital CLI
//
// Design Decision: clap derive for ergonomic argument parsing.
// Design Decision: text/json/yaml output formats for scripting.
// Design Decision: reqwest HTTP client against a running orbital-api process
// rather than linking orbital-core directly - the CLI stays a thin ingress
// client, decoupled from the engine's internal crate.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "orbital")]
#[command(about = "Orbital CLI - register workflows and drive runs against an orbital-api server")]
#[command(version)]
pub struct Cli {
    /// Orbital API base URL
    #[arg(long, env = "ORBITAL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register workflow definitions
    Workflows {
        #[command(subcommand)]
        command: commands::workflows::WorkflowsCommand,
    },

    /// Trigger, inspect, resume, and cancel runs
    Runs {
        #[command(subcommand)]
        command: commands::runs::RunsCommand,
    },

    /// Publish events to resume `waitForEvent` pauses
    Events {
        #[command(subcommand)]
        command: commands::events::EventsCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = client::Client::new(&cli.api_url);
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Workflows { command } => {
            commands::workflows::run(command, &client, output_format, cli.quiet).await
        }
        Commands::Runs { command } => {
            commands::runs::run(command, &client, output_format, cli.quiet).await
        }
        Commands::Events { command } => {
            commands::events::run(command, &client, output_format, cli.quiet).await
        }
    }
}
