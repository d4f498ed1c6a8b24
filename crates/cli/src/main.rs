//! Alert judge CLI
//!
//! Inspects a running judge (health, statistics, pending events), pushes
//! test samples and validates rule files offline.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{events, health, push, rules, stats};
use std::path::PathBuf;

/// Alert judge CLI
#[derive(Parser)]
#[command(name = "judgectl")]
#[command(author, version, about = "CLI for the Alert Judge", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via JUDGECTL_API_URL env var)
    #[arg(long, env = "JUDGECTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show liveness and readiness
    Health,

    /// Show runtime statistics
    Stats,

    /// Push one sample
    Push {
        /// Metric name
        #[arg(long, short)]
        metric: String,

        /// Resource identity of the sample
        #[arg(long, short)]
        ident: Option<String>,

        /// Tag in k=v form, repeatable
        #[arg(long = "tag", short)]
        tags: Vec<String>,

        /// Sample value
        #[arg(long, allow_hyphen_values = true)]
        value: f64,

        /// Sample time in epoch seconds (defaults to now)
        #[arg(long)]
        time: Option<i64>,
    },

    /// Drain and print pending alert and recovery events
    Events {
        /// Maximum number of events to drain
        #[arg(long, short, default_value_t = 100)]
        limit: usize,
    },

    /// Rule file tools
    #[command(subcommand)]
    Rules(RulesCommands),
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Parse and validate a rules file without contacting the judge
    Validate {
        /// JSON rules file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Rules(RulesCommands::Validate { file }) = &cli.command {
        return rules::validate_file(file, cli.format);
    }

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Health => health::show_health(&client, cli.format).await?,
        Commands::Stats => stats::show_stats(&client, cli.format).await?,
        Commands::Push {
            metric,
            ident,
            tags,
            value,
            time,
        } => push::push_point(&client, metric, ident, &tags, value, time, cli.format).await?,
        Commands::Events { limit } => events::drain_events(&client, limit, cli.format).await?,
        Commands::Rules(_) => {}
    }

    Ok(())
}
