//! Runtime statistics of one judge instance

use anyhow::Result;
use colored::Colorize;

use crate::client::{ApiClient, StatsResponse};
use crate::output::{print_json, OutputFormat};

pub async fn show_stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: StatsResponse = client.get("api/v1/stats").await?;

    match format {
        OutputFormat::Json => print_json(&stats),
        OutputFormat::Table => {
            println!("{}", "Judge Statistics".bold());
            println!("{}", "=".repeat(50));
            println!("Datasource:            {}", stats.datasource.cyan());
            println!("Rules version:         {}", stats.rules_version);
            println!();
            println!("{}", "Rules".bold());
            println!("{}", "-".repeat(50));
            println!("PUSH rules:            {}", stats.push_rules);
            println!("PULL rules:            {}", stats.pull_rules);
            if stats.invalid_rules > 0 {
                println!(
                    "Invalid rules:         {}",
                    stats.invalid_rules.to_string().red()
                );
            }
            println!("Indexed metrics:       {}", stats.indexed_metrics);
            println!();
            println!("{}", "Pipeline".bold());
            println!("{}", "-".repeat(50));
            println!("Write queue:           {}", stats.write_queue);
            println!("Cached series:         {}", stats.cached_series);
            println!("PUSH workers:          {}", stats.push_workers);
            println!("PULL evaluators:       {}", stats.pull_evaluators);
            println!("Event states:          {}", stats.event_states);
            println!("Pending events:        {}", stats.event_queue);
            println!();
            println!("{}", "Ring".bold());
            println!("{}", "-".repeat(50));
            if stats.ring_members.is_empty() {
                println!("{}", "No live members".yellow());
            }
            for member in &stats.ring_members {
                println!("  {}", member);
            }
        }
    }

    Ok(())
}
