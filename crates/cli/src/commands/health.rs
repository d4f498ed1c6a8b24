//! Liveness and readiness summary

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_timestamp, print_json, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    let readiness = client.readiness().await?;

    if let OutputFormat::Json = format {
        print_json(&json!({ "health": health, "readiness": readiness }));
        return Ok(());
    }

    println!("{}", "Judge Health".bold());
    println!("{}", "=".repeat(50));
    println!("Status:  {}", color_status(health.status.as_str()));
    let ready = if readiness.ready { "ready" } else { "not ready" };
    match &readiness.reason {
        Some(reason) => println!("Ready:   {} ({})", color_status(ready), reason),
        None => println!("Ready:   {}", color_status(ready)),
    }
    println!();

    let mut components: Vec<_> = health.components.into_iter().collect();
    components.sort_by(|a, b| a.0.cmp(&b.0));
    let rows: Vec<ComponentRow> = components
        .into_iter()
        .map(|(name, component)| ComponentRow {
            name,
            status: color_status(component.status.as_str()),
            message: component.message.unwrap_or_default(),
            last_check: format_timestamp(component.last_check_timestamp),
        })
        .collect();

    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
    Ok(())
}
