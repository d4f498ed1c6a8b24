//! Drain pending alert and recovery events

use anyhow::Result;
use judge_lib::models::AlertEvent;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_timestamp, print_info, print_rows, OutputFormat};

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Ident")]
    ident: String,
    #[tabled(rename = "Triggered")]
    triggered: String,
    #[tabled(rename = "Values")]
    values: String,
}

fn to_row(event: &AlertEvent) -> EventRow {
    EventRow {
        kind: color_status(event.kind().as_str()),
        rule: format!("{} ({})", event.rule_name, event.rule_id),
        ident: event.res_ident.clone(),
        triggered: format_timestamp(event.trigger_time),
        values: event.values.clone(),
    }
}

pub async fn drain_events(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let path = format!("api/v1/events?limit={}", limit);
    let events: Vec<AlertEvent> = client.get(&path).await?;

    if events.is_empty() && matches!(format, OutputFormat::Table) {
        print_info("No pending events");
        return Ok(());
    }

    let rows = events.iter().map(to_row).collect();
    print_rows(&events, rows, format);
    Ok(())
}
