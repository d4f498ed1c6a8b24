//! Push a single sample

use anyhow::{bail, Result};
use judge_lib::models::MetricPoint;
use std::collections::BTreeMap;

use crate::client::{ApiClient, PushResponse};
use crate::output::{print_json, print_success, print_warning, OutputFormat};

/// Parse repeated `k=v` arguments
pub fn parse_tags(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("tag {:?} is not in k=v form", pair);
        };
        if key.is_empty() {
            bail!("tag {:?} has an empty key", pair);
        }
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

pub async fn push_point(
    client: &ApiClient,
    metric: String,
    ident: Option<String>,
    tags: &[String],
    value: f64,
    time: Option<i64>,
    format: OutputFormat,
) -> Result<()> {
    let point = MetricPoint {
        ident: ident.unwrap_or_default(),
        metric,
        tags_map: parse_tags(tags)?,
        time: time.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        value,
        fingerprint: String::new(),
    };

    let resp: PushResponse = client.post("api/v1/push", &[point]).await?;

    match format {
        OutputFormat::Json => print_json(&resp),
        OutputFormat::Table => {
            if resp.rejected > 0 {
                print_warning("Point rejected: invalid metric name or tag key");
            } else if resp.dropped > 0 {
                print_warning("Point dropped: write queue is full");
            } else {
                print_success("Point accepted");
            }
        }
    }

    Ok(())
}
