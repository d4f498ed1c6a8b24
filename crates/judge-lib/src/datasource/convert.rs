//! Sample conversion: validate a pushed point and turn it into a labeled series

use regex::Regex;
use std::sync::OnceLock;

use super::prompb::{Label, Sample, TimeSeries};
use crate::error::{JudgeError, Result};
use crate::models::MetricPoint;

pub const LABEL_NAME: &str = "__name__";
pub const LABEL_IDENT: &str = "ident";

fn metric_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("valid metric name regex"))
}

fn label_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid label name regex"))
}

/// Check metric name and tag keys
pub fn validate_point(point: &MetricPoint) -> Result<()> {
    if point.metric.is_empty() {
        return Err(JudgeError::InvalidSample("empty metric name".to_string()));
    }
    if !metric_name_re().is_match(&point.metric) {
        return Err(JudgeError::InvalidSample(format!(
            "invalid metric name {:?}",
            point.metric
        )));
    }
    if let Some(key) = point.tags_map.keys().find(|k| !label_name_re().is_match(k)) {
        return Err(JudgeError::InvalidSample(format!(
            "invalid tag key {:?} on metric {}",
            key, point.metric
        )));
    }
    Ok(())
}

/// Convert a validated point into a remote-write series with sorted labels
pub fn convert_point(point: &MetricPoint) -> Result<TimeSeries> {
    validate_point(point)?;

    let mut labels = Vec::with_capacity(point.tags_map.len() + 2);
    labels.push(Label {
        name: LABEL_NAME.to_string(),
        value: point.metric.clone(),
    });
    if !point.ident.is_empty() {
        labels.push(Label {
            name: LABEL_IDENT.to_string(),
            value: point.ident.clone(),
        });
    }
    for (key, value) in &point.tags_map {
        // reserved labels injected above win over same-named tags
        if key == LABEL_NAME || (key == LABEL_IDENT && !point.ident.is_empty()) {
            continue;
        }
        labels.push(Label {
            name: key.clone(),
            value: value.clone(),
        });
    }
    labels.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(TimeSeries {
        labels,
        samples: vec![Sample {
            value: point.value,
            timestamp: point.time * 1000,
        }],
    })
}
