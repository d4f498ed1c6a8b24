//! Core data models for the alert judge

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Metric sample as handed in by pushers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    #[serde(default)]
    pub ident: String,
    pub metric: String,
    #[serde(default, alias = "tags")]
    pub tags_map: BTreeMap<String, String>,
    /// Seconds since epoch
    pub time: i64,
    pub value: f64,
    /// Always derived from the series key; a pushed value is ignored
    #[serde(default, skip_deserializing, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

impl MetricPoint {
    pub fn new(metric: impl Into<String>, time: i64, value: f64) -> Self {
        Self {
            metric: metric.into(),
            time,
            value,
            ..Default::default()
        }
    }

    pub fn with_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = ident.into();
        self.fingerprint.clear();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags_map.insert(key.into(), value.into());
        self.fingerprint.clear();
        self
    }

    /// Canonical series identity: metric followed by the sorted `k=v` tags.
    ///
    /// A non-empty ident participates as the `ident` tag unless the tag map
    /// already carries one.
    pub fn series_key(&self) -> String {
        let mut pairs: Vec<(&str, &str)> = self
            .tags_map
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if !self.ident.is_empty() && !self.tags_map.contains_key("ident") {
            pairs.push(("ident", self.ident.as_str()));
            pairs.sort_unstable();
        }

        let mut key = self.metric.clone();
        for (k, v) in pairs {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    /// Compute `fingerprint` on first use
    pub fn ensure_fingerprint(&mut self) -> &str {
        if self.fingerprint.is_empty() {
            self.fingerprint = md5_hex(&self.series_key());
        }
        &self.fingerprint
    }
}

/// Lowercase hex MD5 digest of `input`
pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Dedup key of a PUSH event: rule id plus the driving series
pub fn push_hash_id(rule_id: i64, series_key: &str) -> String {
    md5_hex(&format!("{}_{}", rule_id, series_key))
}

/// Dedup key of a PULL event: rule id plus the vector's label string
pub fn pull_hash_id(rule_id: i64, labels: &BTreeMap<String, String>) -> String {
    md5_hex(&format!("{}_{}", rule_id, label_string(labels)))
}

/// `k=v` pairs joined by commas, in key order
pub fn label_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Shortest decimal rendering of a value, `null` for NaN
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "null".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{}", value)
    }
}

fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// One `(timestamp, value)` sample of a window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: i64,
    #[serde(deserialize_with = "nullable_f64")]
    pub value: f64,
}

impl HistoryPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Evaluation window attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoints {
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub points: Vec<HistoryPoint>,
}

/// Sample of an instant vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    pub labels: BTreeMap<String, String>,
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    #[serde(alias = "push")]
    Push,
    #[serde(alias = "pull")]
    Pull,
}

/// How the booleans of a multi-expression rule are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combine {
    #[default]
    #[serde(alias = "all")]
    All,
    #[serde(alias = "any")]
    Any,
}

impl Combine {
    pub fn separator(&self) -> &'static str {
        match self {
            Combine::All => " & ",
            Combine::Any => " || ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "≠")]
    Ne,
}

/// Tolerance of `==` and `!=`
pub const EQUALITY_EPSILON: f64 = 0.0001;

impl Operator {
    /// `left optr right`; NaN never satisfies any operator
    pub fn check(&self, left: f64, right: f64) -> bool {
        if left.is_nan() || right.is_nan() {
            return false;
        }
        match self {
            Operator::Gt => left > right,
            Operator::Ge => left >= right,
            Operator::Lt => left < right,
            Operator::Le => left <= right,
            Operator::Eq => (left - right).abs() < EQUALITY_EPSILON,
            Operator::Ne => (left - right).abs() > EQUALITY_EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single thresholded expression of a PUSH rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exp {
    pub metric: String,
    pub func: String,
    #[serde(default)]
    pub params: Vec<i64>,
    pub optr: Operator,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterFunc {
    InList,
    NotInList,
    HasPrefix,
    NoPrefix,
    HasSuffix,
    NoSuffix,
    Contains,
    NotContains,
    MatchRegexp,
    NotMatchRegexp,
    InClasspath,
    NotInClasspath,
    InClasspathPrefix,
    NotInClasspathPrefix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Tag key for tag filters; unused by resource filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub func: FilterFunc,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushExpr {
    pub exps: Vec<Exp>,
    #[serde(default)]
    pub together_or_any: Combine,
    #[serde(default)]
    pub res_filters: Vec<Filter>,
    #[serde(default)]
    pub tag_filters: Vec<Filter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullExpr {
    pub prom_ql: String,
    #[serde(default)]
    pub evaluation_interval_seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyRouting {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub groups: Vec<i64>,
    #[serde(default)]
    pub users: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub priority: i32,
    /// Seconds the condition must hold (PULL) or the window length (PUSH)
    #[serde(default)]
    pub alert_duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_expr: Option<PushExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_expr: Option<PullExpr>,
    #[serde(default)]
    pub notify_routing: NotifyRouting,
    #[serde(default, rename = "runbookUrl")]
    pub runbook_url: String,
    #[serde(default)]
    pub note: String,
}

impl AlertRule {
    /// Metrics referenced by the PUSH expressions, deduplicated
    pub fn push_metrics(&self) -> Vec<&str> {
        let mut metrics: Vec<&str> = self
            .push_expr
            .iter()
            .flat_map(|e| e.exps.iter().map(|exp| exp.metric.as_str()))
            .collect();
        metrics.sort_unstable();
        metrics.dedup();
        metrics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert,
    Recovery,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Recovery => "recovery",
        }
    }
}

/// Event produced by the judges and finalized by the state store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub rule_id: i64,
    pub rule_name: String,
    #[serde(default)]
    pub note: String,
    pub hash_id: String,
    #[serde(default)]
    pub res_ident: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub history_points: Vec<HistoryPoints>,
    pub trigger_time: i64,
    #[serde(default)]
    pub values: String,
    #[serde(default)]
    pub notify_routing: NotifyRouting,
    #[serde(default)]
    pub readable_expression: String,
    #[serde(default)]
    pub tag_map: BTreeMap<String, String>,
    #[serde(default)]
    pub is_prome_pull: u8,
    #[serde(default)]
    pub is_recovery: u8,
    #[serde(default)]
    pub last_send: bool,
    #[serde(default)]
    pub alert_duration: i64,
    #[serde(default, rename = "runbookUrl")]
    pub runbook_url: String,
}

impl AlertEvent {
    /// Skeleton event carrying the rule's descriptive fields
    pub fn for_rule(rule: &AlertRule, hash_id: String) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            note: rule.note.clone(),
            hash_id,
            priority: rule.priority,
            notify_routing: rule.notify_routing.clone(),
            alert_duration: rule.alert_duration,
            runbook_url: rule.runbook_url.clone(),
            is_prome_pull: u8::from(rule.rule_type == RuleType::Pull),
            ..Default::default()
        }
    }

    pub fn mark_alert(&mut self) {
        self.is_recovery = 0;
    }

    pub fn mark_recovery(&mut self) {
        self.is_recovery = 1;
    }

    pub fn is_alerting(&self) -> bool {
        self.is_recovery == 0
    }

    pub fn is_pull(&self) -> bool {
        self.is_prome_pull == 1
    }

    pub fn kind(&self) -> EventKind {
        if self.is_alerting() {
            EventKind::Alert
        } else {
            EventKind::Recovery
        }
    }
}
