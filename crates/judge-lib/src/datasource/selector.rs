//! PromQL selector construction for data and introspection queries

use super::TagPair;

/// Selector used when a query carries no predicate at all
pub const DEFAULT_QL: &str = r#"{__name__=~".*a.*|.*e.*"}"#;

/// Base step (seconds) of auto resolution
pub const DEFAULT_STEP: i64 = 15;

const EMPTY_SELECTOR: &str = "{}";

/// Accumulates label matchers and renders `{a="x",b=~"y|z"}`
#[derive(Debug, Default, Clone)]
pub struct SelectorBuilder {
    matchers: Vec<String>,
}

impl SelectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(mut self, name: &str, value: &str) -> Self {
        self.matchers
            .push(format!("{}=\"{}\"", name, escape_value(value)));
        self
    }

    pub fn regex(mut self, name: &str, pattern: &str) -> Self {
        self.matchers
            .push(format!("{}=~\"{}\"", name, escape_value(pattern)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn build(&self) -> String {
        format!("{{{}}}", self.matchers.join(","))
    }
}

/// Escape a value for use inside a double-quoted PromQL string
fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn non_empty(values: &[String]) -> Vec<&str> {
    values
        .iter()
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .collect()
}

/// Exact-match selector for data queries
pub fn exact_selector(metric: &str, idents: &[String], tags: &[TagPair]) -> String {
    let mut builder = SelectorBuilder::new();
    if !metric.is_empty() {
        builder = builder.equal("__name__", metric);
    }
    let idents = non_empty(idents);
    if !idents.is_empty() {
        builder = builder.regex("ident", &idents.join("|"));
    }
    for pair in tags {
        let values = non_empty(&pair.values);
        if pair.key.is_empty() || values.is_empty() {
            continue;
        }
        builder = builder.regex(&pair.key, &values.join("|"));
    }
    builder.build()
}

/// Substring-match selector for label introspection
pub fn loose_selector(metric: &str, idents: &[String], tags: &[TagPair]) -> String {
    let mut builder = SelectorBuilder::new();
    if !metric.is_empty() {
        builder = builder.regex("__name__", &format!(".*{}.*", metric));
    }
    let idents = non_empty(idents);
    if !idents.is_empty() {
        builder = builder.regex("ident", &idents.join("|"));
    }
    for pair in tags {
        let values = non_empty(&pair.values);
        if pair.key.is_empty() || values.is_empty() {
            continue;
        }
        let alternatives: Vec<String> = values.iter().map(|v| format!(".*{}.*", v)).collect();
        builder = builder.regex(&pair.key, &alternatives.join("|"));
    }
    builder.build()
}

/// Resolution for a zero step: one 15 s slot per started hour of range
pub fn auto_step(start: i64, end: i64) -> i64 {
    let span = (end - start).max(0);
    let hours = (span + 3599) / 3600;
    hours.max(1) * DEFAULT_STEP
}

/// Selector and time range actually sent to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedQuery {
    pub selector: String,
    pub start: i64,
    pub end: i64,
}

/// Fill open range ends and swap an empty selector for [`DEFAULT_QL`].
///
/// An empty selector additionally limits the range to the last
/// `limit_minutes` before `end`.
pub fn bound_query(selector: &str, start: i64, end: i64, now: i64, limit_minutes: i64) -> BoundedQuery {
    let window = limit_minutes.max(1) * 60;
    let end = if end <= 0 { now } else { end };
    let mut start = if start <= 0 { end - window } else { start };

    let selector = if selector.is_empty() || selector == EMPTY_SELECTOR {
        if end - start > window {
            start = end - window;
        }
        DEFAULT_QL.to_string()
    } else {
        selector.to_string()
    };

    BoundedQuery { selector, start, end }
}
