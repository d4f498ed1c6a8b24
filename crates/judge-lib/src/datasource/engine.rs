//! PromQL evaluation through the Prometheus HTTP query API

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::prometheus::RemoteConfig;
use crate::error::{JudgeError, Result};
use crate::models::{HistoryPoint, VectorSample};

/// Upper bound of a single backend query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const REMOTE_READ_SUFFIX: &str = "/api/v1/read";

/// One series of a range query
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<HistoryPoint>,
}

/// Query engine consumed by the Prometheus datasource
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Instant vector at `time` (seconds)
    async fn instant(&self, promql: &str, time: i64) -> Result<Vec<VectorSample>>;

    /// Range matrix over `[start, end]` with `step` seconds between points
    async fn range(&self, promql: &str, start: i64, end: i64, step: i64) -> Result<Vec<RangeSeries>>;

    /// Label sets of series matching `selector` within the range
    async fn series(&self, selector: &str, start: i64, end: i64)
        -> Result<Vec<BTreeMap<String, String>>>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `[<unix seconds>, "<value>"]`
type SamplePair = (f64, String);

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorEntry>),
    Matrix(Vec<MatrixEntry>),
    Scalar(SamplePair),
    String(SamplePair),
}

#[derive(Debug, Deserialize)]
struct VectorEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: SamplePair,
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<SamplePair>,
}

fn parse_sample((ts, raw): &SamplePair) -> HistoryPoint {
    HistoryPoint::new(ts.floor() as i64, raw.parse::<f64>().unwrap_or(f64::NAN))
}

struct QueryTarget {
    name: String,
    base: String,
    timeout: Duration,
}

/// Binds [`QueryEngine`] to the HTTP API of the remote-read targets.
///
/// Targets are tried in configuration order; the first answer wins.
pub struct HttpQueryEngine {
    targets: Vec<QueryTarget>,
    client: reqwest::Client,
    lookback_delta: Option<String>,
}

impl HttpQueryEngine {
    pub fn new(remote_read: &[RemoteConfig], lookback_delta_minute: i64) -> Result<Self> {
        let mut targets = Vec::with_capacity(remote_read.len());
        for remote in remote_read {
            let base = api_base(&remote.url)?;
            let timeout = if remote.remote_timeout_second > 0 {
                Duration::from_secs(remote.remote_timeout_second).min(DEFAULT_QUERY_TIMEOUT)
            } else {
                DEFAULT_QUERY_TIMEOUT
            };
            targets.push(QueryTarget {
                name: if remote.name.is_empty() {
                    base.clone()
                } else {
                    remote.name.clone()
                },
                base,
                timeout,
            });
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_QUERY_TIMEOUT)
            .build()
            .map_err(|e| JudgeError::Config(format!("query client: {}", e)))?;

        Ok(Self {
            targets,
            client,
            lookback_delta: (lookback_delta_minute > 0).then(|| format!("{}m", lookback_delta_minute)),
        })
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        let mut last_error = JudgeError::Query("no remote read targets configured".to_string());

        for target in &self.targets {
            match self.get_from(target, path, params).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(remote = %target.name, path = %path, error = %e, "Query against target failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn get_from<T: DeserializeOwned>(
        &self,
        target: &QueryTarget,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", target.base, path);
        debug!(url = %url, "Querying backend");

        let response = self
            .client
            .get(&url)
            .timeout(target.timeout)
            .query(params)
            .send()
            .await
            .map_err(|e| JudgeError::Query(format!("{}: {}", target.name, e)))?;

        let status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            JudgeError::Query(format!("{}: unreadable response ({}): {}", target.name, status, e))
        })?;

        if body.status != "success" {
            return Err(JudgeError::Query(format!(
                "{}: {}: {}",
                target.name,
                body.error_type.unwrap_or_else(|| status.to_string()),
                body.error.unwrap_or_default()
            )));
        }

        body.data
            .ok_or_else(|| JudgeError::Query(format!("{}: response without data", target.name)))
    }

    fn with_lookback(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(delta) = &self.lookback_delta {
            params.push(("lookback_delta", delta.clone()));
        }
        params
    }
}

/// API root of a target given its remote-read (or plain) URL
fn api_base(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw)
        .map_err(|e| JudgeError::Config(format!("remote read url {:?}: {}", raw, e)))?;
    let text = parsed.as_str().trim_end_matches('/');
    let base = text.strip_suffix(REMOTE_READ_SUFFIX).unwrap_or(text);
    Ok(base.trim_end_matches('/').to_string())
}

#[async_trait]
impl QueryEngine for HttpQueryEngine {
    async fn instant(&self, promql: &str, time: i64) -> Result<Vec<VectorSample>> {
        let params = self.with_lookback(vec![("query", promql.to_string()), ("time", time.to_string())]);
        let data: QueryData = self.get("/api/v1/query", &params).await?;

        Ok(match data {
            QueryData::Vector(entries) => entries
                .into_iter()
                .map(|entry| {
                    let point = parse_sample(&entry.value);
                    VectorSample {
                        labels: entry.metric,
                        timestamp: point.timestamp,
                        value: point.value,
                    }
                })
                .collect(),
            QueryData::Scalar(pair) | QueryData::String(pair) => {
                let point = parse_sample(&pair);
                vec![VectorSample {
                    labels: BTreeMap::new(),
                    timestamp: point.timestamp,
                    value: point.value,
                }]
            }
            QueryData::Matrix(_) => {
                return Err(JudgeError::Query(
                    "instant query returned a range matrix".to_string(),
                ))
            }
        })
    }

    async fn range(&self, promql: &str, start: i64, end: i64, step: i64) -> Result<Vec<RangeSeries>> {
        let params = self.with_lookback(vec![
            ("query", promql.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", step.max(1).to_string()),
        ]);
        let data: QueryData = self.get("/api/v1/query_range", &params).await?;

        match data {
            QueryData::Matrix(entries) => Ok(entries
                .into_iter()
                .map(|entry| RangeSeries {
                    labels: entry.metric,
                    points: entry.values.iter().map(parse_sample).collect(),
                })
                .collect()),
            _ => Err(JudgeError::Query(
                "range query did not return a matrix".to_string(),
            )),
        }
    }

    async fn series(
        &self,
        selector: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        let params = vec![
            ("match[]", selector.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ];
        self.get("/api/v1/series", &params).await
    }
}
