//! Storage backends: sample ingest and queries
//!
//! This module provides:
//! - The [`DataSource`] capability set consumed by the judges
//! - A Prometheus-backed implementation (remote write + HTTP query API)
//! - The named registry of configured backends

pub mod convert;
pub mod engine;
pub mod prometheus;
pub mod prompb;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod shipper;

pub use convert::{convert_point, validate_point};
pub use engine::{HttpQueryEngine, QueryEngine, RangeSeries};
pub use prometheus::{PrometheusConfig, PrometheusDataSource, RemoteConfig};
pub use queue::WriteQueue;
pub use registry::{DataSourceConfig, DataSourceRegistry};
pub use shipper::{DeliveryOutcome, Shipper, ShipperConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{HistoryPoint, MetricPoint, VectorSample};

/// Label key with the accepted values (alternatives)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagPair {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// One series selector of a range query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryParamOne {
    #[serde(default)]
    pub idents: Vec<String>,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub tag_pairs: Vec<TagPair>,
    /// Raw PromQL; overrides the selector fields when set
    #[serde(default)]
    pub prom_ql: Option<String>,
    /// Resolve idents from this classpath when `idents` is empty
    #[serde(default)]
    pub classpath_id: Option<i64>,
    /// Include resources of every classpath below `classpath_id`
    #[serde(default)]
    pub classpath_prefix: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataQueryParam {
    pub params: Vec<DataQueryParamOne>,
    /// Seconds; 0 means "limit window before end"
    #[serde(default)]
    pub start: i64,
    /// Seconds; 0 means now
    #[serde(default)]
    pub end: i64,
    /// Seconds; 0 selects auto resolution
    #[serde(default)]
    pub step: i64,
    /// Maximum series returned; 0 is unlimited
    #[serde(default)]
    pub limit: usize,
}

/// One series of a range query, aligned to the step grid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryResp {
    pub metric: String,
    pub ident: String,
    /// `k=v` pairs without `__name__`
    pub tags: String,
    pub resolution: i64,
    pub p_num: usize,
    pub values: Vec<HistoryPoint>,
}

/// Parameters shared by the label-introspection queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelQuery {
    #[serde(default)]
    pub idents: Vec<String>,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub tag_pairs: Vec<TagPair>,
    /// Label whose values are listed by `query_tag_values`
    #[serde(default)]
    pub label: String,
    /// Substring every returned item must contain
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub limit: usize,
}

/// Outcome of handing a batch of points to a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStats {
    pub accepted: usize,
    pub invalid: usize,
    pub dropped: usize,
}

/// Capability set of a storage backend
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Convert and enqueue points for remote write; never blocks
    fn push_to_queue(&self, points: &[MetricPoint]) -> PushStats;

    /// Series waiting to be shipped
    fn queue_len(&self) -> usize;

    /// Range query, one response per matched series
    async fn query_data(&self, param: &DataQueryParam) -> Result<Vec<DataQueryResp>>;

    /// Instant query at `time` (seconds), or now
    async fn query_data_instant(&self, promql: &str, time: Option<i64>) -> Result<Vec<VectorSample>>;

    async fn query_tag_keys(&self, query: &LabelQuery) -> Result<Vec<String>>;

    async fn query_tag_values(&self, query: &LabelQuery) -> Result<Vec<String>>;

    /// `k=v` pairs present on matching series
    async fn query_tag_pairs(&self, query: &LabelQuery) -> Result<Vec<String>>;

    async fn query_metrics(&self, query: &LabelQuery) -> Result<Vec<String>>;

    /// Instant vector at now, used by PULL evaluators
    async fn query_vector(&self, promql: &str) -> Result<Vec<VectorSample>>;

    /// Flush and release resources on shutdown
    async fn clean_up(&self);
}
