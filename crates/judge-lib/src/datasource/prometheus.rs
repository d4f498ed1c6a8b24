//! Prometheus-backed datasource
//!
//! Writes go through the bounded write queue and the remote-write shipper.
//! Reads are served by a [`QueryEngine`], normally the HTTP API of the
//! configured remote-read targets.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::convert::{convert_point, LABEL_IDENT, LABEL_NAME};
use super::engine::{HttpQueryEngine, QueryEngine, RangeSeries};
use super::queue::{WriteQueue, DEFAULT_QUEUE_CAPACITY};
use super::selector::{auto_step, bound_query, exact_selector, loose_selector};
use super::shipper::{RemoteWriteTarget, Shipper, ShipperConfig, DEFAULT_BATCH, DEFAULT_MAX_RETRY};
use super::{
    DataQueryParam, DataQueryParamOne, DataQueryResp, DataSource, LabelQuery, PushStats,
};
use crate::classpath::Classpath;
use crate::error::{JudgeError, Result};
use crate::models::{HistoryPoint, MetricPoint, VectorSample};
use crate::observability::JudgeMetrics;

/// A remote-write or remote-read endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default, alias = "remoteTimeoutSecond", alias = "remotetimeoutsecond")]
    pub remote_timeout_second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_max_retry", alias = "maxRetry", alias = "maxretry")]
    pub max_retry: u32,
    #[serde(
        default = "default_lookback_delta_minute",
        alias = "lookbackDeltaMinute",
        alias = "lookbackdeltaminute"
    )]
    pub lookback_delta_minute: i64,
    #[serde(
        default = "default_max_concurrent_query",
        alias = "maxConcurrentQuery",
        alias = "maxconcurrentquery"
    )]
    pub max_concurrent_query: usize,
    /// Cap on points materialized by one range query
    #[serde(default = "default_max_samples", alias = "maxSamples", alias = "maxsamples")]
    pub max_samples: usize,
    #[serde(
        default = "default_max_fetch_all_series_limit_minute",
        alias = "maxFetchAllSeriesLimitMinute",
        alias = "maxfetchallserieslimitminute"
    )]
    pub max_fetch_all_series_limit_minute: i64,
    #[serde(default = "default_queue_capacity", alias = "queueCapacity", alias = "queuecapacity")]
    pub queue_capacity: usize,
    #[serde(default, alias = "remoteWrite", alias = "remotewrite")]
    pub remote_write: Vec<RemoteConfig>,
    #[serde(default, alias = "remoteRead", alias = "remoteread")]
    pub remote_read: Vec<RemoteConfig>,
}

fn default_name() -> String {
    "prometheus".to_string()
}

fn default_batch() -> usize {
    DEFAULT_BATCH
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_lookback_delta_minute() -> i64 {
    2
}

fn default_max_concurrent_query() -> usize {
    30
}

fn default_max_samples() -> usize {
    50_000_000
}

fn default_max_fetch_all_series_limit_minute() -> i64 {
    5
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enable: false,
            name: default_name(),
            batch: default_batch(),
            max_retry: default_max_retry(),
            lookback_delta_minute: default_lookback_delta_minute(),
            max_concurrent_query: default_max_concurrent_query(),
            max_samples: default_max_samples(),
            max_fetch_all_series_limit_minute: default_max_fetch_all_series_limit_minute(),
            queue_capacity: default_queue_capacity(),
            remote_write: Vec::new(),
            remote_read: Vec::new(),
        }
    }
}

pub struct PrometheusDataSource {
    config: PrometheusConfig,
    queue: Arc<WriteQueue>,
    shipper: Arc<Shipper>,
    engine: Arc<dyn QueryEngine>,
    classpath: Option<Arc<dyn Classpath>>,
    query_slots: Semaphore,
    cancel: CancellationToken,
    shipper_task: Mutex<Option<JoinHandle<()>>>,
    metrics: JudgeMetrics,
}

impl PrometheusDataSource {
    /// Build the datasource with the HTTP query engine over `remote_read`
    pub fn new(
        config: PrometheusConfig,
        classpath: Option<Arc<dyn Classpath>>,
        metrics: JudgeMetrics,
    ) -> Result<Self> {
        let engine = HttpQueryEngine::new(&config.remote_read, config.lookback_delta_minute)?;
        Self::with_engine(config, Arc::new(engine), classpath, metrics)
    }

    pub fn with_engine(
        config: PrometheusConfig,
        engine: Arc<dyn QueryEngine>,
        classpath: Option<Arc<dyn Classpath>>,
        metrics: JudgeMetrics,
    ) -> Result<Self> {
        let queue = Arc::new(WriteQueue::new(config.queue_capacity));
        let targets = config
            .remote_write
            .iter()
            .map(RemoteWriteTarget::new)
            .collect::<Result<Vec<_>>>()?;
        let shipper = Shipper::new(
            Arc::clone(&queue),
            targets,
            ShipperConfig {
                batch: config.batch.max(1),
                max_retry: config.max_retry,
                ..Default::default()
            },
            metrics.clone(),
        );

        Ok(Self {
            query_slots: Semaphore::new(config.max_concurrent_query.max(1)),
            config,
            queue,
            shipper: Arc::new(shipper),
            engine,
            classpath,
            cancel: CancellationToken::new(),
            shipper_task: Mutex::new(None),
            metrics,
        })
    }

    /// Spawn the shipper loop; a second call is a no-op
    pub fn start(&self) {
        let mut task = self.shipper_task.lock();
        if task.is_some() {
            return;
        }
        if self.shipper.target_count() == 0 {
            warn!(datasource = %self.config.name, "No remote write targets configured, samples will only be queued");
        }
        *task = Some(tokio::spawn(
            Arc::clone(&self.shipper).run(self.cancel.child_token()),
        ));
    }

    pub fn config(&self) -> &PrometheusConfig {
        &self.config
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Idents selected by a data query, expanding a classpath reference
    fn resolve_idents(&self, one: &DataQueryParamOne) -> Option<Vec<String>> {
        if !one.idents.is_empty() {
            return Some(one.idents.clone());
        }
        let Some(id) = one.classpath_id else {
            return Some(Vec::new());
        };
        let classpath = self.classpath.as_ref()?;
        let entry = classpath.get(id)?;

        let mut idents: BTreeSet<String> = entry.res.into_iter().collect();
        if one.classpath_prefix {
            for child in classpath.gets_by_prefix(&entry.path) {
                idents.extend(child.res);
            }
        }
        if idents.is_empty() {
            None
        } else {
            Some(idents.into_iter().collect())
        }
    }

    async fn range(&self, selector: &str, start: i64, end: i64, step: i64) -> Result<Vec<RangeSeries>> {
        let _permit = self
            .query_slots
            .acquire()
            .await
            .map_err(|_| JudgeError::Query("datasource is shutting down".to_string()))?;
        self.engine.range(selector, start, end, step).await
    }

    async fn instant(&self, promql: &str, time: i64) -> Result<Vec<VectorSample>> {
        let _permit = self
            .query_slots
            .acquire()
            .await
            .map_err(|_| JudgeError::Query("datasource is shutting down".to_string()))?;
        self.engine.instant(promql, time).await
    }

    /// Label sets matching an introspection query
    async fn label_sets(&self, query: &LabelQuery) -> Result<Vec<BTreeMap<String, String>>> {
        let selector = loose_selector(&query.metric, &query.idents, &query.tag_pairs);
        let bounded = bound_query(
            &selector,
            query.start,
            query.end,
            Self::now(),
            self.config.max_fetch_all_series_limit_minute,
        );
        let _permit = self
            .query_slots
            .acquire()
            .await
            .map_err(|_| JudgeError::Query("datasource is shutting down".to_string()))?;
        self.engine
            .series(&bounded.selector, bounded.start, bounded.end)
            .await
    }
}

/// Place samples on the `start + k*step` grid; gaps become NaN and
/// samples within one second of a grid slot are snapped onto it
pub fn align_to_grid(points: &[HistoryPoint], start: i64, end: i64, step: i64) -> Vec<HistoryPoint> {
    let step = step.max(1);
    let mut aligned = Vec::with_capacity(((end - start) / step + 1).max(0) as usize);
    let mut idx = 0;
    let mut slot = start;

    while slot <= end {
        while idx < points.len() && points[idx].timestamp < slot - 1 {
            idx += 1;
        }
        let value = match points.get(idx) {
            Some(p) if (p.timestamp - slot).abs() <= 1 => {
                idx += 1;
                p.value
            }
            _ => f64::NAN,
        };
        aligned.push(HistoryPoint::new(slot, value));
        slot += step;
    }

    aligned
}

fn tags_without_name(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != LABEL_NAME)
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn finish(items: BTreeSet<String>, limit: usize) -> Vec<String> {
    let iter = items.into_iter();
    if limit > 0 {
        iter.take(limit).collect()
    } else {
        iter.collect()
    }
}

#[async_trait]
impl DataSource for PrometheusDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push_to_queue(&self, points: &[MetricPoint]) -> PushStats {
        let mut stats = PushStats::default();
        for point in points {
            match convert_point(point) {
                Ok(series) => {
                    if self.queue.push(series) {
                        stats.accepted += 1;
                    } else {
                        stats.dropped += 1;
                        self.metrics.inc_write_queue_dropped();
                        debug!(metric = %point.metric, capacity = self.queue.capacity(), "Write queue full, sample dropped");
                    }
                }
                Err(e) => {
                    stats.invalid += 1;
                    self.metrics.inc_invalid_sample();
                    debug!(error = %e, "Sample rejected");
                }
            }
        }
        self.metrics.set_write_queue_length(self.queue.len());
        stats
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }

    async fn query_data(&self, param: &DataQueryParam) -> Result<Vec<DataQueryResp>> {
        let now = Self::now();
        let mut out = Vec::new();
        let mut samples = 0usize;

        for one in &param.params {
            let selector = match &one.prom_ql {
                Some(ql) if !ql.trim().is_empty() => ql.clone(),
                _ => {
                    let Some(idents) = self.resolve_idents(one) else {
                        debug!(classpath_id = ?one.classpath_id, "Classpath resolved to no resources");
                        continue;
                    };
                    exact_selector(&one.metric, &idents, &one.tag_pairs)
                }
            };

            let bounded = bound_query(
                &selector,
                param.start,
                param.end,
                now,
                self.config.max_fetch_all_series_limit_minute,
            );
            let step = if param.step > 0 {
                param.step
            } else {
                auto_step(bounded.start, bounded.end)
            };

            for series in self.range(&bounded.selector, bounded.start, bounded.end, step).await? {
                if param.limit > 0 && out.len() >= param.limit {
                    return Ok(out);
                }
                samples += series.points.len();
                if self.config.max_samples > 0 && samples > self.config.max_samples {
                    return Err(JudgeError::Query(format!(
                        "query exceeds max samples ({})",
                        self.config.max_samples
                    )));
                }

                let values = align_to_grid(&series.points, bounded.start, bounded.end, step);
                out.push(DataQueryResp {
                    metric: series
                        .labels
                        .get(LABEL_NAME)
                        .cloned()
                        .unwrap_or_else(|| one.metric.clone()),
                    ident: series.labels.get(LABEL_IDENT).cloned().unwrap_or_default(),
                    tags: tags_without_name(&series.labels),
                    resolution: step,
                    p_num: values.len(),
                    values,
                });
            }
        }

        Ok(out)
    }

    async fn query_data_instant(&self, promql: &str, time: Option<i64>) -> Result<Vec<VectorSample>> {
        self.instant(promql, time.unwrap_or_else(Self::now)).await
    }

    async fn query_tag_keys(&self, query: &LabelQuery) -> Result<Vec<String>> {
        let keys = self
            .label_sets(query)
            .await?
            .into_iter()
            .flat_map(|labels| labels.into_keys())
            .filter(|k| k != LABEL_NAME && k.contains(&query.search))
            .collect();
        Ok(finish(keys, query.limit))
    }

    async fn query_tag_values(&self, query: &LabelQuery) -> Result<Vec<String>> {
        if query.label.is_empty() {
            return Err(JudgeError::Query("tag values query needs a label".to_string()));
        }
        let values = self
            .label_sets(query)
            .await?
            .into_iter()
            .filter_map(|mut labels| labels.remove(&query.label))
            .filter(|v| v.contains(&query.search))
            .collect();
        Ok(finish(values, query.limit))
    }

    async fn query_tag_pairs(&self, query: &LabelQuery) -> Result<Vec<String>> {
        let pairs = self
            .label_sets(query)
            .await?
            .into_iter()
            .flat_map(|labels| {
                labels
                    .into_iter()
                    .filter(|(k, _)| k != LABEL_NAME)
                    .map(|(k, v)| format!("{}={}", k, v))
            })
            .filter(|pair| pair.contains(&query.search))
            .collect();
        Ok(finish(pairs, query.limit))
    }

    async fn query_metrics(&self, query: &LabelQuery) -> Result<Vec<String>> {
        let names = self
            .label_sets(query)
            .await?
            .into_iter()
            .filter_map(|mut labels| labels.remove(LABEL_NAME))
            .filter(|name| name.contains(&query.search))
            .collect();
        Ok(finish(names, query.limit))
    }

    async fn query_vector(&self, promql: &str) -> Result<Vec<VectorSample>> {
        self.instant(promql, Self::now()).await
    }

    async fn clean_up(&self) {
        self.cancel.cancel();
        let task = self.shipper_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Shipper task ended abnormally");
            }
        }
        let flushed = self.shipper.flush().await;
        self.query_slots.close();
        info!(datasource = %self.config.name, flushed = flushed, "Datasource cleaned up");
    }
}
