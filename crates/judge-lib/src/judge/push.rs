//! PUSH judge: evaluates matching rules on every arriving point
//!
//! Points are routed to a fixed pool of workers by fingerprint, so every
//! point of a series is handled by the same worker in arrival order. A
//! worker evaluates the rules of one point concurrently and waits for all
//! of them before taking the next point.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::PointCache;
use super::events::{EventStateStore, Outcome};
use super::func::describe;
use super::index::{CompiledRule, RuleIndex};
use crate::datasource::{validate_point, DataQueryParam, DataQueryParamOne, DataSource, TagPair};
use crate::models::{
    format_value, push_hash_id, AlertEvent, Combine, HistoryPoint, HistoryPoints, MetricPoint,
};
use crate::observability::JudgeMetrics;

/// Extra seconds in front of a backend window to absorb scrape jitter
const QUERY_SLACK_SECS: i64 = 2;

/// Shared evaluation state, cheap to clone into tasks
#[derive(Clone)]
pub struct JudgeCore {
    index: Arc<RuleIndex>,
    cache: Arc<PointCache>,
    store: Arc<EventStateStore>,
    source: Arc<dyn DataSource>,
    metrics: JudgeMetrics,
}

impl JudgeCore {
    pub fn new(
        index: Arc<RuleIndex>,
        cache: Arc<PointCache>,
        store: Arc<EventStateStore>,
        source: Arc<dyn DataSource>,
        metrics: JudgeMetrics,
    ) -> Self {
        Self {
            index,
            cache,
            store,
            source,
            metrics,
        }
    }

    pub fn index(&self) -> &Arc<RuleIndex> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<PointCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<EventStateStore> {
        &self.store
    }

    /// [`JudgeCore::handle_point_at`] with the wall clock
    pub async fn handle_point(&self, point: MetricPoint) -> usize {
        self.handle_point_at(point, chrono::Utc::now().timestamp()).await
    }

    /// Cache the point and evaluate every rule that selects it.
    ///
    /// Returns the number of rules evaluated.
    pub async fn handle_point_at(&self, mut point: MetricPoint, now: i64) -> usize {
        if let Err(e) = validate_point(&point) {
            debug!(metric = %point.metric, error = %e, "Invalid sample skipped by judge");
            return 0;
        }

        let rules = self.index.match_rules(&point);
        if rules.is_empty() {
            return 0;
        }

        point.ensure_fingerprint();
        let max_duration = rules
            .iter()
            .map(|r| r.rule.alert_duration)
            .max()
            .unwrap_or(0);
        if !self
            .cache
            .put(&point.fingerprint, point.time, point.value, max_duration)
        {
            debug!(
                fingerprint = %point.fingerprint,
                time = point.time,
                "Out-of-order point dropped"
            );
            return 0;
        }

        let point = Arc::new(point);
        let count = rules.len();
        let mut tasks = JoinSet::new();
        for rule in rules {
            let core = self.clone();
            let point = Arc::clone(&point);
            tasks.spawn(async move { core.evaluate(&rule, &point, now).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Rule evaluation task failed");
            }
        }
        count
    }

    /// Evaluate one rule for the point's series.
    ///
    /// `None` when the round is abandoned (empty window, failed or empty
    /// backend query).
    pub async fn evaluate(&self, rule: &CompiledRule, point: &MetricPoint, now: i64) -> Option<Outcome> {
        let duration = rule.rule.alert_duration;
        let history = self.cache.history(&point.fingerprint, point.time - duration);
        if history.is_empty() {
            return None;
        }

        let mut triggers = Vec::new();
        let mut values = Vec::new();
        let mut infos = Vec::new();
        let mut windows = Vec::new();

        for (exp, func) in rule.expressions() {
            let window = if exp.metric == point.metric {
                history.clone()
            } else {
                self.fetch_window(rule, &exp.metric, point, now - duration - QUERY_SLACK_SECS, now)
                    .await?
            };

            let compare = match func.comparison_offset() {
                Some(offset) => {
                    let end = now - offset;
                    let earlier = self
                        .fetch_window(rule, &exp.metric, point, end - duration - QUERY_SLACK_SECS, end)
                        .await?;
                    Some(earlier.iter().map(|p| p.value).sum::<f64>() / earlier.len() as f64)
                }
                None => None,
            };

            let result = func.evaluate(&window, exp.optr, exp.threshold, compare);
            triggers.push(result.triggered);
            values.push(format!("{}: {}", exp.metric, format_value(result.left)));
            infos.push(describe(exp, duration));
            windows.push(HistoryPoints {
                metric: exp.metric.clone(),
                tags: point.tags_map.clone(),
                points: window,
            });
        }

        let triggered = match rule.combine() {
            Combine::All => triggers.iter().all(|t| *t),
            Combine::Any => triggers.iter().any(|t| *t),
        };

        let mut event = AlertEvent::for_rule(&rule.rule, push_hash_id(rule.id(), &point.series_key()));
        event.res_ident = point.ident.clone();
        event.tag_map = point.tags_map.clone();
        event.trigger_time = point.time;
        event.values = values.join("; ");
        event.readable_expression = infos.join(rule.combine().separator());
        event.history_points = windows;

        Some(self.store.process_push(event, triggered))
    }

    /// Newest-first, NaN-free window of another metric of the same series
    async fn fetch_window(
        &self,
        rule: &CompiledRule,
        metric: &str,
        point: &MetricPoint,
        start: i64,
        end: i64,
    ) -> Option<Vec<HistoryPoint>> {
        let selector = DataQueryParamOne {
            idents: if point.ident.is_empty() {
                Vec::new()
            } else {
                vec![point.ident.clone()]
            },
            metric: metric.to_string(),
            tag_pairs: point
                .tags_map
                .iter()
                .filter(|(k, _)| k.as_str() != "ident")
                .map(|(k, v)| TagPair {
                    key: k.clone(),
                    values: vec![v.clone()],
                })
                .collect(),
            ..Default::default()
        };
        let param = DataQueryParam {
            params: vec![selector],
            start,
            end,
            step: 0,
            limit: 0,
        };

        let resp = match self.source.query_data(&param).await {
            Ok(resp) => resp,
            Err(e) => {
                self.metrics.inc_query_error(self.source.name());
                warn!(
                    rule_id = rule.id(),
                    metric = %metric,
                    error = %e,
                    "Backend query failed, rule abandoned"
                );
                return None;
            }
        };

        let mut points: Vec<HistoryPoint> = resp
            .into_iter()
            .flat_map(|series| series.values)
            .filter(|p| !p.value.is_nan())
            .collect();
        if points.is_empty() {
            debug!(rule_id = rule.id(), metric = %metric, "No backend data, rule abandoned");
            return None;
        }
        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Some(points)
    }
}

/// `judge.*` worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushJudgeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_worker_queue", alias = "workerQueue", alias = "workerqueue")]
    pub worker_queue: usize,
    #[serde(
        default = "default_stale_sweep_secs",
        alias = "staleSweepSecs",
        alias = "stalesweepsecs"
    )]
    pub stale_sweep_secs: u64,
    #[serde(
        default = "default_stale_grace_secs",
        alias = "staleGraceSecs",
        alias = "stalegracesecs"
    )]
    pub stale_grace_secs: i64,
}

fn default_workers() -> usize {
    16
}

fn default_worker_queue() -> usize {
    10_000
}

fn default_stale_sweep_secs() -> u64 {
    3600
}

fn default_stale_grace_secs() -> i64 {
    super::cache::DEFAULT_STALE_GRACE_SECS
}

impl Default for PushJudgeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            worker_queue: default_worker_queue(),
            stale_sweep_secs: default_stale_sweep_secs(),
            stale_grace_secs: default_stale_grace_secs(),
        }
    }
}

/// Fixed pool of PUSH workers fed by bounded channels
pub struct PushJudge {
    senders: Vec<mpsc::Sender<MetricPoint>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    metrics: JudgeMetrics,
}

impl PushJudge {
    /// Spawn the worker pool
    pub fn start(core: JudgeCore, config: &PushJudgeConfig, cancel: CancellationToken) -> Self {
        let worker_count = config.workers.max(1);
        let depth = config.worker_queue.max(1);
        let metrics = core.metrics.clone();

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(depth);
            senders.push(tx);
            workers.push(tokio::spawn(Self::worker(id, core.clone(), rx, cancel.clone())));
        }
        info!(workers = worker_count, queue = depth, "PUSH judge started");

        Self {
            senders,
            workers: Mutex::new(workers),
            cancel,
            metrics,
        }
    }

    async fn worker(
        id: usize,
        core: JudgeCore,
        mut rx: mpsc::Receiver<MetricPoint>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(point) => {
                        core.handle_point(point).await;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!(worker = id, "PUSH worker stopped");
    }

    /// Worker owning a fingerprint
    pub fn route(&self, fingerprint: &str) -> usize {
        let bucket = fingerprint
            .get(..8)
            .and_then(|prefix| u32::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        bucket as usize % self.senders.len()
    }

    /// Hand a point to its worker without waiting.
    ///
    /// Returns false when the worker's queue is full or the pool stopped.
    pub fn submit(&self, mut point: MetricPoint) -> bool {
        let worker = self.route(point.ensure_fingerprint());
        match self.senders[worker].try_send(point) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(point)) => {
                self.metrics.inc_push_dropped();
                debug!(worker = worker, metric = %point.metric, "PUSH worker queue full, point dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Stop the workers and wait for them; later calls return at once
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "PUSH worker ended abnormally");
            }
        }
        info!("PUSH judge stopped");
    }
}
