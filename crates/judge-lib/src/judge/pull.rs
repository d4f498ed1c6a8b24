//! PULL rule manager and the per-rule evaluators it runs

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::EventStateStore;
use super::index::RuleIndex;
use crate::cluster::RingHandle;
use crate::datasource::DataSource;
use crate::error::{JudgeError, Result};
use crate::models::{
    format_value, label_string, md5_hex, pull_hash_id, AlertEvent, AlertRule, HistoryPoint,
    HistoryPoints, VectorSample,
};
use crate::observability::JudgeMetrics;

/// Used when a PULL rule does not set its own interval
pub const DEFAULT_EVALUATION_INTERVAL_SECS: i64 = 15;

/// `pull.*` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(
        default = "default_sync_interval",
        alias = "syncIntervalSecs",
        alias = "syncintervalsecs"
    )]
    pub sync_interval_secs: u64,
    #[serde(default = "default_start_delay", alias = "startDelaySecs", alias = "startdelaysecs")]
    pub start_delay_secs: u64,
}

fn default_sync_interval() -> u64 {
    9
}

fn default_start_delay() -> u64 {
    33
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            start_delay_secs: default_start_delay(),
        }
    }
}

/// Seconds between evaluations of a rule
pub fn evaluation_interval(rule: &AlertRule) -> i64 {
    match rule.pull_expr.as_ref().map(|e| e.evaluation_interval_seconds) {
        Some(secs) if secs > 0 => secs,
        _ => DEFAULT_EVALUATION_INTERVAL_SECS,
    }
}

/// Identity of a rule's evaluator; changes whenever it must be restarted
pub fn rule_key(rule: &AlertRule) -> String {
    let promql = rule.pull_expr.as_ref().map_or("", |e| e.prom_ql.as_str());
    md5_hex(&format!(
        "{}_{}_{}_{}",
        rule.id,
        rule.alert_duration,
        evaluation_interval(rule),
        promql
    ))
}

/// Periodic evaluation of one PULL rule
pub struct PullEvaluator {
    rule: Arc<AlertRule>,
    source: Arc<dyn DataSource>,
    store: Arc<EventStateStore>,
    metrics: JudgeMetrics,
}

impl PullEvaluator {
    pub fn new(
        rule: Arc<AlertRule>,
        source: Arc<dyn DataSource>,
        store: Arc<EventStateStore>,
        metrics: JudgeMetrics,
    ) -> Self {
        Self {
            rule,
            source,
            store,
            metrics,
        }
    }

    fn promql(&self) -> &str {
        self.rule.pull_expr.as_ref().map_or("", |e| e.prom_ql.as_str())
    }

    /// Run the query once and hand every sample to the state store.
    ///
    /// Returns the keep set passed to recovery resolution. On query failure
    /// nothing is resolved.
    pub async fn evaluate_once(&self, now: i64) -> Result<HashSet<String>> {
        let vector = match self.source.query_vector(self.promql()).await {
            Ok(vector) => vector,
            Err(e) => {
                self.metrics.inc_query_error(self.source.name());
                warn!(rule_id = self.rule.id, error = %e, "PULL query failed, round skipped");
                return Err(e);
            }
        };
        Ok(self.apply(vector, now))
    }

    fn apply(&self, vector: Vec<VectorSample>, now: i64) -> HashSet<String> {
        let mut keep = HashSet::with_capacity(vector.len());
        for sample in vector {
            let hash_id = pull_hash_id(self.rule.id, &sample.labels);
            let mut event = AlertEvent::for_rule(&self.rule, hash_id.clone());
            event.trigger_time = sample.timestamp;
            event.res_ident = sample.labels.get("ident").cloned().unwrap_or_default();
            event.values = format!("{}: {}", label_string(&sample.labels), format_value(sample.value));
            event.readable_expression = self.promql().to_string();
            event.history_points = vec![HistoryPoints {
                metric: sample.labels.get("__name__").cloned().unwrap_or_default(),
                tags: sample.labels.clone(),
                points: vec![HistoryPoint::new(sample.timestamp, sample.value)],
            }];
            event.tag_map = sample.labels;

            self.store.process_pull(event, now);
            keep.insert(hash_id);
        }

        let recovered = self.store.resolve_pull(self.rule.id, &keep, now);
        if recovered > 0 {
            debug!(rule_id = self.rule.id, recovered = recovered, "PULL series recovered");
        }
        keep
    }

    /// Evaluate every interval until cancelled.
    ///
    /// A cancelled round discards whatever its query returns.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(evaluation_interval(&self.rule).max(1) as u64);
        debug!(rule_id = self.rule.id, interval_secs = interval.as_secs(), "PULL evaluator started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = chrono::Utc::now().timestamp();
            tokio::select! {
                _ = self.evaluate_once(now) => {}
                _ = cancel.cancelled() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        debug!(rule_id = self.rule.id, "PULL evaluator stopped");
    }
}

struct ActiveEvaluator {
    key: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What one sync pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: usize,
    pub stopped: usize,
    /// PULL states dropped for rules deleted or moved to another instance
    pub released_states: usize,
    pub unassigned: usize,
    pub active: usize,
}

/// Keeps one evaluator running for every PULL rule this instance owns
pub struct PullRuleManager {
    index: Arc<RuleIndex>,
    ring: RingHandle,
    endpoint: String,
    source: Arc<dyn DataSource>,
    store: Arc<EventStateStore>,
    metrics: JudgeMetrics,
    config: PullConfig,
    active: Mutex<HashMap<i64, ActiveEvaluator>>,
}

impl PullRuleManager {
    pub fn new(
        index: Arc<RuleIndex>,
        ring: RingHandle,
        endpoint: impl Into<String>,
        source: Arc<dyn DataSource>,
        store: Arc<EventStateStore>,
        metrics: JudgeMetrics,
        config: PullConfig,
    ) -> Self {
        Self {
            index,
            ring,
            endpoint: endpoint.into(),
            source,
            store,
            metrics,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// PULL rules the ring assigns to this instance, by id
    fn owned_rules(&self) -> (HashMap<i64, Arc<AlertRule>>, usize) {
        let mut owned = HashMap::new();
        let mut unassigned = 0;
        for rule in self.index.pull_rules() {
            match self.ring.get_node(&rule.id.to_string()) {
                Ok(node) if node == self.endpoint => {
                    owned.insert(rule.id, rule);
                }
                Ok(_) => {}
                Err(e @ JudgeError::RingUnassigned(_)) => {
                    self.metrics.inc_ring_unassigned();
                    debug!(rule_id = rule.id, error = %e, "PULL rule skipped this cycle");
                    unassigned += 1;
                }
                Err(e) => warn!(rule_id = rule.id, error = %e, "Ring lookup failed"),
            }
        }
        (owned, unassigned)
    }

    /// Diff owned rules against running evaluators; restart changed ones
    pub fn sync_once(&self, parent: &CancellationToken) -> SyncReport {
        let (owned, unassigned) = self.owned_rules();
        let mut report = SyncReport {
            unassigned,
            ..Default::default()
        };

        let mut active = self.active.lock();
        let mut released = Vec::new();
        active.retain(|id, evaluator| {
            let keep = owned
                .get(id)
                .map_or(false, |rule| rule_key(rule) == evaluator.key);
            if !keep {
                evaluator.cancel.cancel();
                report.stopped += 1;
                if !owned.contains_key(id) {
                    released.push(*id);
                }
            }
            keep
        });
        for id in released {
            report.released_states += self.store.forget_pull_rule(id);
        }

        for (id, rule) in owned {
            if active.contains_key(&id) {
                continue;
            }
            let cancel = parent.child_token();
            let evaluator = PullEvaluator::new(
                Arc::clone(&rule),
                Arc::clone(&self.source),
                Arc::clone(&self.store),
                self.metrics.clone(),
            );
            let handle = tokio::spawn(evaluator.run(cancel.clone()));
            active.insert(
                id,
                ActiveEvaluator {
                    key: rule_key(&rule),
                    cancel,
                    handle,
                },
            );
            report.started += 1;
        }

        report.active = active.len();
        self.metrics.set_pull_evaluators(report.active);
        if report.started > 0 || report.stopped > 0 {
            info!(
                started = report.started,
                stopped = report.stopped,
                active = report.active,
                "PULL evaluators synced"
            );
        }
        report
    }

    /// Evaluators currently running on this instance
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn active_rule_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Sync loop: first pass after the start delay, then every sync interval
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            start_delay_secs = self.config.start_delay_secs,
            sync_interval_secs = self.config.sync_interval_secs,
            "Starting PULL rule manager"
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.config.start_delay_secs)) => {}
            _ = cancel.cancelled() => {
                self.stop_all().await;
                return;
            }
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_once(&cancel);
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.stop_all().await;
        info!("PULL rule manager stopped");
    }

    /// Cancel every evaluator and wait for it to return
    pub async fn stop_all(&self) {
        let evaluators: Vec<ActiveEvaluator> = self.active.lock().drain().map(|(_, e)| e).collect();
        for evaluator in evaluators {
            evaluator.cancel.cancel();
            if let Err(e) = evaluator.handle.await {
                warn!(error = %e, "PULL evaluator ended abnormally");
            }
        }
        self.metrics.set_pull_evaluators(0);
    }
}
