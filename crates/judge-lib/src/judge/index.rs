//! Rule index: metric name to the PUSH rules that reference it

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::filter::CompiledFilter;
use super::func::{describe, JudgeFunc};
use crate::classpath::Classpath;
use crate::error::{JudgeError, Result};
use crate::models::{AlertRule, Combine, Exp, MetricPoint, PushExpr, RuleType};

/// A PUSH rule with its functions parsed and filters compiled
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: AlertRule,
    expr: PushExpr,
    funcs: Vec<JudgeFunc>,
    res_filters: Vec<CompiledFilter>,
    tag_filters: Vec<CompiledFilter>,
}

impl CompiledRule {
    /// Parse functions and compile filters of a PUSH rule
    pub fn compile(rule: AlertRule) -> Result<Self> {
        if rule.alert_duration < 0 {
            return Err(JudgeError::rule(rule.id, "negative alertDuration"));
        }
        let expr = rule
            .push_expr
            .clone()
            .ok_or_else(|| JudgeError::rule(rule.id, "PUSH rule without pushExpr"))?;
        if expr.exps.is_empty() {
            return Err(JudgeError::rule(rule.id, "pushExpr has no expressions"));
        }

        let mut funcs = Vec::with_capacity(expr.exps.len());
        for exp in &expr.exps {
            if exp.metric.is_empty() {
                return Err(JudgeError::rule(rule.id, "expression without metric"));
            }
            funcs.push(JudgeFunc::parse(exp).map_err(|e| JudgeError::rule(rule.id, e))?);
        }

        let res_filters = expr
            .res_filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| JudgeError::rule(rule.id, e))?;
        let tag_filters = expr
            .tag_filters
            .iter()
            .map(CompiledFilter::compile)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| JudgeError::rule(rule.id, e))?;
        if tag_filters.iter().any(|f| f.key().map_or(true, str::is_empty)) {
            return Err(JudgeError::rule(rule.id, "tag filter without key"));
        }

        Ok(Self {
            rule,
            expr,
            funcs,
            res_filters,
            tag_filters,
        })
    }

    pub fn id(&self) -> i64 {
        self.rule.id
    }

    pub fn combine(&self) -> Combine {
        self.expr.together_or_any
    }

    /// Expressions paired with their parsed functions
    pub fn expressions(&self) -> impl Iterator<Item = (&Exp, JudgeFunc)> {
        self.expr.exps.iter().zip(self.funcs.iter().copied())
    }

    /// Resource filters on the ident, tag filters on the tag map, all ANDed
    pub fn matches(&self, point: &MetricPoint, classpath: &dyn Classpath) -> bool {
        if !self
            .res_filters
            .iter()
            .all(|f| f.matches(&point.ident, classpath))
        {
            return false;
        }

        self.tag_filters.iter().all(|f| {
            f.key()
                .and_then(|key| point.tags_map.get(key))
                .map_or(false, |value| f.matches(value, classpath))
        })
    }

    /// Human-readable condition, as written into events
    pub fn readable_expression(&self) -> String {
        self.expr
            .exps
            .iter()
            .map(|exp| describe(exp, self.rule.alert_duration))
            .collect::<Vec<_>>()
            .join(self.combine().separator())
    }
}

/// Check a rule the way the index and the PULL manager will use it
pub fn validate_rule(rule: &AlertRule) -> Result<()> {
    match rule.rule_type {
        RuleType::Push => CompiledRule::compile(rule.clone()).map(|_| ()),
        RuleType::Pull => validate_pull(rule),
    }
}

fn validate_pull(rule: &AlertRule) -> Result<()> {
    if rule.alert_duration < 0 {
        return Err(JudgeError::rule(rule.id, "negative alertDuration"));
    }
    match &rule.pull_expr {
        Some(expr) if !expr.prom_ql.trim().is_empty() => Ok(()),
        _ => Err(JudgeError::rule(rule.id, "PULL rule without promQl")),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub push_rules: usize,
    pub pull_rules: usize,
    pub invalid_rules: usize,
    pub metrics: usize,
}

#[derive(Default)]
struct IndexSnapshot {
    by_metric: HashMap<String, Vec<Arc<CompiledRule>>>,
    pull: Vec<Arc<AlertRule>>,
    stats: IndexStats,
}

/// Current rule set: PUSH rules indexed by metric, PULL rules as a list.
///
/// A rebuild swaps the whole snapshot, so readers never see a mix of two
/// rule versions.
pub struct RuleIndex {
    classpath: Arc<dyn Classpath>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    last_sync: AtomicI64,
}

impl RuleIndex {
    pub fn new(classpath: Arc<dyn Classpath>) -> Self {
        Self {
            classpath,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            last_sync: AtomicI64::new(0),
        }
    }

    /// Replace the index with `rules`; invalid and duplicate rules are skipped.
    ///
    /// `lastSync` becomes `version`, or one past the previous value if that
    /// would not move it forward.
    pub fn rebuild(&self, rules: Vec<AlertRule>, version: i64) -> IndexStats {
        let mut snapshot = IndexSnapshot::default();
        let mut seen = HashSet::new();

        for rule in rules {
            if !seen.insert(rule.id) {
                warn!(rule_id = rule.id, "Duplicate rule id, skipped");
                snapshot.stats.invalid_rules += 1;
                continue;
            }
            let rule_id = rule.id;
            let compiled = match rule.rule_type {
                RuleType::Pull => validate_pull(&rule).map(|_| None),
                RuleType::Push => CompiledRule::compile(rule.clone()).map(|c| Some(Arc::new(c))),
            };

            match compiled {
                Err(e) => {
                    warn!(rule_id = rule_id, error = %e, "Invalid rule, skipped");
                    snapshot.stats.invalid_rules += 1;
                }
                Ok(None) => {
                    snapshot.stats.pull_rules += 1;
                    snapshot.pull.push(Arc::new(rule));
                }
                Ok(Some(compiled)) => {
                    snapshot.stats.push_rules += 1;
                    for metric in compiled.rule.push_metrics() {
                        snapshot
                            .by_metric
                            .entry(metric.to_string())
                            .or_default()
                            .push(Arc::clone(&compiled));
                    }
                }
            }
        }
        snapshot.stats.metrics = snapshot.by_metric.len();
        let stats = snapshot.stats;

        let mut guard = self.snapshot.write();
        let next = version.max(self.last_sync.load(Ordering::Acquire) + 1);
        self.last_sync.store(next, Ordering::Release);
        *guard = Arc::new(snapshot);
        drop(guard);

        info!(
            push_rules = stats.push_rules,
            pull_rules = stats.pull_rules,
            invalid_rules = stats.invalid_rules,
            last_sync = next,
            "Rule index rebuilt"
        );
        stats
    }

    fn current(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// PUSH rules whose expressions reference the point's metric and whose
    /// filters accept it
    pub fn match_rules(&self, point: &MetricPoint) -> Vec<Arc<CompiledRule>> {
        let snapshot = self.current();
        snapshot
            .by_metric
            .get(&point.metric)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.matches(point, self.classpath.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// PULL rules of the current snapshot
    pub fn pull_rules(&self) -> Vec<Arc<AlertRule>> {
        self.current().pull.clone()
    }

    /// Version stamp of the last rebuild
    pub fn last_sync(&self) -> i64 {
        self.last_sync.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> IndexStats {
        self.current().stats
    }
}
