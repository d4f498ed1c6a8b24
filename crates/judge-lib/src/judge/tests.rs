//! End-to-end judge tests against an in-memory datasource
//!
//! These drive the PUSH core, the PULL evaluators and the manager through
//! the state store without any network backend.

#[cfg(test)]
mod judge_flow_tests {
    use crate::classpath::MemoryClasspath;
    use crate::cluster::RingHandle;
    use crate::datasource::{
        DataQueryParam, DataQueryResp, DataSource, LabelQuery, PushStats,
    };
    use crate::error::{JudgeError, Result};
    use crate::judge::{
        EventStateStore, JudgeCore, Outcome, PointCache, PullConfig, PullEvaluator,
        PullRuleManager, PushJudge, PushJudgeConfig, RuleIndex,
    };
    use crate::models::{
        md5_hex, AlertRule, Combine, EventKind, Exp, HistoryPoint, MetricPoint, Operator,
        PullExpr, PushExpr, RuleType, VectorSample,
    };
    use crate::observability::{JudgeMetrics, StructuredLogger};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeSource {
        /// metric -> points returned by range queries
        data: Mutex<HashMap<String, Vec<HistoryPoint>>>,
        fail_queries: Mutex<bool>,
        /// `None` makes vector queries fail
        vector: Mutex<Option<Vec<VectorSample>>>,
        queries: Mutex<Vec<DataQueryParam>>,
    }

    impl FakeSource {
        fn set_data(&self, metric: &str, values: &[(i64, f64)]) {
            self.data.lock().insert(
                metric.to_string(),
                values.iter().map(|(t, v)| HistoryPoint::new(*t, *v)).collect(),
            );
        }

        fn set_vector(&self, vector: Option<Vec<VectorSample>>) {
            *self.vector.lock() = vector;
        }

        fn queried_metrics(&self) -> Vec<String> {
            self.queries
                .lock()
                .iter()
                .flat_map(|q| q.params.iter().map(|p| p.metric.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl DataSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }
        fn push_to_queue(&self, points: &[MetricPoint]) -> PushStats {
            PushStats {
                accepted: points.len(),
                ..Default::default()
            }
        }
        fn queue_len(&self) -> usize {
            0
        }
        async fn query_data(&self, param: &DataQueryParam) -> Result<Vec<DataQueryResp>> {
            self.queries.lock().push(param.clone());
            if *self.fail_queries.lock() {
                return Err(JudgeError::Query("backend down".into()));
            }
            let data = self.data.lock();
            Ok(param
                .params
                .iter()
                .filter_map(|p| data.get(&p.metric).map(|values| (p, values)))
                .map(|(p, values)| DataQueryResp {
                    metric: p.metric.clone(),
                    values: values.clone(),
                    p_num: values.len(),
                    ..Default::default()
                })
                .collect())
        }
        async fn query_data_instant(&self, promql: &str, _: Option<i64>) -> Result<Vec<VectorSample>> {
            self.query_vector(promql).await
        }
        async fn query_tag_keys(&self, _: &LabelQuery) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn query_tag_values(&self, _: &LabelQuery) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn query_tag_pairs(&self, _: &LabelQuery) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn query_metrics(&self, _: &LabelQuery) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn query_vector(&self, _: &str) -> Result<Vec<VectorSample>> {
            self.vector
                .lock()
                .clone()
                .ok_or_else(|| JudgeError::Query("backend down".into()))
        }
        async fn clean_up(&self) {}
    }

    fn exp(metric: &str, func: &str, params: Vec<i64>, optr: Operator, threshold: f64) -> Exp {
        Exp {
            metric: metric.into(),
            func: func.into(),
            params,
            optr,
            threshold,
        }
    }

    fn push_rule(id: i64, duration: i64, exps: Vec<Exp>, combine: Combine) -> AlertRule {
        AlertRule {
            id,
            name: format!("push-{id}"),
            rule_type: RuleType::Push,
            priority: 2,
            alert_duration: duration,
            push_expr: Some(PushExpr {
                exps,
                together_or_any: combine,
                ..Default::default()
            }),
            pull_expr: None,
            notify_routing: Default::default(),
            runbook_url: String::new(),
            note: String::new(),
        }
    }

    fn pull_rule(id: i64, promql: &str, duration: i64) -> AlertRule {
        AlertRule {
            name: format!("pull-{id}"),
            rule_type: RuleType::Pull,
            push_expr: None,
            pull_expr: Some(PullExpr {
                prom_ql: promql.into(),
                evaluation_interval_seconds: 0,
            }),
            ..push_rule(id, duration, vec![], Combine::All)
        }
    }

    struct Fixture {
        index: Arc<RuleIndex>,
        store: Arc<EventStateStore>,
        source: Arc<FakeSource>,
        core: JudgeCore,
    }

    fn fixture(rules: Vec<AlertRule>) -> Fixture {
        let index = Arc::new(RuleIndex::new(Arc::new(MemoryClasspath::default())));
        index.rebuild(rules, 1);
        let store = Arc::new(EventStateStore::new(
            1000,
            JudgeMetrics::new(),
            StructuredLogger::new("test"),
        ));
        let source = Arc::new(FakeSource::default());
        let core = JudgeCore::new(
            Arc::clone(&index),
            Arc::new(PointCache::new()),
            Arc::clone(&store),
            source.clone(),
            JudgeMetrics::new(),
        );
        Fixture {
            index,
            store,
            source,
            core,
        }
    }

    fn cpu(time: i64, value: f64) -> MetricPoint {
        MetricPoint::new("cpu_util", time, value).with_tag("host", "a")
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_push_alert_then_recovery() {
        let f = fixture(vec![push_rule(
            7,
            0,
            vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
            Combine::All,
        )]);

        assert_eq!(f.core.handle_point_at(cpu(100, 90.0), 100).await, 1);
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].is_recovery, 0);
        assert_eq!(events[0].hash_id, md5_hex("7_cpu_util,host=a"));
        assert_eq!(events[0].values, "cpu_util: 90");
        assert_eq!(events[0].readable_expression, "cpu_util(all,0s) > 80");
        assert_eq!(events[0].trigger_time, 100);
        assert_eq!(events[0].tag_map.get("host").map(String::as_str), Some("a"));

        f.core.handle_point_at(cpu(101, 50.0), 101).await;
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].is_recovery, 1);
        assert_eq!(events[0].hash_id, md5_hex("7_cpu_util,host=a"));
    }

    #[tokio::test]
    async fn test_unmatched_and_out_of_order_points_are_not_judged() {
        let f = fixture(vec![push_rule(
            1,
            60,
            vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
            Combine::All,
        )]);

        assert_eq!(
            f.core
                .handle_point_at(MetricPoint::new("mem_util", 100, 99.0), 100)
                .await,
            0
        );
        assert_eq!(f.core.handle_point_at(cpu(100, 90.0), 100).await, 1);
        assert_eq!(f.core.handle_point_at(cpu(99, 95.0), 100).await, 0);
        assert_eq!(
            f.core
                .handle_point_at(MetricPoint::new("bad metric", 100, 1.0), 100)
                .await,
            0
        );

        let mut point = cpu(0, 0.0);
        assert_eq!(f.core.cache().window_len(point.ensure_fingerprint()), 1);
    }

    #[tokio::test]
    async fn test_window_uses_alert_duration() {
        let f = fixture(vec![push_rule(
            1,
            60,
            vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
            Combine::All,
        )]);

        f.core.handle_point_at(cpu(100, 50.0), 100).await;
        f.core.handle_point_at(cpu(130, 90.0), 130).await;
        assert!(f.store.drain(10).is_empty(), "50 is still inside the window");

        f.core.handle_point_at(cpu(170, 95.0), 170).await;
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].history_points[0].points.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_metric_all_with_missing_backend_data() {
        let f = fixture(vec![push_rule(
            3,
            60,
            vec![
                exp("cpu_util", "all", vec![], Operator::Gt, 90.0),
                exp("mem_util", "all", vec![], Operator::Gt, 90.0),
            ],
            Combine::All,
        )]);

        f.core.handle_point_at(cpu(1000, 95.0), 1000).await;

        assert!(f.store.drain(10).is_empty());
        assert_eq!(f.store.state_len(), 0);
        assert_eq!(f.source.queried_metrics(), vec!["mem_util"]);

        let query = f.source.queries.lock()[0].clone();
        assert_eq!(query.start, 1000 - 60 - 2);
        assert_eq!(query.end, 1000);
        assert_eq!(query.params[0].tag_pairs[0].key, "host");
    }

    #[tokio::test]
    async fn test_multi_metric_any_and_all() {
        let f = fixture(vec![
            push_rule(
                4,
                60,
                vec![
                    exp("cpu_util", "all", vec![], Operator::Gt, 90.0),
                    exp("mem_util", "all", vec![], Operator::Gt, 90.0),
                ],
                Combine::Any,
            ),
            push_rule(
                5,
                60,
                vec![
                    exp("cpu_util", "all", vec![], Operator::Gt, 90.0),
                    exp("mem_util", "all", vec![], Operator::Gt, 90.0),
                ],
                Combine::All,
            ),
        ]);
        f.source.set_data("mem_util", &[(990, 50.0), (1000, f64::NAN)]);

        f.core.handle_point_at(cpu(1000, 95.0), 1000).await;

        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, 4);
        assert_eq!(events[0].values, "cpu_util: 95; mem_util: 50");
        assert_eq!(
            events[0].readable_expression,
            "cpu_util(all,60s) > 90 || mem_util(all,60s) > 90"
        );
        assert_eq!(events[0].history_points[1].points, vec![HistoryPoint::new(990, 50.0)]);
    }

    #[tokio::test]
    async fn test_backend_failure_abandons_multi_metric_rule_only() {
        let f = fixture(vec![
            push_rule(
                1,
                0,
                vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
                Combine::All,
            ),
            push_rule(
                2,
                0,
                vec![
                    exp("cpu_util", "all", vec![], Operator::Gt, 80.0),
                    exp("mem_util", "all", vec![], Operator::Gt, 0.0),
                ],
                Combine::Any,
            ),
        ]);
        *f.source.fail_queries.lock() = true;

        f.core.handle_point_at(cpu(100, 90.0), 100).await;

        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, 1);
    }

    #[tokio::test]
    async fn test_c_avg_compares_against_earlier_window() {
        let f = fixture(vec![push_rule(
            6,
            0,
            vec![exp("cpu_util", "c_avg", vec![3600], Operator::Ge, 10.0)],
            Combine::All,
        )]);
        f.source.set_data("cpu_util", &[(100, 100.0), (110, 100.0)]);

        f.core.handle_point_at(cpu(4000, 120.0), 4000).await;
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].values, "cpu_util: 20");

        let query = f.source.queries.lock()[0].clone();
        assert_eq!(query.end, 4000 - 3600);
    }

    #[tokio::test]
    async fn test_evaluate_reports_outcome() {
        let f = fixture(vec![push_rule(
            8,
            0,
            vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
            Combine::All,
        )]);
        let mut point = cpu(100, 90.0);
        let rules = f.index.match_rules(&point);
        point.ensure_fingerprint();
        f.core.cache().put(&point.fingerprint, 100, 90.0, 0);

        assert_eq!(
            f.core.evaluate(&rules[0], &point, 100).await,
            Some(Outcome::Emitted(EventKind::Alert))
        );
        assert_eq!(f.core.evaluate(&rules[0], &point, 100).await, Some(Outcome::Ignored));
    }

    #[tokio::test]
    async fn test_push_judge_pool() {
        let f = fixture(vec![push_rule(
            9,
            0,
            vec![exp("cpu_util", "all", vec![], Operator::Gt, 80.0)],
            Combine::All,
        )]);
        let cancel = CancellationToken::new();
        let judge = PushJudge::start(
            f.core.clone(),
            &PushJudgeConfig {
                workers: 4,
                worker_queue: 16,
                ..Default::default()
            },
            cancel.clone(),
        );
        assert_eq!(judge.worker_count(), 4);

        for host in ["a", "b", "c"] {
            let point = MetricPoint::new("cpu_util", 100, 95.0).with_tag("host", host);
            assert!(judge.submit(point));
        }

        let mut emitted = 0;
        for _ in 0..100 {
            emitted = f.store.queue_len();
            if emitted == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(emitted, 3);

        judge.shutdown().await;
    }

    #[test]
    fn test_route_is_stable_per_fingerprint() {
        tokio_test::block_on(async {
            let f = fixture(vec![]);
            let judge = PushJudge::start(
                f.core.clone(),
                &PushJudgeConfig {
                    workers: 8,
                    ..Default::default()
                },
                CancellationToken::new(),
            );
            let mut point = cpu(1, 1.0);
            let fp = point.ensure_fingerprint().to_string();
            assert_eq!(judge.route(&fp), judge.route(&fp));
            assert!(judge.route(&fp) < 8);
            assert_eq!(judge.route("zz"), 0);
            judge.shutdown().await;
        });
    }

    #[tokio::test]
    async fn test_full_worker_queue_drops_point() {
        let f = fixture(vec![]);
        let metrics = JudgeMetrics::new();
        let judge = PushJudge::start(
            f.core.clone(),
            &PushJudgeConfig {
                workers: 1,
                worker_queue: 1,
                ..Default::default()
            },
            CancellationToken::new(),
        );
        let dropped_before = metrics.push_dropped_total();

        // The worker has not been polled yet, so its single slot stays taken
        assert!(judge.submit(cpu(1, 1.0)));
        assert!(!judge.submit(cpu(2, 1.0)));
        assert!(metrics.push_dropped_total() > dropped_before);

        judge.shutdown().await;
        assert!(!judge.submit(cpu(3, 1.0)));
    }

    fn evaluator(f: &Fixture, rule: AlertRule) -> PullEvaluator {
        PullEvaluator::new(
            Arc::new(rule),
            f.source.clone(),
            Arc::clone(&f.store),
            JudgeMetrics::new(),
        )
    }

    fn down_vector(time: i64) -> Vec<VectorSample> {
        vec![VectorSample {
            labels: labels(&[("instance", "x")]),
            timestamp: time,
            value: 0.0,
        }]
    }

    #[tokio::test]
    async fn test_pull_sustain_then_recovery() {
        let f = fixture(vec![]);
        let evaluator = evaluator(&f, pull_rule(11, "up == 0", 120));

        for t in [1000, 1060] {
            f.source.set_vector(Some(down_vector(t)));
            evaluator.evaluate_once(t).await.unwrap();
            assert_eq!(f.store.queue_len(), 0, "no event at {t}");
            assert_eq!(f.store.state_len(), 1);
        }

        f.source.set_vector(Some(down_vector(1125)));
        evaluator.evaluate_once(1125).await.unwrap();
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_time, 1125);
        assert!(events[0].last_send);
        assert_eq!(events[0].is_prome_pull, 1);
        assert_eq!(events[0].hash_id, md5_hex("11_instance=x"));
        assert_eq!(events[0].readable_expression, "up == 0");

        f.source.set_vector(Some(vec![]));
        let keep = evaluator.evaluate_once(1200).await.unwrap();
        assert!(keep.is_empty());
        let events = f.store.drain(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].is_recovery, 1);
        assert_eq!(f.store.state_len(), 0);
    }

    #[tokio::test]
    async fn test_pull_query_failure_does_not_recover() {
        let f = fixture(vec![]);
        let evaluator = evaluator(&f, pull_rule(12, "up == 0", 0));

        f.source.set_vector(Some(down_vector(100)));
        evaluator.evaluate_once(100).await.unwrap();
        assert_eq!(f.store.drain(10).len(), 1);

        f.source.set_vector(None);
        assert!(evaluator.evaluate_once(200).await.is_err());
        assert!(f.store.drain(10).is_empty());
        assert_eq!(f.store.state_len(), 1);
    }

    fn manager(f: &Fixture, ring: RingHandle, endpoint: &str) -> PullRuleManager {
        PullRuleManager::new(
            Arc::clone(&f.index),
            ring,
            endpoint,
            f.source.clone(),
            Arc::clone(&f.store),
            JudgeMetrics::new(),
            PullConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_manager_starts_only_owned_rules() {
        let f = fixture((1..=20).map(|id| pull_rule(id, "up == 0", 0)).collect());
        f.source.set_vector(Some(vec![]));
        let ring = RingHandle::new(50);
        ring.update(&["a:1".to_string(), "b:1".to_string()]);

        let parent = CancellationToken::new();
        let a = manager(&f, ring.clone(), "a:1");
        let b = manager(&f, ring.clone(), "b:1");
        let report_a = a.sync_once(&parent);
        let report_b = b.sync_once(&parent);

        assert_eq!(report_a.started + report_b.started, 20);
        for id in a.active_rule_ids() {
            assert_eq!(ring.get_node(&id.to_string()).unwrap(), "a:1");
        }
        for id in b.active_rule_ids() {
            assert_eq!(ring.get_node(&id.to_string()).unwrap(), "b:1");
        }

        a.stop_all().await;
        b.stop_all().await;
    }

    #[tokio::test]
    async fn test_manager_sync_is_stable_and_restarts_changed_rules() {
        let f = fixture(vec![pull_rule(1, "up == 0", 0), pull_rule(2, "up == 0", 60)]);
        f.source.set_vector(Some(vec![]));
        let ring = RingHandle::new(10);
        ring.update(&["self:1".to_string()]);
        let parent = CancellationToken::new();
        let m = manager(&f, ring, "self:1");

        assert_eq!(m.sync_once(&parent).started, 2);
        let again = m.sync_once(&parent);
        assert_eq!((again.started, again.stopped, again.active), (0, 0, 2));

        f.index
            .rebuild(vec![pull_rule(1, "up == 0", 0), pull_rule(2, "up < 1", 60)], 2);
        let changed = m.sync_once(&parent);
        assert_eq!((changed.started, changed.stopped, changed.active), (1, 1, 2));

        f.index.rebuild(vec![pull_rule(1, "up == 0", 0)], 3);
        let removed = m.sync_once(&parent);
        assert_eq!((removed.stopped, removed.active), (1, 1));

        parent.cancel();
        m.stop_all().await;
        assert_eq!(m.active_count(), 0);
    }

    #[tokio::test]
    async fn test_manager_releases_state_of_dropped_rules() {
        let f = fixture(vec![pull_rule(1, "up == 0", 0), pull_rule(2, "up == 0", 300)]);
        let ring = RingHandle::new(10);
        ring.update(&["self:1".to_string()]);
        let parent = CancellationToken::new();
        let m = manager(&f, ring, "self:1");
        assert_eq!(m.sync_once(&parent).started, 2);

        let sent = evaluator(&f, pull_rule(1, "up == 0", 0));
        let pending = evaluator(&f, pull_rule(2, "up == 0", 300));
        f.source.set_vector(Some(down_vector(100)));
        sent.evaluate_once(100).await.unwrap();
        pending.evaluate_once(100).await.unwrap();
        f.source.set_vector(None);
        assert_eq!(f.store.state_len(), 2);

        // A changed query restarts the evaluator but keeps its state
        f.index
            .rebuild(vec![pull_rule(1, "up < 1", 0), pull_rule(2, "up == 0", 300)], 2);
        let changed = m.sync_once(&parent);
        assert_eq!((changed.stopped, changed.released_states), (1, 0));
        assert_eq!(f.store.state_len(), 2);

        f.index.rebuild(vec![pull_rule(1, "up < 1", 0)], 3);
        let removed = m.sync_once(&parent);
        assert_eq!((removed.stopped, removed.released_states), (1, 1));
        assert_eq!(f.store.state_len(), 1);
        assert!(f.store.get(&md5_hex("2_instance=x")).is_none());

        parent.cancel();
        m.stop_all().await;
    }

    #[tokio::test]
    async fn test_manager_with_empty_ring_skips_rules() {
        let f = fixture(vec![pull_rule(1, "up == 0", 0)]);
        let m = manager(&f, RingHandle::new(10), "self:1");

        let report = m.sync_once(&CancellationToken::new());
        assert_eq!(report.unassigned, 1);
        assert_eq!(report.active, 0);
    }
}
