//! Component wiring and background task lifecycle

use anyhow::{Context, Result};
use judge_lib::{
    classpath::{Classpath, MemoryClasspath},
    cluster::{Heartbeat, RingHandle, StaticRegistry},
    datasource::{DataSource, DataSourceRegistry},
    health::{components, HealthRegistry},
    judge::{EventStateStore, JudgeCore, PointCache, PullRuleManager, PushJudge, RuleIndex},
    observability::{JudgeMetrics, StructuredLogger},
    rules::{FileRuleStore, RuleLoader},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::config::JudgeConfig;

/// Build the judging pipeline around one datasource.
///
/// Starts the PUSH worker pool; the background loops are spawned by [`App`].
pub fn assemble(
    config: &JudgeConfig,
    source: Arc<dyn DataSource>,
    classpath: Arc<dyn Classpath>,
    health: HealthRegistry,
    metrics: JudgeMetrics,
    cancel: &CancellationToken,
) -> AppState {
    let logger = StructuredLogger::new(&config.heartbeat.local_addr);
    let index = Arc::new(RuleIndex::new(classpath));
    let cache = Arc::new(PointCache::new());
    let store = Arc::new(EventStateStore::new(
        config.events.capacity,
        metrics.clone(),
        logger,
    ));
    let core = JudgeCore::new(
        Arc::clone(&index),
        cache,
        Arc::clone(&store),
        Arc::clone(&source),
        metrics.clone(),
    );
    let push_judge = PushJudge::start(core.clone(), &config.judge, cancel.child_token());

    let ring = RingHandle::default();
    let pull_manager = Arc::new(PullRuleManager::new(
        index,
        ring.clone(),
        config.heartbeat.local_addr.clone(),
        Arc::clone(&source),
        store,
        metrics.clone(),
        config.pull.clone(),
    ));

    AppState {
        health,
        metrics,
        source,
        core,
        push_judge,
        pull_manager,
        ring,
    }
}

/// A running judge instance
pub struct App {
    pub state: Arc<AppState>,
    registry: Arc<DataSourceRegistry>,
    logger: StructuredLogger,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Construct every component and start the background loops.
    ///
    /// Fails when no datasource is usable or the first heartbeat cannot be
    /// written; rule load failures only degrade health.
    pub async fn start(config: JudgeConfig) -> Result<Self> {
        let metrics = JudgeMetrics::new();
        let health = HealthRegistry::new();
        health.register_all().await;
        let logger = StructuredLogger::new(&config.heartbeat.local_addr);
        let cancel = CancellationToken::new();

        let classpath: Arc<dyn Classpath> = match &config.classpath.path {
            Some(path) => Arc::new(
                MemoryClasspath::from_file(path)
                    .with_context(|| format!("failed to load classpaths from {}", path.display()))?,
            ),
            None => Arc::new(MemoryClasspath::default()),
        };

        let registry = Arc::new(
            DataSourceRegistry::init(
                &config.datasource,
                &config.prometheus,
                Some(Arc::clone(&classpath)),
                metrics.clone(),
            )
            .context("failed to initialize datasources")?,
        );
        let source = registry.default_source()?;
        logger.log_startup(env!("CARGO_PKG_VERSION"), source.name());

        let state = Arc::new(assemble(
            &config,
            Arc::clone(&source),
            classpath,
            health.clone(),
            metrics.clone(),
            &cancel,
        ));

        let loader = Arc::new(RuleLoader::new(
            Arc::new(FileRuleStore::new(&config.rules.path)),
            Arc::clone(state.core.index()),
            health.clone(),
            Duration::from_secs(config.rules.reload_interval_secs.max(1)),
        ));
        match loader.sync_once().await {
            Ok(stats) => info!(
                push_rules = stats.push_rules,
                pull_rules = stats.pull_rules,
                invalid_rules = stats.invalid_rules,
                "Initial rules loaded"
            ),
            Err(e) => {
                warn!(error = %e, path = %config.rules.path.display(), "Initial rule load failed");
                health
                    .set_degraded(components::RULE_LOADER, e.to_string())
                    .await;
            }
        }

        let heartbeat = Arc::new(Heartbeat::new(
            config.heartbeat.clone(),
            Arc::new(StaticRegistry::new(config.heartbeat.peers.clone())),
            state.ring.clone(),
            health.clone(),
        ));
        if let Err(e) = heartbeat.register().await {
            state.push_judge.shutdown().await;
            registry.clean_up().await;
            return Err(e).context("instance registration failed");
        }

        let tasks = vec![
            tokio::spawn(Arc::clone(&heartbeat).run(cancel.child_token())),
            tokio::spawn(loader.run(cancel.child_token())),
            tokio::spawn(Arc::clone(&state.pull_manager).run(cancel.child_token())),
            tokio::spawn(Arc::clone(state.core.cache()).run_sweeper(
                Duration::from_secs(config.judge.stale_sweep_secs.max(1)),
                config.judge.stale_grace_secs,
                metrics.clone(),
                cancel.child_token(),
            )),
        ];

        health.set_ready(true).await;
        info!(
            endpoint = %config.heartbeat.local_addr,
            datasource = %source.name(),
            workers = state.push_judge.worker_count(),
            "Judge started"
        );

        Ok(Self {
            state,
            registry,
            logger,
            cancel,
            tasks,
        })
    }

    /// Token cancelled by [`App::shutdown`]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loops, then flush the datasources
    pub async fn shutdown(self, reason: &str) {
        self.state.health.set_ready(false).await;
        self.logger.log_shutdown(reason);
        self.cancel.cancel();

        self.state.push_judge.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.registry.clean_up().await;
        info!("Judge stopped");
    }
}
