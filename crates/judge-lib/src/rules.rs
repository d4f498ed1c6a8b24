//! Rule loading from the authoritative store into the rule index

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{JudgeError, Result};
use crate::health::{components, HealthRegistry};
use crate::judge::{IndexStats, RuleIndex};
use crate::models::AlertRule;

/// `rules.*` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rules_path")]
    pub path: PathBuf,
    #[serde(
        default = "default_reload_interval",
        alias = "reloadIntervalSecs",
        alias = "reloadintervalsecs"
    )]
    pub reload_interval_secs: u64,
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("rules.json")
}

fn default_reload_interval() -> u64 {
    10
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: default_rules_path(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self) -> Result<Vec<AlertRule>>;
}

/// JSON array of rules on disk
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a rules file without touching any index
pub fn parse_rules(raw: &str) -> Result<Vec<AlertRule>> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn load(&self) -> Result<Vec<AlertRule>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            JudgeError::Config(format!("cannot read rules {}: {}", self.path.display(), e))
        })?;
        parse_rules(&raw)
    }
}

/// Periodically reloads the store into the index
pub struct RuleLoader {
    store: Arc<dyn RuleStore>,
    index: Arc<RuleIndex>,
    health: HealthRegistry,
    interval: Duration,
}

impl RuleLoader {
    pub fn new(
        store: Arc<dyn RuleStore>,
        index: Arc<RuleIndex>,
        health: HealthRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            index,
            health,
            interval,
        }
    }

    /// Load once and rebuild the index; a failed load keeps the old index
    pub async fn sync_once(&self) -> Result<IndexStats> {
        let rules = self.store.load().await?;
        Ok(self.index.rebuild(rules, chrono::Utc::now().timestamp()))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting rule loader");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(_) => {
                            if failures > 0 {
                                self.health.set_healthy(components::RULE_LOADER).await;
                            }
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, retry = failures, "Rule reload failed, keeping previous rules");
                            self.health
                                .set_degraded(components::RULE_LOADER, e.to_string())
                                .await;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Rule loader stopped");
                    break;
                }
            }
        }
    }
}
