//! Judge configuration

use anyhow::{bail, Context, Result};
use judge_lib::cluster::HeartbeatConfig;
use judge_lib::datasource::{DataSourceConfig, PrometheusConfig};
use judge_lib::judge::{PullConfig, PushJudgeConfig, DEFAULT_EVENT_CAPACITY};
use judge_lib::rules::RulesConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClasspathConfig {
    /// JSON file of `[{id, path, res[]}]`; empty lookup when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Judge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub classpath: ClasspathConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub judge: PushJudgeConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub datasource: DataSourceConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

impl JudgeConfig {
    /// Load from the optional file, then `JUDGE_*` environment overrides
    /// (`__` separates sections, e.g. `JUDGE_PROMETHEUS__BATCH=500`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("JUDGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("heartbeat.peers"),
            )
            .build()
            .context("failed to read configuration")?;

        let config: JudgeConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.local_addr.trim().is_empty() {
            bail!("heartbeat.local_addr must be set");
        }
        if self.heartbeat.interval == 0 {
            bail!("heartbeat.interval must be positive");
        }
        if self.events.capacity == 0 {
            bail!("events.capacity must be positive");
        }
        if self.judge.workers == 0 {
            bail!("judge.workers must be positive");
        }
        Ok(())
    }
}
