//! Named registry of configured datasources

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::prometheus::{PrometheusConfig, PrometheusDataSource};
use super::DataSource;
use crate::classpath::Classpath;
use crate::error::{JudgeError, Result};
use crate::observability::JudgeMetrics;

/// `datasource.*` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Name of the backend used by the judges
    #[serde(default = "default_datasource")]
    pub default: String,
}

fn default_datasource() -> String {
    "prometheus".to_string()
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            default: default_datasource(),
        }
    }
}

#[derive(Default)]
pub struct DataSourceRegistry {
    sources: DashMap<String, Arc<dyn DataSource>>,
    default: RwLock<Option<String>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct and register every enabled backend, then pick the default
    pub fn init(
        config: &DataSourceConfig,
        prometheus: &PrometheusConfig,
        classpath: Option<Arc<dyn Classpath>>,
        metrics: JudgeMetrics,
    ) -> Result<Self> {
        let registry = Self::new();

        if prometheus.enable {
            let source = PrometheusDataSource::new(prometheus.clone(), classpath, metrics)?;
            source.start();
            info!(
                name = %prometheus.name,
                remote_write = prometheus.remote_write.len(),
                remote_read = prometheus.remote_read.len(),
                "Registered prometheus datasource"
            );
            registry.register(Arc::new(source));
        }

        registry.set_default(&config.default)?;
        Ok(registry)
    }

    /// Add or replace a backend under its own name
    pub fn register(&self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        if !self.sources.contains_key(name) {
            return Err(JudgeError::DataSourceNotFound(name.to_string()));
        }
        *self.default.write() = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.sources
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| JudgeError::DataSourceNotFound(name.to_string()))
    }

    pub fn default_source(&self) -> Result<Arc<dyn DataSource>> {
        let name = self
            .default
            .read()
            .clone()
            .ok_or_else(|| JudgeError::DataSourceNotFound("<default>".to_string()))?;
        self.get(&name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Clean up every backend (process shutdown)
    pub async fn clean_up(&self) {
        let sources: Vec<Arc<dyn DataSource>> =
            self.sources.iter().map(|e| Arc::clone(e.value())).collect();
        for source in sources {
            source.clean_up().await;
        }
    }
}
