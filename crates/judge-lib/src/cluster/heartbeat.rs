//! Instance heartbeat and ring membership refresh

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ring::RingHandle;
use crate::error::{JudgeError, Result};
use crate::health::{components, HealthRegistry};

/// Missed intervals after which an endpoint no longer counts as live
pub const LIVENESS_INTERVALS: i64 = 3;

/// `heartbeat.*` settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_service")]
    pub service: String,
    /// Endpoint this instance is known by in the ring
    #[serde(default = "default_local_addr", alias = "localAddr", alias = "localaddr")]
    pub local_addr: String,
    /// Milliseconds between heartbeats
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Other members of the shared registry
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_service() -> String {
    "alert-judge".to_string()
}

fn default_local_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_interval() -> u64 {
    1000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            local_addr: default_local_addr(),
            interval: default_interval(),
            peers: Vec::new(),
        }
    }
}

/// Shared registry of `(service, endpoint, timestamp)` records
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn heartbeat(&self, service: &str, endpoint: &str, timestamp_ms: i64) -> Result<()>;

    /// Endpoints of `service` seen at or after `since_ms`, sorted
    async fn active_endpoints(&self, service: &str, since_ms: i64) -> Result<Vec<String>>;
}

/// Registry backed by a static peer list plus the endpoints that reported
pub struct StaticRegistry {
    peers: Vec<String>,
    seen: DashMap<(String, String), i64>,
}

impl StaticRegistry {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            seen: DashMap::new(),
        }
    }
}

#[async_trait]
impl InstanceRegistry for StaticRegistry {
    async fn heartbeat(&self, service: &str, endpoint: &str, timestamp_ms: i64) -> Result<()> {
        if endpoint.is_empty() {
            return Err(JudgeError::Config("heartbeat endpoint is empty".to_string()));
        }
        self.seen
            .insert((service.to_string(), endpoint.to_string()), timestamp_ms);
        Ok(())
    }

    async fn active_endpoints(&self, service: &str, since_ms: i64) -> Result<Vec<String>> {
        let mut endpoints: Vec<String> = self
            .seen
            .iter()
            .filter(|e| e.key().0 == service && *e.value() >= since_ms)
            .map(|e| e.key().1.clone())
            .chain(self.peers.iter().cloned())
            .collect();
        endpoints.sort();
        endpoints.dedup();
        Ok(endpoints)
    }
}

pub struct Heartbeat {
    config: HeartbeatConfig,
    registry: Arc<dyn InstanceRegistry>,
    ring: RingHandle,
    health: HealthRegistry,
}

impl Heartbeat {
    pub fn new(
        config: HeartbeatConfig,
        registry: Arc<dyn InstanceRegistry>,
        ring: RingHandle,
        health: HealthRegistry,
    ) -> Self {
        Self {
            config,
            registry,
            ring,
            health,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.local_addr
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval.max(1))
    }

    /// First heartbeat; the caller treats failure as fatal
    pub async fn register(&self) -> Result<()> {
        self.beat_once(chrono::Utc::now().timestamp_millis()).await.map_err(|e| {
            error!(endpoint = %self.config.local_addr, error = %e, "Heartbeat registration failed");
            e
        })?;
        info!(
            service = %self.config.service,
            endpoint = %self.config.local_addr,
            members = ?self.ring.members(),
            "Instance registered"
        );
        Ok(())
    }

    /// Report liveness and rebuild the ring from the live endpoints.
    ///
    /// Returns the number of ring members.
    pub async fn beat_once(&self, now_ms: i64) -> Result<usize> {
        self.registry
            .heartbeat(&self.config.service, &self.config.local_addr, now_ms)
            .await?;

        let since = now_ms - LIVENESS_INTERVALS * self.config.interval as i64;
        let endpoints = self
            .registry
            .active_endpoints(&self.config.service, since)
            .await?;
        if self.ring.update(&endpoints) {
            info!(members = ?endpoints, "Hash ring membership changed");
        }
        Ok(endpoints.len())
    }

    /// Heartbeat until cancelled. Failures degrade health and are retried
    /// on the next tick; membership is left as it was.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.tick().await;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.beat_once(chrono::Utc::now().timestamp_millis()).await {
                        Ok(_) => {
                            if failures > 0 {
                                info!(after_failures = failures, "Heartbeat recovered");
                                self.health.set_healthy(components::HEARTBEAT).await;
                            }
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, retry = failures, "Heartbeat failed");
                            self.health
                                .set_degraded(components::HEARTBEAT, e.to_string())
                                .await;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Heartbeat stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;

    struct FailingRegistry;

    #[async_trait]
    impl InstanceRegistry for FailingRegistry {
        async fn heartbeat(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Err(JudgeError::Config("registry unavailable".into()))
        }
        async fn active_endpoints(&self, _: &str, _: i64) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn config(local: &str, peers: &[&str]) -> HeartbeatConfig {
        HeartbeatConfig {
            local_addr: local.to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_puts_local_endpoint_in_ring() {
        let ring = RingHandle::new(10);
        let cfg = config("10.0.0.1:8080", &["10.0.0.2:8080"]);
        let registry = Arc::new(StaticRegistry::new(cfg.peers.clone()));
        let heartbeat = Heartbeat::new(cfg, registry, ring.clone(), HealthRegistry::new());

        heartbeat.register().await.unwrap();
        assert_eq!(ring.members(), vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }

    #[tokio::test]
    async fn test_register_failure_is_returned() {
        let heartbeat = Heartbeat::new(
            config("10.0.0.1:8080", &[]),
            Arc::new(FailingRegistry),
            RingHandle::new(10),
            HealthRegistry::new(),
        );
        assert!(heartbeat.register().await.is_err());
    }

    #[tokio::test]
    async fn test_stale_reporters_leave_the_ring() {
        let registry = Arc::new(StaticRegistry::new(vec![]));
        registry.heartbeat("alert-judge", "10.0.0.9:8080", 1_000).await.unwrap();

        let ring = RingHandle::new(10);
        let heartbeat = Heartbeat::new(
            config("10.0.0.1:8080", &[]),
            registry.clone(),
            ring.clone(),
            HealthRegistry::new(),
        );

        assert_eq!(heartbeat.beat_once(2_000).await.unwrap(), 2);
        assert_eq!(heartbeat.beat_once(10_000).await.unwrap(), 1);
        assert_eq!(ring.members(), vec!["10.0.0.1:8080"]);
    }

    #[tokio::test]
    async fn test_run_degrades_health_on_failure() {
        let health = HealthRegistry::new();
        health.register_all().await;
        let heartbeat = Arc::new(Heartbeat::new(
            HeartbeatConfig {
                interval: 10,
                ..config("10.0.0.1:8080", &[])
            },
            Arc::new(FailingRegistry),
            RingHandle::new(10),
            health.clone(),
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            health.status_of(components::HEARTBEAT).await,
            Some(ComponentStatus::Degraded)
        );
    }
}
