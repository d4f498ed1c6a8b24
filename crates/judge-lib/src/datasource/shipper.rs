//! Remote-write shipper
//!
//! Drains the write queue in batches, encodes each batch once, and hands it
//! to every configured target in parallel. Each target retries recoverable
//! failures on its own, so one failing target never stalls the others.

use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::prometheus::RemoteConfig;
use super::prompb::{encode_write_request, TimeSeries};
use super::queue::WriteQueue;
use crate::error::{JudgeError, Result};
use crate::observability::JudgeMetrics;

pub const DEFAULT_BATCH: usize = 1000;
pub const DEFAULT_MAX_RETRY: u32 = 3;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 5;
const REMOTE_WRITE_VERSION: &str = "0.1.0";
const AGENT: &str = concat!("alert-judge/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Maximum series per shipped batch
    pub batch: usize,
    /// Attempts per target per batch
    pub max_retry: u32,
    /// Pause between attempts against one target
    pub retry_pause: Duration,
    /// Sleep when the queue is empty
    pub idle_sleep: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            max_retry: DEFAULT_MAX_RETRY,
            retry_pause: Duration::from_millis(100),
            idle_sleep: Duration::from_millis(100),
        }
    }
}

/// Final result of shipping one batch to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Target answered 400, nothing to retry
    Rejected,
    Dropped { attempts: u32, error: String },
}

/// One remote-write endpoint with its own HTTP client and timeout
pub struct RemoteWriteTarget {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl RemoteWriteTarget {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let timeout = if config.remote_timeout_second > 0 {
            config.remote_timeout_second
        } else {
            DEFAULT_REMOTE_TIMEOUT_SECS
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| JudgeError::Config(format!("remote write client {}: {}", config.name, e)))?;

        let name = if config.name.is_empty() {
            config.url.clone()
        } else {
            config.name.clone()
        };

        Ok(Self {
            name,
            url: config.url.clone(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// POST one encoded payload and classify the outcome
    pub async fn send(&self, body: Vec<u8>) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| JudgeError::FatalTransport {
            target: self.name.clone(),
            message: format!("malformed url {:?}: {}", self.url, e),
        })?;

        let response = self
            .client
            .post(url)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(USER_AGENT, AGENT)
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut message = response.text().await.unwrap_or_default();
        message.truncate(512);
        let message = format!("{}: {}", status, message.trim());

        if status == reqwest::StatusCode::BAD_REQUEST {
            Err(JudgeError::BadRequest {
                target: self.name.clone(),
                message,
            })
        } else if status.is_server_error() {
            Err(JudgeError::RecoverableTransport {
                target: self.name.clone(),
                message,
            })
        } else {
            Err(JudgeError::FatalTransport {
                target: self.name.clone(),
                message,
            })
        }
    }

    fn classify_transport(&self, e: reqwest::Error) -> JudgeError {
        if e.is_builder() {
            JudgeError::FatalTransport {
                target: self.name.clone(),
                message: e.to_string(),
            }
        } else {
            JudgeError::RecoverableTransport {
                target: self.name.clone(),
                message: e.to_string(),
            }
        }
    }
}

/// Ship one payload to one target, retrying recoverable failures
pub async fn deliver(
    target: &RemoteWriteTarget,
    body: Vec<u8>,
    series: usize,
    config: &ShipperConfig,
    metrics: &JudgeMetrics,
) -> DeliveryOutcome {
    let max_attempts = config.max_retry.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let start = Instant::now();
        let result = target.send(body.clone()).await;
        metrics.observe_remote_write_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics.inc_remote_write(target.name(), "success");
                debug!(remote = %target.name(), series = series, attempts = attempts, "Batch shipped");
                return DeliveryOutcome::Delivered { attempts };
            }
            Err(e @ JudgeError::BadRequest { .. }) => {
                metrics.inc_remote_write(target.name(), "rejected");
                debug!(remote = %target.name(), series = series, error = %e, "Remote write rejected with 400");
                return DeliveryOutcome::Rejected;
            }
            Err(e) if e.is_recoverable() && attempts < max_attempts => {
                metrics.inc_remote_write_retry(target.name());
                warn!(
                    remote = %target.name(),
                    error = %e,
                    retry = attempts,
                    "Remote write failed, retrying"
                );
                tokio::time::sleep(config.retry_pause).await;
            }
            Err(e) => {
                metrics.inc_remote_write(target.name(), "dropped");
                warn!(
                    remote = %target.name(),
                    series = series,
                    attempts = attempts,
                    error = %e,
                    "Remote write failed, batch dropped"
                );
                return DeliveryOutcome::Dropped {
                    attempts,
                    error: e.to_string(),
                };
            }
        }
    }
}

/// Long-lived task draining the write queue
pub struct Shipper {
    queue: Arc<WriteQueue>,
    targets: Vec<Arc<RemoteWriteTarget>>,
    config: ShipperConfig,
    metrics: JudgeMetrics,
}

impl Shipper {
    pub fn new(
        queue: Arc<WriteQueue>,
        targets: Vec<RemoteWriteTarget>,
        config: ShipperConfig,
        metrics: JudgeMetrics,
    ) -> Self {
        Self {
            queue,
            targets: targets.into_iter().map(Arc::new).collect(),
            config,
            metrics,
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            targets = self.targets.len(),
            batch = self.config.batch,
            max_retry = self.config.max_retry,
            "Starting remote-write shipper"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let batch = self.queue.pop_batch(self.config.batch);
            self.metrics.set_write_queue_length(self.queue.len());

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_sleep) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            // deliveries run detached; the next batch does not wait for slow targets
            drop(self.dispatch(batch));
        }

        info!(pending = self.queue.len(), "Remote-write shipper stopped");
    }

    /// Encode a batch once and start one delivery per target
    pub fn dispatch(&self, batch: Vec<TimeSeries>) -> Vec<JoinHandle<DeliveryOutcome>> {
        if self.targets.is_empty() || batch.is_empty() {
            return Vec::new();
        }

        let series = batch.len();
        let body = match encode_write_request(batch) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, series = series, "Failed to encode remote-write batch");
                return Vec::new();
            }
        };

        self.targets
            .iter()
            .map(|target| {
                let target = Arc::clone(target);
                let body = body.clone();
                let config = self.config.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move { deliver(&target, body, series, &config, &metrics).await })
            })
            .collect()
    }

    /// Ship whatever is left in the queue and wait for the deliveries
    pub async fn flush(&self) -> usize {
        let mut shipped = 0;
        loop {
            let batch = self.queue.pop_batch(self.config.batch);
            if batch.is_empty() {
                break;
            }
            shipped += batch.len();
            for handle in self.dispatch(batch) {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Remote-write delivery task failed");
                }
            }
        }
        self.metrics.set_write_queue_length(self.queue.len());
        shipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::convert::convert_point;
    use crate::models::MetricPoint;

    fn remote(name: &str, url: String) -> RemoteConfig {
        RemoteConfig {
            name: name.to_string(),
            url,
            remote_timeout_second: 2,
        }
    }

    fn fast_config(max_retry: u32) -> ShipperConfig {
        ShipperConfig {
            batch: 10,
            max_retry,
            retry_pause: Duration::from_millis(5),
            idle_sleep: Duration::from_millis(5),
        }
    }

    fn batch() -> Vec<TimeSeries> {
        vec![convert_point(&MetricPoint::new("cpu_util", 100, 90.0).with_ident("a")).unwrap()]
    }

    fn shipper_for(urls: Vec<(&str, String)>, max_retry: u32) -> (Shipper, Arc<WriteQueue>) {
        let queue = Arc::new(WriteQueue::new(100));
        let targets = urls
            .into_iter()
            .map(|(name, url)| RemoteWriteTarget::new(&remote(name, url)).unwrap())
            .collect();
        let shipper = Shipper::new(
            Arc::clone(&queue),
            targets,
            fast_config(max_retry),
            JudgeMetrics::new(),
        );
        (shipper, queue)
    }

    async fn outcomes(handles: Vec<JoinHandle<DeliveryOutcome>>) -> Vec<DeliveryOutcome> {
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_success_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/write")
            .match_header("content-encoding", "snappy")
            .match_header("content-type", "application/x-protobuf")
            .match_header("x-prometheus-remote-write-version", "0.1.0")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let (shipper, _) = shipper_for(vec![("w1", format!("{}/api/v1/write", server.url()))], 3);
        let results = outcomes(shipper.dispatch(batch())).await;

        assert_eq!(results, vec![DeliveryOutcome::Delivered { attempts: 1 }]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_retries_up_to_max() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let (shipper, _) = shipper_for(vec![("w1", format!("{}/write", server.url()))], 3);
        let results = outcomes(shipper.dispatch(batch())).await;

        assert!(matches!(results[0], DeliveryOutcome::Dropped { attempts: 3, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_aborts_immediately() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let (shipper, _) = shipper_for(vec![("w1", format!("{}/write", server.url()))], 5);
        let results = outcomes(shipper.dispatch(batch())).await;

        assert!(matches!(results[0], DeliveryOutcome::Dropped { attempts: 1, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried_and_next_batch_proceeds() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(400)
            .with_body("out of order sample")
            .expect(2)
            .create_async()
            .await;

        let (shipper, _) = shipper_for(vec![("w1", format!("{}/write", server.url()))], 3);
        let first = outcomes(shipper.dispatch(batch())).await;
        let second = outcomes(shipper.dispatch(batch())).await;

        assert_eq!(first, vec![DeliveryOutcome::Rejected]);
        assert_eq!(second, vec![DeliveryOutcome::Rejected]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_url_is_fatal() {
        let (shipper, _) = shipper_for(vec![("broken", "not a url".to_string())], 3);
        let results = outcomes(shipper.dispatch(batch())).await;

        assert!(matches!(results[0], DeliveryOutcome::Dropped { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_network_error_is_recoverable() {
        let (shipper, _) = shipper_for(vec![("down", "http://127.0.0.1:1/write".to_string())], 2);
        let results = outcomes(shipper.dispatch(batch())).await;

        assert!(matches!(results[0], DeliveryOutcome::Dropped { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_failing_target_does_not_block_healthy_one() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("POST", "/ok")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let failing = server
            .mock("POST", "/fail")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let (shipper, _) = shipper_for(
            vec![
                ("ok", format!("{}/ok", server.url())),
                ("fail", format!("{}/fail", server.url())),
            ],
            2,
        );
        let results = outcomes(shipper.dispatch(batch())).await;

        assert_eq!(results[0], DeliveryOutcome::Delivered { attempts: 1 });
        assert!(matches!(results[1], DeliveryOutcome::Dropped { attempts: 2, .. }));
        healthy.assert_async().await;
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_cancel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(204)
            .expect_at_least(1)
            .create_async()
            .await;

        let (shipper, queue) = shipper_for(vec![("w1", format!("{}/write", server.url()))], 1);
        for series in batch() {
            queue.push(series);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(shipper).run(cancel.clone()));

        for _ in 0..100 {
            if queue.is_empty() && mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(queue.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_flush_ships_remaining_series() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/write")
            .with_status(204)
            .expect(2)
            .create_async()
            .await;

        let (shipper, queue) = shipper_for(vec![("w1", format!("{}/write", server.url()))], 1);
        for i in 0..15 {
            let point = MetricPoint::new("m", i, i as f64);
            queue.push(convert_point(&point).unwrap());
        }

        assert_eq!(shipper.flush().await, 15);
        assert!(queue.is_empty());
        mock.assert_async().await;
    }
}
