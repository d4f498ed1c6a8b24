//! HTTP client for the alert judge API

use anyhow::{Context, Result};
use judge_lib::health::{HealthResponse, ReadinessResponse};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// GET a JSON body, failing on any non-success status
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.get_with_status(path).await?;
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, body);
        }
        serde_json::from_str(&body).context("Failed to parse response")
    }

    /// GET a body along with its status; health endpoints answer 503 with JSON
    async fn get_with_status(&self, path: &str) -> Result<(StatusCode, String)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response")?;
        Ok((status, body))
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let (_, body) = self.get_with_status("healthz").await?;
        serde_json::from_str(&body).context("Failed to parse health response")
    }

    pub async fn readiness(&self) -> Result<ReadinessResponse> {
        let (_, body) = self.get_with_status("readyz").await?;
        serde_json::from_str(&body).context("Failed to parse readiness response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub datasource: String,
    pub write_queue: usize,
    pub cached_series: usize,
    pub event_queue: usize,
    pub event_states: usize,
    pub push_rules: usize,
    pub pull_rules: usize,
    pub invalid_rules: usize,
    pub indexed_metrics: usize,
    pub rules_version: i64,
    pub pull_evaluators: usize,
    pub ring_members: Vec<String>,
    pub push_workers: usize,
}
