//! REST client for a remote crowd report store.
//!
//! The store exposes two endpoints:
//!
//! - `POST {base}/reports` appends one report
//! - `GET {base}/reports?since=<ms>` lists reports at or after `since`
//!
//! Both take a bearer token.

use crate::reports::store::{CrowdReport, ReportStore, StoreError};
use std::time::Duration;

/// Connection settings for the remote store.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `https://reports.example.org/v1`
    pub base_url: String,
    /// Bearer authentication token
    pub token: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint for pushing a report.
    pub fn reports_url(&self) -> String {
        format!("{}/reports", self.base_url)
    }

    /// Endpoint for the range query.
    pub fn query_url(&self, since_ms: i64) -> String {
        format!("{}/reports?since={}", self.base_url, since_ms)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

/// Report store backed by the REST endpoints above.
#[cfg(feature = "gateway")]
pub struct HttpReportStore {
    config: GatewayConfig,
    client: reqwest::Client,
}

#[cfg(feature = "gateway")]
impl HttpReportStore {
    pub fn new(config: GatewayConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Check that the store answers its health endpoint.
    pub async fn test_connection(&self) -> Result<bool, StoreError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(StoreError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(feature = "gateway")]
impl ReportStore for HttpReportStore {
    async fn push(&self, report: CrowdReport) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.config.reports_url())
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(&report)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn query_since(&self, since_ms: i64) -> Result<Vec<CrowdReport>, StoreError> {
        let response = self
            .client
            .get(self.config.query_url(since_ms))
            .header("Authorization", format!("Bearer {}", self.config.token))
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let mut reports: Vec<CrowdReport> = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // the store's ordering is not trusted
        reports.retain(|r| r.timestamp >= since_ms);
        reports.sort_by_key(|r| r.timestamp);
        Ok(reports)
    }
}
