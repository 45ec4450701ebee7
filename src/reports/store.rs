//! Peer crowd reports and the store contract they live behind.

use crate::collector::types::GeoPoint;
use crate::core::scoring::CongestionLevel;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// One peer vote as stored remotely.
///
/// Fields are optional where peers are known to omit them; a report without a
/// device id or with an unrecognized level is skipped during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrowdReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Submission time (ms since epoch)
    pub timestamp: i64,
}

impl CrowdReport {
    pub fn new(
        device_id: impl Into<String>,
        level: CongestionLevel,
        ssid: Option<String>,
        location: Option<GeoPoint>,
        timestamp: i64,
    ) -> Self {
        Self {
            device_id: Some(device_id.into()),
            level: Some(level.as_str().to_string()),
            ssid,
            latitude: location.map(|p| p.latitude),
            longitude: location.map(|p| p.longitude),
            timestamp,
        }
    }

    /// Reported position, when both coordinates are present.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }

    /// The vote carried by this report, if it is one of Low/Medium/High.
    pub fn vote(&self) -> Option<CongestionLevel> {
        self.level.as_deref().and_then(CongestionLevel::from_vote)
    }
}

/// Report store errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Store is not reachable
    Unavailable(String),
    /// Network/HTTP error
    Network(String),
    /// Store returned an error response
    Server { status: u16, message: String },
    /// JSON (de)serialization error
    Serialization(String),
    /// Call did not finish within its deadline
    Timeout(Duration),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Report store unavailable: {msg}"),
            StoreError::Network(msg) => write!(f, "Report store network error: {msg}"),
            StoreError::Server { status, message } => {
                write!(f, "Report store server error ({status}): {message}")
            }
            StoreError::Serialization(msg) => {
                write!(f, "Report store serialization error: {msg}")
            }
            StoreError::Timeout(limit) => {
                write!(f, "Report store timed out after {}ms", limit.as_millis())
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Push/query contract of the remote report store.
pub trait ReportStore: Send + Sync + 'static {
    /// Append one report.
    fn push(&self, report: CrowdReport) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All reports with `timestamp >= since_ms`, ascending by timestamp.
    fn query_since(
        &self,
        since_ms: i64,
    ) -> impl Future<Output = Result<Vec<CrowdReport>, StoreError>> + Send;
}

/// In-process report store.
///
/// Used when no remote store is configured, and by tests. It can be switched
/// offline or given artificial latency to exercise the fail-open paths.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: RwLock<Vec<CrowdReport>>,
    offline: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with `reports`.
    pub fn with_reports(reports: Vec<CrowdReport>) -> Self {
        Self {
            reports: RwLock::new(reports),
            ..Self::default()
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Take the store on- or offline.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reports.read().await.is_empty()
    }

    async fn check(&self) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

impl ReportStore for MemoryReportStore {
    async fn push(&self, report: CrowdReport) -> Result<(), StoreError> {
        self.check().await?;
        self.reports.write().await.push(report);
        Ok(())
    }

    async fn query_since(&self, since_ms: i64) -> Result<Vec<CrowdReport>, StoreError> {
        self.check().await?;
        let mut matching: Vec<CrowdReport> = self
            .reports
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= since_ms)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching)
    }
}
