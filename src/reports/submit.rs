//! Manual report submission with a per-device cooldown.

use crate::collector::context::{fetch_location, LocationProvider};
use crate::core::scoring::CongestionLevel;
use crate::reports::store::{CrowdReport, ReportStore, StoreError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Report submission errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// A report was accepted less than one cooldown ago
    RateLimited { retry_after_ms: u64 },
    /// Only Low, Medium and High can be reported
    InvalidLevel(CongestionLevel),
    /// The report was accepted but the store push failed
    Store(StoreError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::RateLimited { retry_after_ms } => write!(
                f,
                "Please wait before reporting again ({}s)",
                retry_after_ms.div_ceil(1000)
            ),
            SubmitError::InvalidLevel(level) => write!(f, "{level} cannot be reported"),
            SubmitError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        SubmitError::Store(e)
    }
}

/// Pushes this device's votes to the report store.
pub struct ReportSubmitter<S, L> {
    store: Arc<S>,
    location: Arc<L>,
    device_id: String,
    cooldown: Duration,
    location_timeout: Duration,
    store_timeout: Duration,
    last_accepted_ms: Mutex<Option<i64>>,
}

impl<S: ReportStore, L: LocationProvider> ReportSubmitter<S, L> {
    pub fn new(
        store: Arc<S>,
        location: Arc<L>,
        device_id: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            store,
            location,
            device_id: device_id.into(),
            cooldown,
            location_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(3),
            last_accepted_ms: Mutex::new(None),
        }
    }

    pub fn with_timeouts(mut self, location_timeout: Duration, store_timeout: Duration) -> Self {
        self.location_timeout = location_timeout;
        self.store_timeout = store_timeout;
        self
    }

    /// Resume the cooldown from a previously accepted submission.
    pub fn with_last_accepted(self, last_accepted_ms: Option<i64>) -> Self {
        *self.last_accepted_ms.lock().unwrap_or_else(PoisonError::into_inner) = last_accepted_ms;
        self
    }

    pub fn last_accepted(&self) -> Option<i64> {
        *self.last_accepted_ms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Check the cooldown and claim the slot if free.
    fn accept(&self, now_ms: i64) -> Result<(), SubmitError> {
        let cooldown_ms = self.cooldown.as_millis() as i64;
        let mut last = self.last_accepted_ms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            let elapsed = now_ms - prev;
            if elapsed < cooldown_ms {
                return Err(SubmitError::RateLimited {
                    retry_after_ms: (cooldown_ms - elapsed) as u64,
                });
            }
        }
        *last = Some(now_ms);
        Ok(())
    }

    /// Submit a vote.
    ///
    /// The cooldown slot is claimed before the push, so a failed push still
    /// counts as the accepted submission.
    pub async fn submit(
        &self,
        level: CongestionLevel,
        now_ms: i64,
        ssid: &str,
    ) -> Result<CrowdReport, SubmitError> {
        if !level.is_vote() {
            return Err(SubmitError::InvalidLevel(level));
        }
        if let Err(e) = self.accept(now_ms) {
            tracing::info!(%level, error = %e, "report rejected");
            return Err(e);
        }

        let location = fetch_location(self.location.as_ref(), self.location_timeout).await;
        let report = CrowdReport::new(
            self.device_id.clone(),
            level,
            Some(ssid.to_string()),
            location,
            now_ms,
        );

        match tokio::time::timeout(self.store_timeout, self.store.push(report.clone())).await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout(self.store_timeout).into()),
        }
        tracing::info!(%level, ssid, "reported congestion");
        Ok(report)
    }
}
