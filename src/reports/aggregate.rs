//! Crowd report aggregation.
//!
//! Reports inside the look-back horizon are filtered by proximity (same
//! network, or within the proximity radius), reduced to the latest vote per
//! device, and tallied.

use crate::collector::types::GeoPoint;
use crate::core::tally::VoteTally;
use crate::reports::geo::distance_m;
use crate::reports::store::{CrowdReport, ReportStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Whether a report shares this device's network or was filed close by.
pub fn matches_proximity(
    report: &CrowdReport,
    current_ssid: &str,
    current_location: Option<GeoPoint>,
    radius_m: f64,
) -> bool {
    let same_network = report.ssid.as_deref() == Some(current_ssid);
    let nearby = match (report.location(), current_location) {
        (Some(theirs), Some(ours)) => distance_m(theirs, ours) < radius_m,
        _ => false,
    };
    same_network || nearby
}

/// Tally the reports that qualify at `now_ms`.
///
/// Reports are sorted by timestamp before the per-device fold, so the latest
/// qualifying vote of each device wins regardless of input order.
pub fn tally_reports(
    reports: &[CrowdReport],
    now_ms: i64,
    current_ssid: &str,
    current_location: Option<GeoPoint>,
    lookback: Duration,
    radius_m: f64,
) -> VoteTally {
    let horizon = now_ms - lookback.as_millis() as i64;

    let mut qualifying: Vec<&CrowdReport> = reports
        .iter()
        .filter(|r| r.timestamp >= horizon)
        // a report without a level or device never overwrites an earlier vote
        .filter(|r| r.level.is_some() && r.device_id.is_some())
        .filter(|r| matches_proximity(r, current_ssid, current_location, radius_m))
        .collect();
    // stable: equal timestamps keep store order
    qualifying.sort_by_key(|r| r.timestamp);

    let mut latest_by_device: HashMap<&str, &CrowdReport> = HashMap::new();
    for report in qualifying {
        if let Some(device) = report.device_id.as_deref() {
            latest_by_device.insert(device, report);
        }
    }

    VoteTally::from_votes(latest_by_device.values().filter_map(|r| r.vote()))
}

/// Queries the report store and tallies the result.
pub struct ReportAggregator<S> {
    store: Arc<S>,
    lookback: Duration,
    radius_m: f64,
    timeout: Duration,
}

impl<S> Clone for ReportAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lookback: self.lookback,
            radius_m: self.radius_m,
            timeout: self.timeout,
        }
    }
}

impl<S: ReportStore> ReportAggregator<S> {
    pub fn new(store: Arc<S>, lookback: Duration, radius_m: f64, timeout: Duration) -> Self {
        Self {
            store,
            lookback,
            radius_m,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reports inside the horizon, bounded by the store timeout.
    pub async fn fetch_recent(&self, now_ms: i64) -> Result<Vec<CrowdReport>, StoreError> {
        let since = now_ms - self.lookback.as_millis() as i64;
        match tokio::time::timeout(self.timeout, self.store.query_since(since)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    /// Tally already-fetched reports with this aggregator's horizon and radius.
    pub fn tally(
        &self,
        reports: &[CrowdReport],
        now_ms: i64,
        current_ssid: &str,
        current_location: Option<GeoPoint>,
    ) -> VoteTally {
        tally_reports(
            reports,
            now_ms,
            current_ssid,
            current_location,
            self.lookback,
            self.radius_m,
        )
    }

    /// Fetch and tally. A failed or timed-out query yields the empty tally.
    pub async fn aggregate(
        &self,
        now_ms: i64,
        current_ssid: &str,
        current_location: Option<GeoPoint>,
    ) -> VoteTally {
        match self.fetch_recent(now_ms).await {
            Ok(reports) => self.tally(&reports, now_ms, current_ssid, current_location),
            Err(e) => {
                tracing::warn!(error = %e, "crowd aggregation failed, assuming no votes");
                VoteTally::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scoring::CongestionLevel;
    use crate::reports::store::MemoryReportStore;

    const NOW: i64 = 1_700_000_000_000;
    const HORIZON: Duration = Duration::from_secs(60);
    const RADIUS: f64 = 50.0;

    fn on_network(device: &str, level: &str, ts: i64, ssid: &str) -> CrowdReport {
        CrowdReport {
            device_id: Some(device.to_string()),
            level: Some(level.to_string()),
            ssid: Some(ssid.to_string()),
            latitude: None,
            longitude: None,
            timestamp: ts,
        }
    }

    fn at(device: &str, level: &str, ts: i64, lat: f64, lon: f64) -> CrowdReport {
        CrowdReport {
            device_id: Some(device.to_string()),
            level: Some(level.to_string()),
            ssid: None,
            latitude: Some(lat),
            longitude: Some(lon),
            timestamp: ts,
        }
    }

    fn tally(reports: &[CrowdReport], location: Option<GeoPoint>) -> VoteTally {
        tally_reports(reports, NOW, "Library", location, HORIZON, RADIUS)
    }

    #[test]
    fn test_same_network_majority() {
        let reports = vec![
            on_network("a", "Low", NOW - 30_000, "Library"),
            on_network("b", "Medium", NOW - 20_000, "Library"),
            on_network("c", "Medium", NOW - 10_000, "Library"),
        ];
        let t = tally(&reports, None);
        assert_eq!((t.low, t.medium, t.high), (1, 2, 0));
        assert_eq!(t.winning_level, CongestionLevel::Medium);
    }

    #[test]
    fn test_latest_vote_per_device_wins() {
        // out of order on purpose
        let reports = vec![
            on_network("a", "High", NOW - 5_000, "Library"),
            on_network("a", "Low", NOW - 50_000, "Library"),
        ];
        let t = tally(&reports, None);
        assert_eq!(t.total(), 1);
        assert_eq!(t.high, 1);
    }

    #[test]
    fn test_horizon_excludes_stale_reports() {
        let reports = vec![
            on_network("a", "High", NOW - 60_001, "Library"),
            on_network("b", "Medium", NOW - 60_000, "Library"),
        ];
        let t = tally(&reports, None);
        assert_eq!(t.high, 0);
        assert_eq!(t.medium, 1);
    }

    #[test]
    fn test_stale_report_does_not_shadow_fresh_one() {
        let reports = vec![
            on_network("a", "Medium", NOW - 30_000, "Library"),
            on_network("a", "High", NOW - 90_000, "Library"),
        ];
        assert_eq!(tally(&reports, None).winning_level, CongestionLevel::Medium);
    }

    #[test]
    fn test_proximity_by_distance() {
        let here = GeoPoint::new(43.6532, -79.3832);
        let reports = vec![
            at("near", "High", NOW - 1_000, 43.6535, -79.3832),
            at("far", "Low", NOW - 1_000, 43.6600, -79.3832),
        ];
        let t = tally(&reports, Some(here));
        assert_eq!((t.low, t.high), (0, 1));

        // without our own fix nothing matches by distance
        assert_eq!(tally(&reports, None).total(), 0);
    }

    #[test]
    fn test_other_network_without_location_is_ignored() {
        let reports = vec![on_network("a", "High", NOW, "Cafe")];
        assert_eq!(tally(&reports, None), VoteTally::default());
    }

    #[test]
    fn test_malformed_reports_are_skipped() {
        let mut anonymous = on_network("x", "High", NOW, "Library");
        anonymous.device_id = None;
        let reports = vec![
            anonymous,
            on_network("b", "Packed", NOW, "Library"),
            on_network("c", "Low", NOW, "Library"),
        ];
        let t = tally(&reports, None);
        assert_eq!(t.total(), 1);
        assert_eq!(t.low, 1);
    }

    #[test]
    fn test_levelless_report_keeps_earlier_vote() {
        let mut blank = on_network("a", "Low", NOW - 10_000, "Library");
        blank.level = None;
        let reports = vec![on_network("a", "High", NOW - 20_000, "Library"), blank];
        let t = tally(&reports, None);
        assert_eq!(t.total(), 1);
        assert_eq!(t.winning_level, CongestionLevel::High);
    }

    #[test]
    fn test_unknown_level_still_overwrites() {
        // a present but unrecognized level replaces the device's vote
        let reports = vec![
            on_network("a", "High", NOW - 20_000, "Library"),
            on_network("a", "Packed", NOW - 10_000, "Library"),
        ];
        assert_eq!(tally(&reports, None), VoteTally::default());
    }

    #[tokio::test]
    async fn test_aggregate_fails_open_when_offline() {
        let store = Arc::new(MemoryReportStore::with_reports(vec![on_network(
            "a",
            "High",
            NOW,
            "Library",
        )]));
        let aggregator =
            ReportAggregator::new(Arc::clone(&store), HORIZON, RADIUS, Duration::from_secs(1));
        assert_eq!(aggregator.aggregate(NOW, "Library", None).await.high, 1);

        store.set_available(false);
        assert_eq!(
            aggregator.aggregate(NOW, "Library", None).await,
            VoteTally::default()
        );
    }

    #[tokio::test]
    async fn test_fetch_recent_times_out() {
        let store = Arc::new(MemoryReportStore::new().with_latency(Duration::from_millis(200)));
        let aggregator = ReportAggregator::new(store, HORIZON, RADIUS, Duration::from_millis(20));
        assert!(matches!(
            aggregator.fetch_recent(NOW).await,
            Err(StoreError::Timeout(_))
        ));
    }
}
