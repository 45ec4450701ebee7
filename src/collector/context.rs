//! Ambient context providers: location fix and network identity.

use crate::collector::types::GeoPoint;
use std::future::Future;
use std::time::Duration;

/// Network identity reported when no local network is known.
pub const UNKNOWN_NETWORK: &str = "Unknown";

/// Source of a best-effort, single-shot location fix.
pub trait LocationProvider: Send + Sync + 'static {
    /// Resolve the current location, or `None` if unavailable or denied.
    fn current_location(&self) -> impl Future<Output = Option<GeoPoint>> + Send;
}

/// Source of the current local-network identifier.
pub trait NetworkIdentity: Send + Sync + 'static {
    fn current_ssid(&self) -> String;
}

/// A location provider that always answers with the same fix.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<GeoPoint>);

impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Option<GeoPoint> {
        self.0
    }
}

/// A network identity that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticNetwork {
    ssid: Option<String>,
}

impl StaticNetwork {
    pub fn new(raw_ssid: Option<&str>) -> Self {
        Self {
            ssid: raw_ssid.and_then(normalize_ssid),
        }
    }
}

impl NetworkIdentity for StaticNetwork {
    fn current_ssid(&self) -> String {
        self.ssid
            .clone()
            .unwrap_or_else(|| UNKNOWN_NETWORK.to_string())
    }
}

/// Strip the surrounding quotes platforms put around SSIDs.
///
/// Returns `None` for an empty identifier.
pub fn normalize_ssid(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

/// Fetch a location fix, giving up after `limit`.
///
/// A timed-out fix is treated like an unavailable one.
pub async fn fetch_location<L: LocationProvider>(provider: &L, limit: Duration) -> Option<GeoPoint> {
    match tokio::time::timeout(limit, provider.current_location()).await {
        Ok(fix) => {
            if fix.is_none() {
                tracing::debug!("location unavailable, matching on network identity only");
            }
            fix
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "location fix timed out"
            );
            None
        }
    }
}
