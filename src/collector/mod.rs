//! Sample collection for the CrowdSense engine.
//!
//! Platform sensor, radio and location APIs sit outside this crate. This
//! module defines the sample types they produce, a replay source for recorded
//! traces, and the context seams (location, network identity) the engine
//! queries each epoch.

pub mod context;
pub mod replay;
pub mod types;

// Re-export commonly used types
pub use context::{
    fetch_location, normalize_ssid, FixedLocation, LocationProvider, NetworkIdentity,
    StaticNetwork, UNKNOWN_NETWORK,
};
pub use replay::{CollectorConfig, CollectorError, ReplayCollector};
pub use types::{AccelSample, GeoPoint, ProximityHit, SensorEvent, StepSample, GRAVITY_EARTH};

/// Collector type used by the binary.
pub type Collector = ReplayCollector;
