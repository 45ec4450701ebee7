//! Raw sample types fed into the engine by external sensor sources.
//!
//! Samples are consumed into the current epoch's feature window and are not
//! retained after the epoch is reduced.

use serde::{Deserialize, Serialize};

/// Standard gravity in m/s², the reference the motion deviation is measured against.
pub const GRAVITY_EARTH: f64 = 9.80665;

/// One accelerometer reading in the device frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    /// Monotonic timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Acceleration along x in m/s²
    pub x: f64,
    /// Acceleration along y in m/s²
    pub y: f64,
    /// Acceleration along z in m/s²
    pub z: f64,
}

impl AccelSample {
    pub fn new(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self {
            timestamp_ms,
            x,
            y,
            z,
        }
    }

    /// Magnitude of the acceleration vector.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Absolute deviation of the magnitude from gravity.
    pub fn deviation_from_gravity(&self) -> f64 {
        (self.magnitude() - GRAVITY_EARTH).abs()
    }

    /// Pitch angle in degrees: `atan2(y, sqrt(x² + z²))`.
    pub fn pitch_degrees(&self) -> f64 {
        self.y
            .atan2((self.x * self.x + self.z * self.z).sqrt())
            .to_degrees()
    }
}

/// A step-counter reading. The counter is cumulative since the sensor started.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSample {
    pub timestamp_ms: u64,
    /// Cumulative step count reported by the sensor
    pub cumulative: f64,
}

/// A short-range radio scan hit from a nearby peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProximityHit {
    pub timestamp_ms: u64,
    /// Opaque peer identifier (e.g. a radio address)
    pub peer_id: String,
}

/// Unified sample type for the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorEvent {
    Accelerometer(AccelSample),
    StepCounter(StepSample),
    ProximityHit(ProximityHit),
}

impl SensorEvent {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            SensorEvent::Accelerometer(s) => s.timestamp_ms,
            SensorEvent::StepCounter(s) => s.timestamp_ms,
            SensorEvent::ProximityHit(h) => h.timestamp_ms,
        }
    }
}

/// A best-effort location fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}
