//! Feature snapshot computed once per epoch.
//!
//! Features are unit-less reductions of motion magnitude, pitch and proximity.
//! They carry no raw samples.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Step rate substituted when the step counter is silent but motion looks like slow walking.
pub const FALLBACK_STEP_RATE: f64 = 0.3;

/// Acceleration variance band that allows the fallback step rate.
const FALLBACK_VARIANCE_RANGE: (f64, f64) = (0.005, 0.02);

/// Average speed the fallback step rate requires.
const FALLBACK_MIN_SPEED: f64 = 0.05;

/// Mean pitch band for the `is_sitting` heuristic, in degrees.
const SITTING_PITCH_RANGE: (f64, f64) = (70.0, 100.0);

/// Acceleration variance ceiling for the `is_sitting` heuristic.
const SITTING_MAX_VARIANCE: f64 = 0.01;

/// Reduced motion signal for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Steps per second, from the step counter or the fallback estimate
    pub step_rate: f64,
    /// Mean absolute deviation of acceleration magnitude from gravity (m/s²)
    pub avg_speed: f64,
    /// One-second sub-intervals that looked stationary
    pub stop_count: u32,
    /// Population variance of the per-sample deviation series
    pub accel_variance: f64,
    /// Last-seen pitch angle in degrees (0 when none seen)
    pub pitch_degrees: f64,
    /// Variance of the trailing pitch window
    pub pitch_variance: f64,
    /// Mean of the trailing pitch window
    pub mean_pitch_degrees: f64,
    /// Distinct peers seen by the proximity scan this epoch
    pub nearby_device_count: u32,
    /// Accelerometer samples reduced into this snapshot
    pub sample_count: usize,
    /// Raw step-counter delta this epoch
    pub step_count: u32,
    /// Epoch length the rates were computed over
    pub epoch_secs: f64,
}

impl FeatureSnapshot {
    /// True when the epoch saw no accelerometer samples at all.
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Pocket-pitch sitting heuristic.
    ///
    /// This is independent of [`PostureState::Sitting`](crate::core::PostureState)
    /// and uses a different pitch band; the two are reported side by side.
    pub fn is_sitting(&self) -> bool {
        !self.is_empty()
            && self.accel_variance < SITTING_MAX_VARIANCE
            && (SITTING_PITCH_RANGE.0..=SITTING_PITCH_RANGE.1).contains(&self.mean_pitch_degrees)
    }
}

/// Arithmetic mean, 0 for an empty series.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.mean()
}

/// Population variance, 0 for an empty series.
pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.population_variance().max(0.0)
}

/// Step rate for an epoch.
///
/// Uses the step-counter delta when it is positive, otherwise the fallback
/// estimate derived from motion statistics.
pub fn step_rate(
    step_count: u32,
    epoch_secs: f64,
    sample_count: usize,
    accel_variance: f64,
    avg_speed: f64,
) -> f64 {
    if step_count > 0 && epoch_secs > 0.0 {
        return step_count as f64 / epoch_secs;
    }
    fallback_step_rate(sample_count, accel_variance, avg_speed)
}

fn fallback_step_rate(sample_count: usize, accel_variance: f64, avg_speed: f64) -> f64 {
    let (low, high) = FALLBACK_VARIANCE_RANGE;
    if sample_count > 0
        && (low..=high).contains(&accel_variance)
        && avg_speed > FALLBACK_MIN_SPEED
    {
        FALLBACK_STEP_RATE
    } else {
        0.0
    }
}
