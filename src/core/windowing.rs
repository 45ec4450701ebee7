//! Epoch accumulation of raw samples.
//!
//! Samples are accumulated into one fixed-duration epoch and reduced to a
//! [`FeatureSnapshot`]. Reading the window and clearing it for the next epoch
//! happen under one lock (see [`SharedFeatureWindow::freeze`]) so no sample is
//! counted twice or lost across an epoch boundary.

use crate::collector::types::{AccelSample, SensorEvent};
use crate::core::features::{mean, population_variance, step_rate, FeatureSnapshot};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Number of trailing pitch samples kept across epochs.
pub const PITCH_WINDOW_CAPACITY: usize = 20;

/// Deviation below which a sub-interval counts as a stop (m/s²).
pub const STATIONARY_THRESHOLD: f64 = 0.15;

/// Length of the sub-interval gating stop detection.
const STOP_CHECK_INTERVAL_MS: u64 = 1000;

/// Fixed-capacity ring buffer of the most recent pitch angles.
#[derive(Debug, Clone)]
pub struct PitchWindow {
    values: [f64; PITCH_WINDOW_CAPACITY],
    next: usize,
    len: usize,
}

impl Default for PitchWindow {
    fn default() -> Self {
        Self {
            values: [0.0; PITCH_WINDOW_CAPACITY],
            next: 0,
            len: 0,
        }
    }
}

impl PitchWindow {
    /// Push a pitch angle, evicting the oldest once full.
    pub fn push(&mut self, pitch: f64) {
        self.values[self.next] = pitch;
        self.next = (self.next + 1) % PITCH_WINDOW_CAPACITY;
        self.len = (self.len + 1).min(PITCH_WINDOW_CAPACITY);
    }

    /// Most recently pushed angle.
    pub fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.next + PITCH_WINDOW_CAPACITY - 1) % PITCH_WINDOW_CAPACITY;
        Some(self.values[idx])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled part of the buffer. Order is not chronological.
    fn filled(&self) -> &[f64] {
        &self.values[..self.len]
    }

    pub fn mean(&self) -> f64 {
        mean(self.filled())
    }

    pub fn variance(&self) -> f64 {
        population_variance(self.filled())
    }
}

/// Accumulator for one epoch of samples.
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    epoch_duration: Duration,
    /// Per-sample deviation from gravity, cleared every epoch
    deviations: Vec<f64>,
    stop_count: u32,
    /// Timestamp of the last sample that was checked for a stop; kept across epochs
    last_stop_check_ms: Option<u64>,
    /// Cumulative step count at the start of the epoch
    step_baseline: Option<f64>,
    /// Latest cumulative step count seen
    step_latest: Option<f64>,
    nearby: HashSet<String>,
    pitch: PitchWindow,
}

impl FeatureWindow {
    pub fn new(epoch_duration: Duration) -> Self {
        Self {
            epoch_duration,
            deviations: Vec::with_capacity(256),
            stop_count: 0,
            last_stop_check_ms: None,
            step_baseline: None,
            step_latest: None,
            nearby: HashSet::new(),
            pitch: PitchWindow::default(),
        }
    }

    /// Add a sample to the current epoch.
    pub fn ingest(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Accelerometer(sample) => self.ingest_accel(&sample),
            SensorEvent::StepCounter(sample) => self.ingest_steps(sample.cumulative),
            SensorEvent::ProximityHit(hit) => {
                self.nearby.insert(hit.peer_id);
            }
        }
    }

    fn ingest_accel(&mut self, sample: &AccelSample) {
        let deviation = sample.deviation_from_gravity();
        self.deviations.push(deviation);

        let due = match self.last_stop_check_ms {
            Some(last) => sample.timestamp_ms.saturating_sub(last) > STOP_CHECK_INTERVAL_MS,
            None => true,
        };
        if due {
            if deviation < STATIONARY_THRESHOLD {
                self.stop_count += 1;
            }
            self.last_stop_check_ms = Some(sample.timestamp_ms);
        }

        self.pitch.push(sample.pitch_degrees());
    }

    fn ingest_steps(&mut self, cumulative: f64) {
        match self.step_baseline {
            // A counter that went backwards was restarted; count from here.
            Some(baseline) if cumulative >= baseline => {}
            _ => self.step_baseline = Some(cumulative),
        }
        self.step_latest = Some(cumulative);
    }

    /// Step-counter delta accumulated this epoch.
    pub fn step_count(&self) -> u32 {
        match (self.step_baseline, self.step_latest) {
            (Some(baseline), Some(latest)) => (latest - baseline).max(0.0) as u32,
            _ => 0,
        }
    }

    /// Distinct peers seen this epoch.
    pub fn nearby_count(&self) -> u32 {
        self.nearby.len() as u32
    }

    /// Reduce the accumulated samples to a snapshot without clearing them.
    pub fn reduce(&self) -> FeatureSnapshot {
        let sample_count = self.deviations.len();
        let avg_speed = mean(&self.deviations);
        let accel_variance = population_variance(&self.deviations);
        let step_count = self.step_count();
        let epoch_secs = self.epoch_duration.as_secs_f64();

        FeatureSnapshot {
            step_rate: step_rate(
                step_count,
                epoch_secs,
                sample_count,
                accel_variance,
                avg_speed,
            ),
            avg_speed,
            stop_count: self.stop_count,
            accel_variance,
            pitch_degrees: self.pitch.last().unwrap_or(0.0),
            pitch_variance: self.pitch.variance(),
            mean_pitch_degrees: self.pitch.mean(),
            nearby_device_count: self.nearby_count(),
            sample_count,
            step_count,
            epoch_secs,
        }
    }

    /// Clear epoch-scoped state. The trailing pitch window survives.
    pub fn reset_epoch(&mut self) {
        self.deviations.clear();
        self.stop_count = 0;
        if let Some(latest) = self.step_latest {
            self.step_baseline = Some(latest);
        }
        self.nearby.clear();
    }

    /// Reduce and reset in one step.
    pub fn freeze(&mut self) -> FeatureSnapshot {
        let snapshot = self.reduce();
        self.reset_epoch();
        snapshot
    }
}

/// Thread-safe handle to the feature window shared with ingestion sources.
#[derive(Debug, Clone)]
pub struct SharedFeatureWindow {
    inner: Arc<Mutex<FeatureWindow>>,
}

impl SharedFeatureWindow {
    pub fn new(epoch_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeatureWindow::new(epoch_duration))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeatureWindow> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, event: SensorEvent) {
        self.lock().ingest(event);
    }

    /// Atomically reduce the epoch and clear it for the next one.
    pub fn freeze(&self) -> FeatureSnapshot {
        self.lock().freeze()
    }

    /// In-progress step count and nearby-device count, without resetting.
    pub fn peek_counts(&self) -> (u32, u32) {
        let window = self.lock();
        (window.step_count(), window.nearby_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{ProximityHit, StepSample, GRAVITY_EARTH};

    fn accel(ts: u64, x: f64, y: f64, z: f64) -> SensorEvent {
        SensorEvent::Accelerometer(AccelSample::new(ts, x, y, z))
    }

    fn steps(ts: u64, cumulative: f64) -> SensorEvent {
        SensorEvent::StepCounter(StepSample {
            timestamp_ms: ts,
            cumulative,
        })
    }

    fn peer(id: &str) -> SensorEvent {
        SensorEvent::ProximityHit(ProximityHit {
            timestamp_ms: 0,
            peer_id: id.to_string(),
        })
    }

    #[test]
    fn test_pitch_window_is_bounded() {
        let mut window = PitchWindow::default();
        for i in 0..50 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), PITCH_WINDOW_CAPACITY);
        assert_eq!(window.last(), Some(49.0));
        // holds 30..=49
        assert!((window.mean() - 39.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_reduces_to_zeroes() {
        let window = FeatureWindow::new(Duration::from_secs(5));
        let snapshot = window.reduce();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.avg_speed, 0.0);
        assert_eq!(snapshot.accel_variance, 0.0);
        assert_eq!(snapshot.step_rate, 0.0);
        assert_eq!(snapshot.pitch_degrees, 0.0);
    }

    #[test]
    fn test_avg_speed_and_variance() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        // deviations of 0.1 and 0.3
        window.ingest(accel(0, 0.0, 0.0, GRAVITY_EARTH + 0.1));
        window.ingest(accel(100, 0.0, 0.0, GRAVITY_EARTH + 0.3));

        let snapshot = window.reduce();
        assert_eq!(snapshot.sample_count, 2);
        assert!((snapshot.avg_speed - 0.2).abs() < 1e-9);
        assert!((snapshot.accel_variance - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_stop_count_once_per_second() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        // stationary samples every 200ms over ~3.2s
        for i in 0..17 {
            window.ingest(accel(i * 200, 0.0, 0.0, GRAVITY_EARTH));
        }
        // checks at 0, 1200, 2400 (strictly more than 1s since the last check)
        assert_eq!(window.reduce().stop_count, 3);
    }

    #[test]
    fn test_moving_samples_do_not_stop() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        for i in 0..5 {
            window.ingest(accel(i * 1500, 0.0, 0.0, GRAVITY_EARTH + 1.0));
        }
        assert_eq!(window.reduce().stop_count, 0);
    }

    #[test]
    fn test_step_delta_per_epoch() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        window.ingest(steps(0, 100.0));
        window.ingest(steps(1000, 110.0));
        let first = window.freeze();
        assert_eq!(first.step_count, 10);
        assert!((first.step_rate - 2.0).abs() < 1e-9);

        window.ingest(steps(6000, 115.0));
        assert_eq!(window.freeze().step_count, 5);
        assert_eq!(window.freeze().step_count, 0);
    }

    #[test]
    fn test_step_counter_restart_rebaselines() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        window.ingest(steps(0, 500.0));
        window.ingest(steps(100, 3.0));
        window.ingest(steps(200, 7.0));
        assert_eq!(window.step_count(), 4);
    }

    #[test]
    fn test_reset_keeps_pitch_window() {
        let mut window = FeatureWindow::new(Duration::from_secs(5));
        window.ingest(accel(0, 0.0, GRAVITY_EARTH, 0.0));
        window.ingest(peer("a"));
        window.ingest(peer("a"));
        window.ingest(peer("b"));

        let first = window.freeze();
        assert_eq!(first.nearby_device_count, 2);

        let second = window.reduce();
        assert_eq!(second.nearby_device_count, 0);
        assert_eq!(second.stop_count, 0);
        assert!(second.is_empty());
        assert!((second.pitch_degrees - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_shared_freeze_is_exclusive() {
        let shared = SharedFeatureWindow::new(Duration::from_secs(5));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        shared.ingest(accel(t * 10_000 + i, 0.0, 0.0, GRAVITY_EARTH));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for _ in 0..10 {
            seen += shared.freeze().sample_count;
        }
        for writer in writers {
            writer.join().unwrap();
        }
        seen += shared.freeze().sample_count;

        assert_eq!(seen, 1000);
    }
}
