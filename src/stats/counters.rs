//! Engine activity counters.
//!
//! Counts what the engine has processed and decided, never the samples or
//! reports themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current process, optionally persisted across runs.
#[derive(Debug)]
pub struct EngineStats {
    accel_samples: AtomicU64,
    step_events: AtomicU64,
    proximity_hits: AtomicU64,
    epochs_emitted: AtomicU64,
    idle_epochs: AtomicU64,
    /// Epochs whose crowd level fell back to the empty tally
    aggregation_fallbacks: AtomicU64,
    reports_submitted: AtomicU64,
    reports_rejected: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            accel_samples: AtomicU64::new(0),
            step_events: AtomicU64::new(0),
            proximity_hits: AtomicU64::new(0),
            epochs_emitted: AtomicU64::new(0),
            idle_epochs: AtomicU64::new(0),
            aggregation_fallbacks: AtomicU64::new(0),
            reports_submitted: AtomicU64::new(0),
            reports_rejected: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Counters backed by a JSON file; previous totals are loaded if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!(error = %e, "could not load previous engine stats");
        }

        stats
    }

    pub fn record_accel_sample(&self) {
        self.accel_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_event(&self) {
        self.step_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proximity_hit(&self) {
        self.proximity_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_epoch(&self, idle: bool) {
        self.epochs_emitted.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_epochs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_aggregation_fallback(&self) {
        self.aggregation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_submitted(&self) {
        self.reports_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_rejected(&self) {
        self.reports_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accel_samples: self.accel_samples.load(Ordering::Relaxed),
            step_events: self.step_events.load(Ordering::Relaxed),
            proximity_hits: self.proximity_hits.load(Ordering::Relaxed),
            epochs_emitted: self.epochs_emitted.load(Ordering::Relaxed),
            idle_epochs: self.idle_epochs.load(Ordering::Relaxed),
            aggregation_fallbacks: self.aggregation_fallbacks.load(Ordering::Relaxed),
            reports_submitted: self.reports_submitted.load(Ordering::Relaxed),
            reports_rejected: self.reports_rejected.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Engine Statistics:\n\
             - Accelerometer samples: {}\n\
             - Step-counter events: {}\n\
             - Proximity hits: {}\n\
             - Epochs emitted: {} ({} idle)\n\
             - Aggregation fallbacks: {}\n\
             - Reports submitted: {}\n\
             - Reports rejected: {}\n\
             - Session duration: {} seconds",
            s.accel_samples,
            s.step_events,
            s.proximity_hits,
            s.epochs_emitted,
            s.idle_epochs,
            s.aggregation_fallbacks,
            s.reports_submitted,
            s.reports_rejected,
            s.session_duration_secs
        )
    }

    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let s = self.snapshot();
            let persisted = PersistedStats {
                accel_samples: s.accel_samples,
                step_events: s.step_events,
                proximity_hits: s.proximity_hits,
                epochs_emitted: s.epochs_emitted,
                idle_epochs: s.idle_epochs,
                aggregation_fallbacks: s.aggregation_fallbacks,
                reports_submitted: s.reports_submitted,
                reports_rejected: s.reports_rejected,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let p: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.accel_samples.store(p.accel_samples, Ordering::Relaxed);
                self.step_events.store(p.step_events, Ordering::Relaxed);
                self.proximity_hits.store(p.proximity_hits, Ordering::Relaxed);
                self.epochs_emitted.store(p.epochs_emitted, Ordering::Relaxed);
                self.idle_epochs.store(p.idle_epochs, Ordering::Relaxed);
                self.aggregation_fallbacks
                    .store(p.aggregation_fallbacks, Ordering::Relaxed);
                self.reports_submitted
                    .store(p.reports_submitted, Ordering::Relaxed);
                self.reports_rejected.store(p.reports_rejected, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accel_samples: u64,
    pub step_events: u64,
    pub proximity_hits: u64,
    pub epochs_emitted: u64,
    pub idle_epochs: u64,
    pub aggregation_fallbacks: u64,
    pub reports_submitted: u64,
    pub reports_rejected: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    accel_samples: u64,
    step_events: u64,
    proximity_hits: u64,
    epochs_emitted: u64,
    idle_epochs: u64,
    aggregation_fallbacks: u64,
    reports_submitted: u64,
    reports_rejected: u64,
    last_updated: DateTime<Utc>,
}

pub type SharedEngineStats = Arc<EngineStats>;

pub fn create_shared_stats() -> SharedEngineStats {
    Arc::new(EngineStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedEngineStats {
    Arc::new(EngineStats::with_persistence(path))
}
