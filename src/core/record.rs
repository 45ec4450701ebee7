//! Output records and the sinks that receive them.
//!
//! Two record kinds leave the engine: one per epoch, and one per accepted
//! manual report. Sinks get them as they are produced; nothing is retained by
//! the engine after emission.

use crate::core::blend::BlendedResult;
use crate::core::features::FeatureSnapshot;
use crate::core::posture::PostureState;
use crate::core::scoring::CongestionLevel;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Per-epoch output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Wall-clock time of emission (ms since epoch)
    pub timestamp: i64,
    pub step_rate: f64,
    pub avg_speed: f64,
    pub stop_count: u32,
    pub nearby_devices: u32,
    pub sensor_level: CongestionLevel,
    pub crowd_level: CongestionLevel,
    pub blended_level: CongestionLevel,
    pub is_sitting: bool,
    pub posture: PostureState,
}

impl EpochRecord {
    pub fn new(
        timestamp: i64,
        snapshot: &FeatureSnapshot,
        result: &BlendedResult,
        posture: PostureState,
    ) -> Self {
        Self {
            timestamp,
            step_rate: snapshot.step_rate,
            avg_speed: snapshot.avg_speed,
            stop_count: snapshot.stop_count,
            nearby_devices: snapshot.nearby_device_count,
            sensor_level: result.sensor_level,
            crowd_level: result.crowd_level,
            blended_level: result.level,
            is_sitting: snapshot.is_sitting(),
            posture,
        }
    }
}

/// Record written when the user submits a manual report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReportRecord {
    pub timestamp: i64,
    /// `yyyy-MM-dd HH:mm:ss` in the configured timezone
    pub formatted_time: String,
    pub reported_level: CongestionLevel,
    pub step_count: u32,
    pub nearby_devices: u32,
    pub posture: PostureState,
}

impl UserReportRecord {
    pub fn new(
        timestamp: i64,
        timezone: Tz,
        reported_level: CongestionLevel,
        step_count: u32,
        nearby_devices: u32,
        posture: PostureState,
    ) -> Self {
        Self {
            timestamp,
            formatted_time: format_local(timestamp, timezone),
            reported_level,
            step_count,
            nearby_devices,
            posture,
        }
    }
}

/// Format a millisecond timestamp as `yyyy-MM-dd HH:mm:ss` in `timezone`.
pub fn format_local(timestamp_ms: i64, timezone: Tz) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(utc) => utc
            .with_timezone(&timezone)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => String::from("invalid time"),
    }
}

/// Errors raised by output sinks.
#[derive(Debug)]
pub enum SinkError {
    Io(String),
    Serialization(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "Sink IO error: {e}"),
            SinkError::Serialization(e) => write!(f, "Sink serialization error: {e}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Receiver of engine output.
pub trait ResultSink: Send + Sync {
    fn emit_epoch(&self, record: &EpochRecord) -> Result<(), SinkError>;
    fn emit_user_report(&self, record: &UserReportRecord) -> Result<(), SinkError>;
}

/// Tagged line format for [`JsonlSink`].
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SinkLine<'a> {
    Epoch(&'a EpochRecord),
    UserReport(&'a UserReportRecord),
}

/// Appends records to a JSON-lines file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open (or create) the file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::Io(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::Io(e.to_string()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &SinkLine<'_>) -> Result<(), SinkError> {
        let mut json =
            serde_json::to_string(line).map_err(|e| SinkError::Serialization(e.to_string()))?;
        json.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(json.as_bytes())
            .map_err(|e| SinkError::Io(e.to_string()))
    }
}

impl ResultSink for JsonlSink {
    fn emit_epoch(&self, record: &EpochRecord) -> Result<(), SinkError> {
        self.write_line(&SinkLine::Epoch(record))
    }

    fn emit_user_report(&self, record: &UserReportRecord) -> Result<(), SinkError> {
        self.write_line(&SinkLine::UserReport(record))
    }
}

/// Keeps records in memory. Used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct MemorySink {
    epochs: Mutex<Vec<EpochRecord>>,
    user_reports: Mutex<Vec<UserReportRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epochs(&self) -> Vec<EpochRecord> {
        self.epochs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn user_reports(&self) -> Vec<UserReportRecord> {
        self.user_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ResultSink for MemorySink {
    fn emit_epoch(&self, record: &EpochRecord) -> Result<(), SinkError> {
        self.epochs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn emit_user_report(&self, record: &UserReportRecord) -> Result<(), SinkError> {
        self.user_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
