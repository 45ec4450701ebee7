//! Configuration for the CrowdSense engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Length of one estimation epoch
    #[serde(with = "duration_ms_serde")]
    pub epoch_duration: Duration,

    /// How far back peer reports count toward the crowd level
    #[serde(with = "duration_ms_serde")]
    pub lookback_horizon: Duration,

    /// Minimum time between two accepted manual reports
    #[serde(with = "duration_ms_serde")]
    pub report_cooldown: Duration,

    /// Distance under which a located peer report counts as nearby (meters)
    pub proximity_radius_m: f64,

    /// Deadline for a single location fix
    #[serde(with = "duration_ms_serde")]
    pub location_timeout: Duration,

    /// Deadline for a report-store call
    #[serde(with = "duration_ms_serde")]
    pub store_timeout: Duration,

    /// Stable local label attached to submitted reports
    pub device_id: String,

    /// IANA timezone used for human-readable report times
    pub timezone: String,

    /// Path for stats and the record log
    pub data_path: PathBuf,

    /// Path for exported record files
    pub export_path: PathBuf,

    /// Where peer reports are pushed to and read from
    pub store: StoreConfig,

    /// Time of the last accepted manual report (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report_ms: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crowdsense");

        Self {
            epoch_duration: Duration::from_secs(5),
            lookback_horizon: Duration::from_secs(60),
            report_cooldown: Duration::from_secs(60),
            proximity_radius_m: 50.0,
            location_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(3),
            device_id: generate_device_id(),
            timezone: "UTC".to_string(),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
            store: StoreConfig::default(),
            last_report_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration, writing the defaults on first run so the
    /// generated device id stays stable.
    pub fn load_or_init() -> Result<Self, ConfigError> {
        let existed = Self::config_path().exists();
        let config = Self::load()?;
        if !existed {
            config.save()?;
        }
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crowdsense")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Parsed timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> chrono_tz::Tz {
        match self.timezone.parse::<chrono_tz::Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(timezone = %self.timezone, "unknown timezone, using UTC");
                chrono_tz::UTC
            }
        }
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// JSON-lines file receiving epoch and user-report records.
    pub fn records_path(&self) -> PathBuf {
        self.export_path.join("records.jsonl")
    }
}

/// Report store backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-process store; reports live only as long as the engine
    #[default]
    Memory,
    /// Remote REST store
    Http { base_url: String, token: String },
}

/// `crowdsense-<hostname>-<8 hex chars>`.
pub fn generate_device_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "crowdsense-{}-{}",
        hostname,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "Parse error: {e}"),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as integer milliseconds.
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
