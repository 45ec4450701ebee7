//! CrowdSense Engine - congestion and posture estimation from motion sensing
//! and peer crowd reports.
//!
//! Every epoch (5 s by default) the engine reduces the motion samples it has
//! received to a feature snapshot, classifies posture, scores congestion,
//! tallies recent peer votes from nearby devices, and blends the two into one
//! level: Low, Medium or High.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         CrowdSense Engine                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │  Collector  │──▶│  Windowing  │──▶│  Features   │             │
//! │  │  (replay)   │   │ (5s epochs) │   │ (snapshot)  │             │
//! │  └─────────────┘   └─────────────┘   └──────┬──────┘             │
//! │                                      ┌──────┴──────┐             │
//! │                                      ▼             ▼             │
//! │                              ┌────────────┐ ┌────────────┐       │
//! │                              │  Posture   │ │  Scoring   │       │
//! │                              └────────────┘ └─────┬──────┘       │
//! │  ┌─────────────┐   ┌─────────────┐                ▼              │
//! │  │Report store │──▶│ Aggregation │──────────▶ ┌────────┐──▶ Sink │
//! │  │ (mem/HTTP)  │   │ (vote tally)│            │ Blend  │         │
//! │  └─────────────┘   └─────────────┘            └────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crowdsense_engine::{
//!     collector::{FixedLocation, StaticNetwork},
//!     core::MemorySink,
//!     engine,
//!     reports::MemoryReportStore,
//!     stats::create_shared_stats,
//!     Config,
//! };
//!
//! # async fn run() {
//! let config = Config::default();
//! let (handle, task) = engine::spawn(
//!     &config,
//!     Arc::new(MemoryReportStore::new()),
//!     Arc::new(FixedLocation(None)),
//!     Arc::new(StaticNetwork::new(Some("CampusNet"))),
//!     Arc::new(MemorySink::new()),
//!     create_shared_stats(),
//! );
//!
//! // Samples are fed through handle.ingest(..); results appear on
//! // handle.watch_latest().
//! task.shutdown().await;
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod core;
pub mod engine;
pub mod reports;
pub mod stats;

#[cfg(feature = "gateway")]
pub mod gateway;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use collector::{Collector, CollectorConfig, CollectorError, SensorEvent};
pub use config::{Config, ConfigError, StoreConfig};
pub use core::{BlendedResult, CongestionLevel, FeatureSnapshot, PostureState, VoteTally};
pub use engine::{EngineHandle, EngineState, EngineTask, EpochOutcome, Orchestrator};
pub use reports::{CrowdReport, MemoryReportStore, ReportStore, StoreError, SubmitError};
pub use stats::{EngineStats, SharedEngineStats, StatsSnapshot};

// Gateway re-exports (when enabled)
#[cfg(feature = "gateway")]
pub use gateway::{GatewayConfig, HttpReportStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Data declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║               CROWDSENSE ENGINE - DATA DECLARATION               ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This engine estimates how crowded your surroundings are.        ║
║                                                                  ║
║  ✓ WHAT WE PROCESS LOCALLY:                                      ║
║    • Motion magnitude and phone tilt (accelerometer)             ║
║    • Step counts                                                 ║
║    • How many nearby devices a scan saw (count only)             ║
║                                                                  ║
║  ✓ WHAT A REPORT SHARES (only when you submit one):              ║
║    • The level you chose (Low / Medium / High)                   ║
║    • Network name, and location if available                     ║
║    • This install's device label                                 ║
║                                                                  ║
║  ✗ WHAT WE NEVER KEEP:                                           ║
║    • Raw sensor samples (discarded every epoch)                  ║
║    • Identities of nearby devices                                ║
║                                                                  ║
║  You can view processing statistics anytime with:                ║
║    crowdsense status                                             ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_declaration_contents() {
        assert!(PRIVACY_DECLARATION.contains("DATA DECLARATION"));
        assert!(PRIVACY_DECLARATION.contains("NEVER KEEP"));
        assert!(PRIVACY_DECLARATION.contains("Raw sensor samples"));
    }
}
