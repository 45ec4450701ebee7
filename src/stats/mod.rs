//! Engine statistics.
//!
//! Tracks what the engine has processed so operators can see it working
//! without any sample or report content being kept.

pub mod counters;

// Re-export commonly used types
pub use counters::{
    create_shared_stats, create_shared_stats_with_persistence, EngineStats, SharedEngineStats,
    StatsSnapshot,
};
