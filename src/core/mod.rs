//! Core estimation pipeline for the CrowdSense engine.
//!
//! This module contains:
//! - Epoch accumulation of raw samples into a feature snapshot
//! - Posture classification and congestion scoring
//! - Crowd vote tallying and blending
//! - Output records and sinks

pub mod blend;
pub mod features;
pub mod posture;
pub mod record;
pub mod scoring;
pub mod tally;
pub mod windowing;

// Re-export commonly used types
pub use blend::{blend, BlendedResult};
pub use features::FeatureSnapshot;
pub use posture::{classify, PostureChange, PostureState, PostureTracker};
pub use record::{
    format_local, EpochRecord, JsonlSink, MemorySink, ResultSink, SinkError, UserReportRecord,
};
pub use scoring::{evaluate, is_phone_idle, score, CongestionLevel, ScoreBreakdown};
pub use tally::{VoteTally, VOTE_ORDER};
pub use windowing::{FeatureWindow, PitchWindow, SharedFeatureWindow};
