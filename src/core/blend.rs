//! Blending of the sensed level with the crowd level.

use crate::core::scoring::CongestionLevel;
use crate::core::tally::VoteTally;
use serde::{Deserialize, Serialize};

/// Rank under High > Medium > Low. Idle ranks as Low.
fn severity(level: CongestionLevel) -> u8 {
    match level {
        CongestionLevel::Idle | CongestionLevel::Low => 0,
        CongestionLevel::Medium => 1,
        CongestionLevel::High => 2,
    }
}

/// Merge two levels, keeping the more severe one.
///
/// The result is never `Idle`: an idle sensor reading blends as Low.
pub fn blend(sensor: CongestionLevel, crowd: CongestionLevel) -> CongestionLevel {
    match severity(sensor).max(severity(crowd)) {
        2 => CongestionLevel::High,
        1 => CongestionLevel::Medium,
        _ => CongestionLevel::Low,
    }
}

/// Final output of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlendedResult {
    pub level: CongestionLevel,
    pub sensor_level: CongestionLevel,
    pub crowd_level: CongestionLevel,
    pub vote_tally: VoteTally,
}

impl BlendedResult {
    pub fn new(sensor_level: CongestionLevel, vote_tally: VoteTally) -> Self {
        Self {
            level: blend(sensor_level, vote_tally.winning_level),
            sensor_level,
            crowd_level: vote_tally.winning_level,
            vote_tally,
        }
    }
}
