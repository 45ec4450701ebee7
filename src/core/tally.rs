//! Crowd vote tallying.

use crate::core::scoring::CongestionLevel;
use serde::{Deserialize, Serialize};

/// Enumeration order used to break ties: the earliest level wins.
pub const VOTE_ORDER: [CongestionLevel; 3] = [
    CongestionLevel::Low,
    CongestionLevel::Medium,
    CongestionLevel::High,
];

/// Aggregated crowd votes for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub winning_level: CongestionLevel,
}

impl Default for VoteTally {
    /// The fail-open tally: no votes, Low wins.
    fn default() -> Self {
        Self {
            low: 0,
            medium: 0,
            high: 0,
            winning_level: CongestionLevel::Low,
        }
    }
}

impl VoteTally {
    /// Tally votes. Anything outside Low/Medium/High is ignored.
    pub fn from_votes<I>(votes: I) -> Self
    where
        I: IntoIterator<Item = CongestionLevel>,
    {
        let mut tally = Self::default();
        for vote in votes {
            match vote {
                CongestionLevel::Low => tally.low += 1,
                CongestionLevel::Medium => tally.medium += 1,
                CongestionLevel::High => tally.high += 1,
                CongestionLevel::Idle => {}
            }
        }
        tally.winning_level = tally.winner();
        tally
    }

    pub fn count(&self, level: CongestionLevel) -> u32 {
        match level {
            CongestionLevel::Low => self.low,
            CongestionLevel::Medium => self.medium,
            CongestionLevel::High => self.high,
            CongestionLevel::Idle => 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.low + self.medium + self.high
    }

    /// Level with the most votes; ties go to the first level in [`VOTE_ORDER`].
    fn winner(&self) -> CongestionLevel {
        let mut best = VOTE_ORDER[0];
        for level in VOTE_ORDER.iter().skip(1) {
            if self.count(*level) > self.count(best) {
                best = *level;
            }
        }
        best
    }
}
