//! Deterministic congestion scoring.
//!
//! Each feature contributes a small integer term; the total maps onto a
//! discrete congestion level. An idle device bypasses the scorer entirely.

use crate::core::features::FeatureSnapshot;
use serde::{Deserialize, Serialize};

/// Score at or above which the level is High.
const HIGH_SCORE: i32 = 5;
/// Score at or above which the level is Medium.
const MEDIUM_SCORE: i32 = 3;

/// Acceleration variance below which a device with no counted steps is idle.
const IDLE_MAX_VARIANCE: f64 = 0.01;

/// Perceived crowd density.
///
/// `Idle` is the bypass state reported when the device is not being carried;
/// it never appears in crowd votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CongestionLevel {
    Idle,
    Low,
    Medium,
    High,
}

impl CongestionLevel {
    /// Parse a crowd vote. Only Low, Medium and High are votes.
    pub fn from_vote(value: &str) -> Option<Self> {
        match value {
            "Low" => Some(CongestionLevel::Low),
            "Medium" => Some(CongestionLevel::Medium),
            "High" => Some(CongestionLevel::High),
            _ => None,
        }
    }

    /// Whether this level can be submitted as a crowd vote.
    pub fn is_vote(&self) -> bool {
        !matches!(self, CongestionLevel::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Idle => "Idle",
            CongestionLevel::Low => "Low",
            CongestionLevel::Medium => "Medium",
            CongestionLevel::High => "High",
        }
    }
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CongestionLevel {
    type Err = String;

    /// Case-insensitive parse, for user input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "idle" => Ok(CongestionLevel::Idle),
            "low" => Ok(CongestionLevel::Low),
            "medium" => Ok(CongestionLevel::Medium),
            "high" => Ok(CongestionLevel::High),
            other => Err(format!("unknown congestion level '{other}'")),
        }
    }
}

/// Per-term detail of one congestion score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub step_score: i32,
    pub stop_score: i32,
    pub speed_score: i32,
    pub crowd_factor: i32,
    pub motion_variance_score: i32,
    pub slow_walking_penalty: i32,
    pub stationary_penalty: i32,
    pub total: i32,
    pub level: CongestionLevel,
}

impl ScoreBreakdown {
    /// The bypass result for an idle device: every term zero.
    pub fn idle() -> Self {
        Self {
            step_score: 0,
            stop_score: 0,
            speed_score: 0,
            crowd_factor: 0,
            motion_variance_score: 0,
            slow_walking_penalty: 0,
            stationary_penalty: 0,
            total: 0,
            level: CongestionLevel::Idle,
        }
    }
}

fn crowd_factor(nearby: u32) -> i32 {
    match nearby {
        n if n >= 8 => 6,
        n if n >= 5 => 4,
        n if n >= 3 => 2,
        _ => -1,
    }
}

fn stop_score(stops: u32) -> i32 {
    match stops {
        n if n >= 5 => 3,
        n if n >= 3 => 2,
        n if n >= 1 => 1,
        _ => 0,
    }
}

fn speed_score(avg_speed: f64) -> i32 {
    if avg_speed < 0.05 {
        2
    } else if avg_speed < 0.15 {
        1
    } else {
        0
    }
}

fn step_score(step_rate: f64) -> i32 {
    if step_rate < 0.4 {
        2
    } else if step_rate < 1.2 {
        1
    } else {
        0
    }
}

fn motion_variance_score(accel_variance: f64) -> i32 {
    if accel_variance >= 0.03 {
        0
    } else if accel_variance >= 0.01 {
        2
    } else {
        3
    }
}

/// Slow shuffling in a crowd: few steps, low but nonzero motion, peers around.
fn slow_walking_penalty(s: &FeatureSnapshot) -> i32 {
    let slow = s.step_rate < 0.3
        && (0.03..=0.2).contains(&s.avg_speed)
        && s.accel_variance < 0.02
        && s.nearby_device_count >= 3;
    if slow {
        2
    } else {
        0
    }
}

fn stationary_penalty(s: &FeatureSnapshot) -> i32 {
    if s.avg_speed < 0.05 && s.nearby_device_count >= 5 {
        2
    } else {
        0
    }
}

fn level_for(total: i32) -> CongestionLevel {
    match total {
        t if t >= HIGH_SCORE => CongestionLevel::High,
        t if t >= MEDIUM_SCORE => CongestionLevel::Medium,
        _ => CongestionLevel::Low,
    }
}

/// Score a snapshot. Never yields `Idle`.
pub fn score(snapshot: &FeatureSnapshot) -> ScoreBreakdown {
    let step_score = step_score(snapshot.step_rate);
    let stop_score = stop_score(snapshot.stop_count);
    let speed_score = speed_score(snapshot.avg_speed);
    let crowd_factor = crowd_factor(snapshot.nearby_device_count);
    let motion_variance_score = motion_variance_score(snapshot.accel_variance);
    let slow_walking_penalty = slow_walking_penalty(snapshot);
    let stationary_penalty = stationary_penalty(snapshot);

    let total = step_score
        + stop_score
        + speed_score
        + crowd_factor
        + motion_variance_score
        + slow_walking_penalty
        + stationary_penalty;

    ScoreBreakdown {
        step_score,
        stop_score,
        speed_score,
        crowd_factor,
        motion_variance_score,
        slow_walking_penalty,
        stationary_penalty,
        total,
        level: level_for(total),
    }
}

/// Whether the phone looks set down: no motion samples, or barely any motion
/// and no counted steps.
pub fn is_phone_idle(snapshot: &FeatureSnapshot) -> bool {
    snapshot.is_empty()
        || (snapshot.accel_variance < IDLE_MAX_VARIANCE && snapshot.step_count == 0)
}

/// Score a snapshot, applying the idle override first.
pub fn evaluate(snapshot: &FeatureSnapshot) -> ScoreBreakdown {
    if is_phone_idle(snapshot) {
        ScoreBreakdown::idle()
    } else {
        score(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        step_rate: f64,
        avg_speed: f64,
        stop_count: u32,
        nearby: u32,
        accel_variance: f64,
    ) -> FeatureSnapshot {
        FeatureSnapshot {
            step_rate,
            avg_speed,
            stop_count,
            nearby_device_count: nearby,
            accel_variance,
            sample_count: 25,
            epoch_secs: 5.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_crowded_shuffle_scores_high() {
        let breakdown = score(&snapshot(0.1, 0.03, 6, 9, 0.002));
        assert_eq!(breakdown.crowd_factor, 6);
        assert_eq!(breakdown.stop_score, 3);
        assert_eq!(breakdown.speed_score, 2);
        assert_eq!(breakdown.step_score, 2);
        assert_eq!(breakdown.motion_variance_score, 3);
        assert_eq!(breakdown.stationary_penalty, 2);
        assert_eq!(breakdown.slow_walking_penalty, 2);
        assert_eq!(breakdown.total, 20);
        assert_eq!(breakdown.level, CongestionLevel::High);
    }

    #[test]
    fn test_brisk_walk_alone_scores_low() {
        let breakdown = score(&snapshot(2.0, 0.8, 0, 0, 0.2));
        assert_eq!(breakdown.crowd_factor, -1);
        assert_eq!(breakdown.total, -1);
        assert_eq!(breakdown.level, CongestionLevel::Low);
    }

    #[test]
    fn test_medium_threshold() {
        // step 1 + stop 1 + speed 0 + crowd 2 + variance 0 = 4
        let breakdown = score(&snapshot(0.5, 0.3, 1, 3, 0.05));
        assert_eq!(breakdown.total, 4);
        assert_eq!(breakdown.level, CongestionLevel::Medium);
    }

    #[test]
    fn test_many_peers_always_add_six() {
        for nearby in [8, 9, 20, 200] {
            for (rate, speed, var) in [(0.0, 0.0, 0.0), (3.0, 2.0, 1.0), (0.8, 0.1, 0.015)] {
                let breakdown = score(&snapshot(rate, speed, 0, nearby, var));
                assert_eq!(breakdown.crowd_factor, 6);
                assert!(breakdown.total >= HIGH_SCORE);
                assert_eq!(breakdown.level, CongestionLevel::High);
            }
        }
    }

    #[test]
    fn test_empty_epoch_is_idle_regardless_of_inputs() {
        let empty = FeatureSnapshot {
            sample_count: 0,
            nearby_device_count: 12,
            stop_count: 9,
            step_rate: 0.0,
            ..Default::default()
        };
        assert_eq!(evaluate(&empty), ScoreBreakdown::idle());
    }

    #[test]
    fn test_still_phone_without_steps_is_idle() {
        let breakdown = evaluate(&snapshot(0.0, 0.02, 0, 0, 0.002));
        assert_eq!(breakdown.level, CongestionLevel::Idle);
        assert_eq!(breakdown.total, 0);
        assert_eq!(breakdown.crowd_factor, 0);
    }

    #[test]
    fn test_counted_steps_defeat_idle_override() {
        let mut s = snapshot(0.6, 0.02, 0, 0, 0.002);
        s.step_count = 3;
        assert!(!is_phone_idle(&s));
        assert_ne!(evaluate(&s).level, CongestionLevel::Idle);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(CongestionLevel::from_vote("Medium"), Some(CongestionLevel::Medium));
        assert_eq!(CongestionLevel::from_vote("Idle"), None);
        assert_eq!(CongestionLevel::from_vote("medium"), None);
        assert_eq!("HIGH".parse::<CongestionLevel>(), Ok(CongestionLevel::High));
        assert!("packed".parse::<CongestionLevel>().is_err());
    }
}
