//! Posture classification from step rate and pitch statistics.

use serde::{Deserialize, Serialize};

/// Step rate above which the device is considered walking.
const WALKING_STEP_RATE: f64 = 1.0;

/// Pitch variance above which the device is considered walking.
const WALKING_PITCH_VARIANCE: f64 = 0.02;

/// Pitch band (degrees) for a device lying roughly flat on a lap or table.
const SITTING_PITCH: (f64, f64) = (-30.0, 30.0);
const SITTING_MAX_VARIANCE: f64 = 0.01;

/// Pitch band (degrees) for an upright device.
const STANDING_PITCH: (f64, f64) = (60.0, 120.0);
const STANDING_VARIANCE: (f64, f64) = (0.005, 0.02);

const IDLE_MAX_VARIANCE: f64 = 0.005;

/// Inferred device-carry / user-activity category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostureState {
    #[default]
    Unknown,
    Sitting,
    Standing,
    Walking,
    Idle,
}

impl std::fmt::Display for PostureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PostureState::Unknown => "Unknown",
            PostureState::Sitting => "Sitting",
            PostureState::Standing => "Standing",
            PostureState::Walking => "Walking",
            PostureState::Idle => "Idle",
        };
        f.write_str(name)
    }
}

fn within(value: f64, (low, high): (f64, f64)) -> bool {
    (low..=high).contains(&value)
}

/// Classify posture. Guards are checked in order and the first match wins.
pub fn classify(step_rate: f64, last_pitch: f64, pitch_variance: f64) -> PostureState {
    let still = step_rate == 0.0;
    match (step_rate, last_pitch, pitch_variance) {
        (rate, _, var) if rate > WALKING_STEP_RATE || var > WALKING_PITCH_VARIANCE => {
            PostureState::Walking
        }
        (_, pitch, var) if still && within(pitch, SITTING_PITCH) && var < SITTING_MAX_VARIANCE => {
            PostureState::Sitting
        }
        (_, pitch, var) if still && within(pitch, STANDING_PITCH) && within(var, STANDING_VARIANCE) => {
            PostureState::Standing
        }
        (_, _, var) if still && var < IDLE_MAX_VARIANCE => PostureState::Idle,
        _ => PostureState::Unknown,
    }
}

/// A transition between two postures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostureChange {
    pub from: PostureState,
    pub to: PostureState,
}

/// Tracks the current and previous posture across epochs.
#[derive(Debug, Clone, Default)]
pub struct PostureTracker {
    current: PostureState,
    last: PostureState,
    pending: Option<PostureChange>,
}

impl PostureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this epoch's posture, returning the transition if it changed.
    pub fn update(&mut self, posture: PostureState) -> Option<PostureChange> {
        if posture == self.current {
            return None;
        }
        self.last = self.current;
        self.current = posture;
        let change = PostureChange {
            from: self.last,
            to: self.current,
        };
        tracing::info!(from = %change.from, to = %change.to, "posture changed");
        self.pending = Some(change);
        Some(change)
    }

    pub fn current(&self) -> PostureState {
        self.current
    }

    pub fn last(&self) -> PostureState {
        self.last
    }

    /// Take the transition recorded since the last call, clearing the log.
    pub fn take_change(&mut self) -> Option<PostureChange> {
        self.pending.take()
    }
}
