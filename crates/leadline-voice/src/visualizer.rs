//! Visualizer feed: one scalar intensity (0..=1) for the pulsing call indicator.
//!
//! Capture and playback both raise the level; neither lowers it, so whichever side
//! is active drives the indicator and the other side's silence only lets it decay.
//!
//! Observational only. Publishers use `try_lock` and simply lose the update when the
//! reader holds the lock, so the audio path never waits on the UI.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// RMS of normal speech sits around 0.05..0.2; scale it into the indicator range.
const CAPTURE_GAIN: f32 = 5.0;

/// A one-second playback buffer drives the indicator to full scale.
const PLAYBACK_GAIN: f32 = 1.0;

/// Time constant of the exponential decay applied on read.
const DECAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Level {
    value: f32,
    at: Instant,
}

/// Shared intensity signal. Cloning shares the same underlying level.
#[derive(Debug, Clone)]
pub struct VisualizerFeed {
    level: Arc<Mutex<Level>>,
}

impl Default for VisualizerFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualizerFeed {
    /// Create a new, silent feed.
    pub fn new() -> Self {
        Self {
            level: Arc::new(Mutex::new(Level {
                value: 0.0,
                at: Instant::now(),
            })),
        }
    }

    /// Publish the RMS of a captured block.
    pub fn publish_capture(&self, rms: f32) {
        self.raise((rms * CAPTURE_GAIN).clamp(0.0, 1.0));
    }

    /// Publish a pulse for a playback buffer of the given length.
    pub fn publish_playback(&self, duration: Duration) {
        self.raise((duration.as_secs_f32() * PLAYBACK_GAIN).clamp(0.0, 1.0));
    }

    /// Current intensity with decay applied.
    pub fn intensity(&self) -> f32 {
        match self.level.lock() {
            Ok(level) => decayed(&level, Instant::now()),
            Err(_) => 0.0,
        }
    }

    /// Drop the level to zero, e.g. when the call ends.
    pub fn reset(&self) {
        if let Ok(mut level) = self.level.try_lock() {
            level.value = 0.0;
            level.at = Instant::now();
        }
    }

    fn raise(&self, value: f32) {
        if let Ok(mut level) = self.level.try_lock() {
            let now = Instant::now();
            level.value = decayed(&level, now).max(value);
            level.at = now;
        }
    }
}

fn decayed(level: &Level, now: Instant) -> f32 {
    let elapsed = now.saturating_duration_since(level.at).as_secs_f32();
    let value = level.value * (-elapsed / DECAY.as_secs_f32()).exp();
    value.clamp(0.0, 1.0)
}
