//! Slice playback.

use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::ViewerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub interval: Duration,
    pub looping: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            interval: Duration::from_millis(200),
            looping: true,
        }
    }
}

impl PlaybackState {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            is_playing: false,
            interval: config.playback_interval(),
            looping: config.loop_playback,
        }
    }

    /// Index following `index` in a series of `len` slices.
    ///
    /// Past the last slice playback wraps to 0 when looping; otherwise it
    /// stays on the last slice and stops.
    pub fn advance(&mut self, index: usize, len: usize) -> usize {
        if len == 0 {
            self.is_playing = false;
            return 0;
        }
        let next = index + 1;
        if next < len {
            next
        } else if self.looping {
            0
        } else {
            self.is_playing = false;
            len - 1
        }
    }
}

/// Fixed-rate tick source driving playback.
pub struct PlaybackClock {
    interval: Interval,
}

impl PlaybackClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}
