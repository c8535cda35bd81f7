//! Overrun accounting and bitrate reduction

use std::time::Duration;

use tokio::time::Instant;

/// Overrun counter with a resettable window
///
/// The window start doubles as the grace period anchor after a bitrate
/// reduction.
#[derive(Debug, Clone)]
pub struct OverrunWindow {
    count: u32,
    start: Option<Instant>,
    threshold: u32,
    window: Duration,
}

impl OverrunWindow {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            count: 0,
            start: None,
            threshold,
            window,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn start(&self) -> Option<Instant> {
        self.start
    }

    /// Clear the counter and unset the window
    pub fn reset(&mut self) {
        self.count = 0;
        self.start = None;
    }

    /// Clear the counter and start a new window at `now`
    pub fn restart(&mut self, now: Instant) {
        self.count = 0;
        self.start = Some(now);
    }

    /// Start the window at `now` unless one is running
    pub fn mark_start(&mut self, now: Instant) {
        if self.start.is_none() {
            self.start = Some(now);
        }
    }

    /// Count an overrun without any threshold logic
    pub fn bump(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Count an overrun while transmitting; true once the threshold is reached
    ///
    /// An expired or unset window zeroes the counter, dropping this overrun
    /// too, and starts a new window.
    pub fn record(&mut self, now: Instant) -> bool {
        self.bump();
        let expired = self.start.map_or(true, |start| now > start + self.window);
        if expired {
            tracing::debug!(overruns = self.count, "overrun window expired");
            self.restart(now);
        }
        self.count >= self.threshold
    }

    /// Count an overrun while adjusting; true when another reduction is due
    ///
    /// Overruns within `grace` of the window start are ignored. Reaching the
    /// threshold clears the counter.
    pub fn record_adjusting(&mut self, now: Instant, grace: Duration) -> bool {
        if self.start.is_some_and(|start| now < start + grace) {
            return false;
        }
        self.bump();
        if self.count >= self.threshold {
            self.count = 0;
            return true;
        }
        false
    }
}

/// Audio bitrate above which audio is reduced too (kbit/s)
pub const AUDIO_REDUCTION_FLOOR: i32 = 96;

/// New encoder bitrates chosen by [`reduce_bitrate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateDecision {
    pub audio: i32,
    pub video: i32,
}

/// Compute reduced bitrates from the measured average throughput
///
/// Audio above 96 kbit/s is cut to 80 % first; video gets 80 % of what the
/// link carried minus the new audio bitrate. Both truncate.
pub fn reduce_bitrate(audio: i32, average: u64) -> BitrateDecision {
    let audio = if audio > AUDIO_REDUCTION_FLOOR {
        audio * 4 / 5
    } else {
        audio
    };
    let budget = average as i64 - audio as i64;
    let video = (budget * 4 / 5).clamp(0, i32::MAX as i64) as i32;
    BitrateDecision { audio, video }
}
