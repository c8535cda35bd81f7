//! Throughput and consumer statistics

use std::time::Duration;

use tokio::time::Instant;

/// One completed measurement window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Throughput of the window just closed (kbit/s)
    pub bitrate: u64,
    /// Smoothed throughput after folding in this window (kbit/s)
    pub average: u64,
}

/// Windowed throughput meter for the upstream sink edge
///
/// Bytes are accumulated until one period has elapsed since the window
/// started. The window rate is `bytes * 8 / period_ms` (kbit/s) and is
/// folded into a running average as `avg = (avg + rate) / 2`, the first
/// window seeding the average directly.
#[derive(Debug, Clone)]
pub struct BitrateMeter {
    /// Length of one measurement window
    period: Duration,
    /// Bytes seen in the current window
    sum: u64,
    /// Start of the current window
    window_start: Instant,
    /// Smoothed bitrate, 0 until the first window closes
    average: u64,
    /// Last completed window
    last: Option<Measurement>,
}

impl BitrateMeter {
    /// Create a new meter whose first window starts now
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            sum: 0,
            window_start: Instant::now(),
            average: 0,
            last: None,
        }
    }

    /// Start a fresh window and forget the average
    pub fn reset(&mut self, now: Instant) {
        self.sum = 0;
        self.average = 0;
        self.window_start = now;
        self.last = None;
    }

    /// Account `bytes` seen at `now`; returns the measurement when a window closes
    pub fn record(&mut self, bytes: usize, now: Instant) -> Option<Measurement> {
        self.sum += bytes as u64;
        if now <= self.window_start + self.period {
            return None;
        }

        let period_ms = (self.period.as_millis() as u64).max(1);
        let bitrate = self.sum * 8 / period_ms;
        self.average = if self.average == 0 {
            bitrate
        } else {
            (self.average + bitrate) / 2
        };
        self.window_start = now;
        self.sum = 0;

        let measurement = Measurement {
            bitrate,
            average: self.average,
        };
        self.last = Some(measurement);
        Some(measurement)
    }

    /// Smoothed bitrate in kbit/s
    pub fn average(&self) -> u64 {
        self.average
    }

    pub fn last(&self) -> Option<Measurement> {
        self.last
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Snapshot of the upstream consumer's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    /// Overruns counted in the current window
    pub overruns: u32,
    /// Keepalive timer ticks while waiting
    pub keepalives: u64,
    /// Bitrate reductions applied
    pub adjustments: u64,
    /// Smoothed throughput (kbit/s)
    pub average_bitrate: u64,
    /// Bytes handed to the network sink
    pub bytes_sent: u64,
    /// Samples leaked by the upstream queue
    pub leaked: u64,
}
