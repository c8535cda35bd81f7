//! Upstream pusher configuration

use std::time::Duration;

use crate::media::TS_PACKET_SIZE;

/// Upstream pusher configuration options
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Queue bound in buffers (leaky, no byte or time bound)
    pub queue_buffers: usize,

    /// Maximum age of a buffer reaching the network sink
    pub max_lateness: Duration,

    /// Maximum age while WAITING for the peer
    pub waiting_lateness: Duration,

    /// Size of one network write (7 transport packets)
    pub block_size: usize,

    /// Fixed length of the authentication token on the wire
    pub token_len: usize,

    /// Overruns within one window that count as congestion
    pub max_overruns: u32,

    /// Overrun counting window
    pub overrun_window: Duration,

    /// Fallback to WAITING when no data flows after an overrun
    pub waiting_timeout: Duration,

    /// Delay before retrying transmission from OVERLOAD or ADJUSTING
    pub resume_delay: Duration,

    /// Keepalive period while WAITING
    pub keepalive_interval: Duration,

    /// Throughput measurement window
    pub bitrate_period: Duration,

    /// Overruns within this time after a bitrate reduction are ignored
    pub adjust_grace: Duration,

    /// Reduce the encoder bitrate on congestion instead of stalling
    pub adaptive_bitrate: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            queue_buffers: 400,
            max_lateness: Duration::from_secs(3),
            waiting_lateness: Duration::from_secs(1),
            block_size: 7 * TS_PACKET_SIZE,
            token_len: 36,
            max_overruns: 5,
            overrun_window: Duration::from_secs(15),
            waiting_timeout: Duration::from_secs(5),
            resume_delay: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(5),
            bitrate_period: Duration::from_secs(6),
            adjust_grace: Duration::from_secs(6),
            adaptive_bitrate: true,
        }
    }
}

impl UpstreamConfig {
    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the queue bound
    pub fn queue_buffers(mut self, buffers: usize) -> Self {
        self.queue_buffers = buffers.max(1);
        self
    }

    /// Set the resume delay
    pub fn resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    /// Set the grace period after a bitrate reduction
    pub fn adjust_grace(mut self, grace: Duration) -> Self {
        self.adjust_grace = grace;
        self
    }

    /// Start with adaptive bitrate switched off
    pub fn disable_adaptive_bitrate(mut self) -> Self {
        self.adaptive_bitrate = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpstreamConfig::default();

        assert_eq!(config.block_size, 1316);
        assert_eq!(config.queue_buffers, 400);
        assert_eq!(config.token_len, 36);
        assert_eq!(config.resume_delay, Duration::from_secs(20));
        assert_eq!(config.adjust_grace, config.bitrate_period);
        assert!(config.adaptive_bitrate);
    }

    #[test]
    fn test_builder_queue_buffers_never_zero() {
        let config = UpstreamConfig::default().queue_buffers(0);

        assert_eq!(config.queue_buffers, 1);
    }

    #[test]
    fn test_builder_disable_adaptive() {
        let config = UpstreamConfig::default().disable_adaptive_bitrate();

        assert!(!config.adaptive_bitrate);
    }
}
