//! Daemon configuration

use std::time::Duration;

use crate::hls::HlsConfig;
use crate::rtsp::RtspConfig;
use crate::upstream::UpstreamConfig;

/// Daemon configuration options
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rtsp: RtspConfig,

    pub hls: HlsConfig,

    pub upstream: UpstreamConfig,

    /// Interval of the watchdog ping notification
    pub ping_interval: Duration,

    /// Notifications buffered per slow observer
    pub notify_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rtsp: RtspConfig::default(),
            hls: HlsConfig::default(),
            upstream: UpstreamConfig::default(),
            ping_interval: Duration::from_secs(5),
            notify_capacity: 64,
        }
    }
}

impl DaemonConfig {
    /// Set the RTSP distributor options
    pub fn rtsp(mut self, config: RtspConfig) -> Self {
        self.rtsp = config;
        self
    }

    /// Set the HLS server options
    pub fn hls(mut self, config: HlsConfig) -> Self {
        self.hls = config;
        self
    }

    /// Set the upstream options
    pub fn upstream(mut self, config: UpstreamConfig) -> Self {
        self.upstream = config;
        self
    }

    /// Set the watchdog ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();

        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.rtsp.port, 554);
        assert_eq!(config.hls.playlist_name, "dream.m3u8");
        assert_eq!(config.upstream.queue_buffers, 400);
    }

    #[test]
    fn test_builder_hls() {
        let config = DaemonConfig::default().hls(HlsConfig::with_directory("/srv/hls"));

        assert_eq!(config.hls.directory, std::path::PathBuf::from("/srv/hls"));
    }

    #[test]
    fn test_builder_ping_interval() {
        let config = DaemonConfig::default().ping_interval(Duration::from_secs(1));

        assert_eq!(config.ping_interval, Duration::from_secs(1));
    }
}
