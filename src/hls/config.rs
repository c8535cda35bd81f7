//! HLS server configuration

use std::path::PathBuf;
use std::time::Duration;

/// Segmented live server configuration options
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Directory holding segments and the playlist (created on enable,
    /// removed on disable)
    pub directory: PathBuf,

    /// Target duration of one segment
    pub segment_duration: Duration,

    /// Segment file name template; `%05d` is replaced by the sequence number
    pub segment_template: String,

    /// Playlist file name, served at `/<playlist_name>`
    pub playlist_name: String,

    /// Segments listed in the playlist
    pub playlist_length: usize,

    /// Segment files kept on disk
    pub max_files: usize,

    /// Segment durations without a request before the pipeline stops
    pub idle_segments: u32,

    /// Time bound of the branch queue (leaky)
    pub queue_time: Duration,

    /// Basic-auth realm announced to clients
    pub realm: String,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/hls"),
            segment_duration: Duration::from_secs(2),
            segment_template: "segment%05d.ts".into(),
            playlist_name: "dream.m3u8".into(),
            playlist_length: 5,
            max_files: 10,
            idle_segments: 5,
            queue_time: Duration::from_secs(5),
            realm: "HLS Server".into(),
        }
    }
}

impl HlsConfig {
    /// Create a config writing into `directory`
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Set the segment target duration
    pub fn segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration;
        self
    }

    /// Set the playlist file name
    pub fn playlist_name(mut self, name: impl Into<String>) -> Self {
        self.playlist_name = name.into();
        self
    }

    /// Set how many segment files stay on disk
    pub fn max_files(mut self, max: usize) -> Self {
        self.max_files = max.max(1);
        self
    }

    /// Time without requests after which the pipeline is stopped
    pub fn idle_timeout(&self) -> Duration {
        self.segment_duration * self.idle_segments
    }

    /// File name of segment `sequence`
    pub fn segment_name(&self, sequence: u64) -> String {
        self.segment_template
            .replace("%05d", &format!("{:05}", sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HlsConfig::default();
        assert_eq!(config.directory, PathBuf::from("/tmp/hls"));
        assert_eq!(config.playlist_name, "dream.m3u8");
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_segment_name() {
        let config = HlsConfig::default();
        assert_eq!(config.segment_name(0), "segment00000.ts");
        assert_eq!(config.segment_name(123), "segment00123.ts");
    }

    #[test]
    fn test_builder_pattern() {
        let config = HlsConfig::with_directory("/var/hls")
            .segment_duration(Duration::from_secs(4))
            .max_files(0);
        assert_eq!(config.directory, PathBuf::from("/var/hls"));
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
        assert_eq!(config.max_files, 1);
    }
}
