//! Media samples flowing through the graph
//!
//! A [`Sample`] is one encoded buffer plus the attribute set (caps) that
//! describes it. Samples are cheap to clone: the payload is `Bytes` and the
//! caps are shared behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Which feed a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Encoded audio elementary stream
    Audio,
    /// Encoded video elementary stream
    Video,
    /// Multiplexed transport stream
    Transport,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Transport => "transport",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The whole-set attributes of the video encoder
///
/// The engine only accepts complete replacements of this set, so writers
/// read it, change the requested fields and write it back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Frames per second
    pub framerate: Option<u32>,
    /// Encoding profile name ("main", "high")
    pub profile: Option<String>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

/// Stream description carried alongside every sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    /// Media type, e.g. `video/x-h264` or `video/mpegts`
    pub media_type: String,
    pub attributes: AttributeSet,
}

impl Caps {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            attributes: AttributeSet::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = attributes;
        self
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.media_type)?;
        let a = &self.attributes;
        if let (Some(w), Some(h)) = (a.width, a.height) {
            write!(f, ", width={}, height={}", w, h)?;
        }
        if let Some(fps) = a.framerate {
            write!(f, ", framerate={}/1", fps)?;
        }
        if let Some(ref p) = a.profile {
            write!(f, ", profile={}", p)?;
        }
        Ok(())
    }
}

/// One encoded buffer
#[derive(Debug, Clone)]
pub struct Sample {
    pub stream: StreamKind,
    /// Payload (zero-copy via reference counting)
    pub data: Bytes,
    /// Presentation timestamp
    pub pts: Option<Duration>,
    /// Decode timestamp
    pub dts: Option<Duration>,
    /// Set on buffers that cannot be decoded on their own
    pub delta: bool,
    pub caps: Arc<Caps>,
}

impl Sample {
    /// Create a keyframe sample
    pub fn keyframe(stream: StreamKind, data: Bytes, pts: Duration, caps: Arc<Caps>) -> Self {
        Self {
            stream,
            data,
            pts: Some(pts),
            dts: Some(pts),
            delta: false,
            caps,
        }
    }

    /// Create a delta (non-key) sample
    pub fn delta(stream: StreamKind, data: Bytes, pts: Duration, caps: Arc<Caps>) -> Self {
        Self {
            stream,
            data,
            pts: Some(pts),
            dts: Some(pts),
            delta: true,
            caps,
        }
    }

    pub fn with_dts(mut self, dts: Option<Duration>) -> Self {
        self.dts = dts;
        self
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_keyframe(&self) -> bool {
        !self.delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_display_lists_set_fields_only() {
        let caps = Caps::new("video/x-h264").with_attributes(
            AttributeSet::new()
                .with_resolution(1280, 720)
                .with_profile("main"),
        );
        assert_eq!(
            caps.to_string(),
            "video/x-h264, width=1280, height=720, profile=main"
        );
    }

    #[test]
    fn test_sample_constructors_set_delta_flag() {
        let caps = Arc::new(Caps::new("audio/mpeg"));
        let key = Sample::keyframe(
            StreamKind::Audio,
            Bytes::from_static(b"k"),
            Duration::ZERO,
            caps.clone(),
        );
        let delta = Sample::delta(
            StreamKind::Audio,
            Bytes::from_static(b"d"),
            Duration::from_millis(20),
            caps,
        );
        assert!(key.is_keyframe());
        assert!(!delta.is_keyframe());
        assert_eq!(delta.dts, Some(Duration::from_millis(20)));
    }
}
