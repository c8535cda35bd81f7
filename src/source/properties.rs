//! Encoder property snapshot
//!
//! [`SourceProperties`] is the one authoritative copy of the encoder
//! settings. It is refreshed from the engine on demand, written field by
//! field with read-back, and re-applied to a fresh encoder pair after the
//! source is rebuilt.

use crate::error::ConfigError;

/// Encoding profile
///
/// Communicated as an integer: 1 selects "high", any other value "main".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Main,
    High,
}

impl Profile {
    pub fn from_code(code: i32) -> Self {
        if code == 1 {
            Profile::High
        } else {
            Profile::Main
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Profile::Main => 0,
            Profile::High => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Main => "main",
            Profile::High => "high",
        }
    }

    /// Interpret the profile name found in the encoder's attribute set
    ///
    /// A missing or unknown name falls back to main with a warning.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("high") => Profile::High,
            Some("main") => Profile::Main,
            Some(other) => {
                tracing::warn!(profile = other, "unknown profile in attributes, reporting main");
                Profile::Main
            }
            None => {
                tracing::warn!("profile missing in attributes, reporting main");
                Profile::Main
            }
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture input selection of both encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Live,
    HdmiIn,
    Background,
}

impl InputMode {
    pub fn code(&self) -> i32 {
        match self {
            InputMode::Live => 0,
            InputMode::HdmiIn => 1,
            InputMode::Background => 2,
        }
    }
}

impl TryFrom<i32> for InputMode {
    type Error = ConfigError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InputMode::Live),
            1 => Ok(InputMode::HdmiIn),
            2 => Ok(InputMode::Background),
            other => Err(ConfigError::OutOfRange {
                field: "inputMode",
                value: other as i64,
            }),
        }
    }
}

/// Snapshot of the encoder parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceProperties {
    /// Audio bitrate (kbit/s)
    pub audio_bitrate: i32,
    /// Video bitrate (kbit/s)
    pub video_bitrate: i32,
    pub gop_length: i32,
    pub gop_on_scene_change: bool,
    pub open_gop: bool,
    pub b_frames: i32,
    pub p_frames: i32,
    pub slices: i32,
    pub level: i32,
    pub profile: Profile,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// A field of [`SourceProperties`] as applied to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyField {
    AudioBitrate,
    VideoBitrate,
    GopLength,
    GopOnSceneChange,
    OpenGop,
    BFrames,
    PFrames,
    Slices,
    Level,
    Framerate,
    Resolution,
    Profile,
}

impl PropertyField {
    /// Attribute name used on the control surface
    pub fn name(&self) -> &'static str {
        match self {
            PropertyField::AudioBitrate => "audioBitrate",
            PropertyField::VideoBitrate => "videoBitrate",
            PropertyField::GopLength => "gopLength",
            PropertyField::GopOnSceneChange => "gopOnSceneChange",
            PropertyField::OpenGop => "openGop",
            PropertyField::BFrames => "bFrames",
            PropertyField::PFrames => "pFrames",
            PropertyField::Slices => "slices",
            PropertyField::Level => "level",
            PropertyField::Framerate => "framerate",
            PropertyField::Resolution => "resolution",
            PropertyField::Profile => "profile",
        }
    }
}

/// Per-field outcome of [`SourcePipeline::apply_properties`]
///
/// [`SourcePipeline::apply_properties`]: crate::source::SourcePipeline::apply_properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyReport {
    entries: Vec<(PropertyField, Result<(), ConfigError>)>,
}

impl PropertyReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, field: PropertyField, result: Result<(), ConfigError>) {
        self.entries.push((field, result));
    }

    /// True if every applied field was accepted
    pub fn is_ok(&self) -> bool {
        self.entries.iter().all(|(_, r)| r.is_ok())
    }

    /// Outcome of one field; `None` if it was not applied
    pub fn get(&self, field: PropertyField) -> Option<&Result<(), ConfigError>> {
        self.entries.iter().find(|(f, _)| *f == field).map(|(_, r)| r)
    }

    pub fn applied(&self) -> impl Iterator<Item = PropertyField> + '_ {
        self.entries.iter().map(|(f, _)| *f)
    }

    pub fn failures(&self) -> impl Iterator<Item = (PropertyField, &ConfigError)> + '_ {
        self.entries
            .iter()
            .filter_map(|(f, r)| r.as_ref().err().map(|e| (*f, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_codes() {
        assert_eq!(Profile::from_code(1), Profile::High);
        assert_eq!(Profile::from_code(0), Profile::Main);
        assert_eq!(Profile::from_code(7), Profile::Main);
        assert_eq!(Profile::High.code(), 1);
    }

    #[test]
    fn test_profile_name_fallback() {
        assert_eq!(Profile::from_name(Some("high")), Profile::High);
        assert_eq!(Profile::from_name(None), Profile::Main);
        assert_eq!(Profile::from_name(Some("baseline")), Profile::Main);
    }

    #[test]
    fn test_input_mode_range() {
        assert_eq!(InputMode::try_from(1).unwrap(), InputMode::HdmiIn);
        assert!(InputMode::try_from(3).is_err());
        assert!(InputMode::try_from(-1).is_err());
    }

    #[test]
    fn test_report_collects_failures() {
        let mut report = PropertyReport::new();
        report.record(PropertyField::AudioBitrate, Ok(()));
        report.record(PropertyField::Level, Err(ConfigError::Zero("level")));

        assert!(!report.is_ok());
        assert_eq!(report.get(PropertyField::AudioBitrate), Some(&Ok(())));
        assert_eq!(report.get(PropertyField::Slices), None);
        let failed: Vec<_> = report.failures().map(|(f, _)| f).collect();
        assert_eq!(failed, vec![PropertyField::Level]);
    }
}
