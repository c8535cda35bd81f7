//! Control surface attributes

use crate::error::{Error, Result};

/// A readable (and possibly writable) attribute of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    AudioBitrate,
    VideoBitrate,
    GopLength,
    GopOnSceneChange,
    OpenGop,
    BFrames,
    PFrames,
    Slices,
    Level,
    Width,
    Height,
    Framerate,
    Profile,
    InputMode,
    AutoBitrate,
    SourceState,
    RtspState,
    HlsState,
    UpstreamState,
    RtspClientCount,
    UriParameters,
    Path,
}

impl Attribute {
    pub const ALL: [Attribute; 22] = [
        Attribute::AudioBitrate,
        Attribute::VideoBitrate,
        Attribute::GopLength,
        Attribute::GopOnSceneChange,
        Attribute::OpenGop,
        Attribute::BFrames,
        Attribute::PFrames,
        Attribute::Slices,
        Attribute::Level,
        Attribute::Width,
        Attribute::Height,
        Attribute::Framerate,
        Attribute::Profile,
        Attribute::InputMode,
        Attribute::AutoBitrate,
        Attribute::SourceState,
        Attribute::RtspState,
        Attribute::HlsState,
        Attribute::UpstreamState,
        Attribute::RtspClientCount,
        Attribute::UriParameters,
        Attribute::Path,
    ];

    /// Name on the control surface
    pub fn name(&self) -> &'static str {
        match self {
            Attribute::AudioBitrate => "audioBitrate",
            Attribute::VideoBitrate => "videoBitrate",
            Attribute::GopLength => "gopLength",
            Attribute::GopOnSceneChange => "gopOnSceneChange",
            Attribute::OpenGop => "openGop",
            Attribute::BFrames => "bFrames",
            Attribute::PFrames => "pFrames",
            Attribute::Slices => "slices",
            Attribute::Level => "level",
            Attribute::Width => "width",
            Attribute::Height => "height",
            Attribute::Framerate => "framerate",
            Attribute::Profile => "profile",
            Attribute::InputMode => "inputMode",
            Attribute::AutoBitrate => "autoBitrate",
            Attribute::SourceState => "sourceState",
            Attribute::RtspState => "rtspState",
            Attribute::HlsState => "hlsState",
            Attribute::UpstreamState => "upstreamState",
            Attribute::RtspClientCount => "rtspClientCount",
            Attribute::UriParameters => "uriParameters",
            Attribute::Path => "path",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name() == name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Attribute::SourceState
                | Attribute::RtspState
                | Attribute::HlsState
                | Attribute::UpstreamState
                | Attribute::RtspClientCount
                | Attribute::UriParameters
                | Attribute::Path
        )
    }

    pub fn is_flag(&self) -> bool {
        matches!(
            self,
            Attribute::GopOnSceneChange | Attribute::OpenGop | Attribute::AutoBitrate
        )
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of an attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl AttributeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Integer value for `attribute`, within `i32`
    pub(crate) fn expect_i32(&self, attribute: Attribute) -> Result<i32> {
        self.as_int()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or(Error::AttributeType {
                name: attribute.name(),
                expected: "a 32-bit integer",
            })
    }

    /// Non-negative integer value for `attribute`
    pub(crate) fn expect_u32(&self, attribute: Attribute) -> Result<u32> {
        self.as_int()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Error::AttributeType {
                name: attribute.name(),
                expected: "a non-negative integer",
            })
    }

    pub(crate) fn expect_bool(&self, attribute: Attribute) -> Result<bool> {
        self.as_bool().ok_or(Error::AttributeType {
            name: attribute.name(),
            expected: "a boolean",
        })
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(v.into())
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Text(v) => f.write_str(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for attribute in Attribute::ALL {
            assert_eq!(Attribute::from_name(attribute.name()).unwrap(), attribute);
        }
    }

    #[test]
    fn test_unknown_attribute() {
        let err = Attribute::from_name("colour").unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute(ref n) if n == "colour"));
    }

    #[test]
    fn test_read_only_attributes() {
        assert!(Attribute::VideoBitrate.is_writable());
        assert!(Attribute::AutoBitrate.is_writable());
        assert!(!Attribute::RtspClientCount.is_writable());
        assert!(!Attribute::Path.is_writable());
    }

    #[test]
    fn test_value_conversions() {
        let v = AttributeValue::Int(-1);
        assert_eq!(v.expect_i32(Attribute::Level).unwrap(), -1);
        assert!(v.expect_u32(Attribute::Width).is_err());
        assert!(AttributeValue::from(true).expect_i32(Attribute::Level).is_err());
        assert_eq!(AttributeValue::from(String::from("x")).as_str(), Some("x"));
    }
}
