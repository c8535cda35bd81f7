//! Media engine boundary
//!
//! The engine owns the actual encoders and the muxer. This crate only drives
//! them: run-state changes, parameter writes with read-back, whole attribute
//! set replacement, and the events the encoders raise.

use std::sync::Arc;

use crate::error::EngineError;
use crate::graph::Junction;
use crate::media::sample::{AttributeSet, Sample};

/// Encoder parameter names understood by engines
pub mod params {
    pub const BITRATE: &str = "bitrate";
    pub const GOP_LENGTH: &str = "gop-length";
    pub const GOP_SCENE: &str = "gop-scene";
    pub const OPEN_GOP: &str = "open-gop";
    pub const BFRAMES: &str = "bframes";
    pub const PFRAMES: &str = "pframes";
    pub const SLICES: &str = "slices";
    pub const LEVEL: &str = "level";
    pub const INPUT_MODE: &str = "input-mode";
}

/// Run-state of an engine element or of the source pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl RunState {
    /// Numeric code published to observers
    pub fn code(&self) -> i32 {
        match self {
            RunState::Null => 1,
            RunState::Ready => 2,
            RunState::Paused => 3,
            RunState::Playing => 4,
        }
    }
}

/// One of the two encoders of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    Audio,
    Video,
}

/// Value of an encoder parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    Int(i32),
    Bool(bool),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            ParamValue::Int(_) => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Asynchronous notifications raised by the encoders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The capture input lost its signal
    SignalLost,
    /// The encoder can no longer produce data (local encoder loss)
    ReadFailure(String),
    /// Any other fatal encoder error
    Error(String),
}

/// Callback the engine uses to report [`EngineEvent`]s
pub type EngineEventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Fan-out junctions the encoders push their output into
#[derive(Clone)]
pub struct EncoderOutputs {
    pub audio: Arc<Junction>,
    pub video: Arc<Junction>,
}

/// Factory for encoder pairs and muxers
pub trait MediaEngine: Send + Sync {
    /// Create a fresh encoder pair feeding `outputs`
    ///
    /// The pair starts in [`RunState::Ready`].
    fn open(
        &self,
        outputs: EncoderOutputs,
        events: EngineEventSink,
    ) -> Result<Box<dyn EncoderPair>, EngineError>;

    /// Create a transport stream muxer
    fn create_muxer(&self) -> Result<Box<dyn Muxer>, EngineError>;
}

/// A live audio and video encoder
pub trait EncoderPair: Send {
    fn set_run_state(&mut self, state: RunState) -> Result<(), EngineError>;

    fn run_state(&self) -> RunState;

    fn set_parameter(
        &mut self,
        encoder: EncoderKind,
        name: &str,
        value: ParamValue,
    ) -> Result<(), EngineError>;

    fn parameter(&self, encoder: EncoderKind, name: &str) -> Option<ParamValue>;

    /// Current attribute set of the video encoder
    fn attributes(&self) -> Option<AttributeSet>;

    /// Replace the whole attribute set of the video encoder
    fn set_attributes(&mut self, attributes: AttributeSet) -> Result<(), EngineError>;
}

/// Combines audio and video samples into transport stream samples
pub trait Muxer: Send {
    fn mux(&mut self, sample: &Sample) -> Vec<Sample>;
}
