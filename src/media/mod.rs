//! Media types and the engine boundary
//!
//! This module provides:
//! - [`Sample`], the buffer type carried through every junction and branch
//! - the [`MediaEngine`] collaborator traits (encoders and muxer)
//! - [`SimulatedEngine`], an in-process engine used by the daemon binary and tests

pub mod engine;
pub mod sample;
pub mod simulated;

pub use engine::{
    params, EncoderKind, EncoderOutputs, EncoderPair, EngineEvent, EngineEventSink, MediaEngine,
    Muxer, ParamValue, RunState,
};
pub use sample::{AttributeSet, Caps, Sample, StreamKind};
pub use simulated::{SimulatedConfig, SimulatedEngine, SimulatedMuxer, TS_PACKET_SIZE};
