//! The encoded source shared by every consumer
//!
//! - [`SourcePipeline`]: encoder pair, fan-out junctions and the on-demand muxer
//! - [`SourceProperties`]: the authoritative encoder settings snapshot

pub mod pipeline;
pub mod properties;

pub use pipeline::{HaltCallback, SourcePipeline, SourceState};
pub use properties::{InputMode, Profile, PropertyField, PropertyReport, SourceProperties};
