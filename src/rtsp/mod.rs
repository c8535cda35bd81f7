//! RTSP consumer
//!
//! - [`RtspDistributor`]: the consumer, owning three branches and two
//!   presentations
//! - [`Presentation`]: timestamp rebasing and the viewer endpoint
//! - [`RtspHost`]: the RTSP server boundary, with [`LocalRtspHost`] as the
//!   in-process implementation

pub mod distributor;
pub mod host;
pub mod presentation;

pub use distributor::{normalize_path, RtspConfig, RtspDistributor, RtspState};
pub use host::{AuthRule, ClientId, LocalRtspHost, RtspEvent, RtspEventSink, RtspHost, Viewer};
pub use presentation::{Baseline, EndpointItem, Presentation, PresentationKind, RelaySink};
