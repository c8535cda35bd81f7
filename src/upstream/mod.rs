//! Congestion-aware TCP upstream
//!
//! - [`UpstreamPusher`]: the consumer state machine
//! - [`OverrunWindow`] and [`reduce_bitrate`]: congestion accounting and
//!   the adaptive bitrate rule
//! - [`Connector`] / [`TcpSink`]: the network side

pub mod config;
pub mod congestion;
pub mod pusher;
pub mod sink;
pub mod state;

pub use config::UpstreamConfig;
pub use congestion::{reduce_bitrate, BitrateDecision, OverrunWindow};
pub use pusher::UpstreamPusher;
pub use sink::{token_bytes, Connector, TcpConnector, TcpSink, UpstreamWriter};
pub use state::UpstreamState;
