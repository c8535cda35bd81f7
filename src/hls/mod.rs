//! HTTP segmented live server
//!
//! - [`SegmentedLiveServer`]: the consumer state machine
//! - [`Segmenter`]: branch sink writing segments and the playlist
//! - [`HttpServer`]: the axum listener serving the segment directory

pub mod config;
pub mod http;
pub mod segmenter;
pub mod server;

pub use config::HlsConfig;
pub use http::{Credentials, HlsControl, HttpServer, HttpState};
pub use segmenter::Segmenter;
pub use server::{HlsState, SegmentedLiveServer};
