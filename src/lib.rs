//! Control plane for a live audio/video distribution daemon.
//!
//! One encoded source (an external [`media::MediaEngine`]) feeds up to three
//! independently toggleable consumers:
//!
//! - [`rtsp::RtspDistributor`]: an elementary-stream and a muxed presentation
//!   served to any number of RTSP viewers, with per-presentation timestamp
//!   rebasing
//! - [`hls::SegmentedLiveServer`]: transport stream cut into segments and
//!   served over HTTP, stopped again when clients go quiet
//! - [`upstream::UpstreamPusher`]: transport stream pushed to one TCP peer
//!   with congestion detection and adaptive bitrate
//!
//! # Architecture
//!
//! ```text
//!   MediaEngine ──► audio Junction ──┬──► RTSP ES audio branch
//!               │                    └──► Muxer ──┐
//!               └► video Junction ──┬──► RTSP ES video branch
//!                                   └──► Muxer ──┴─► transport Junction
//!                                                       ├──► RTSP TS branch
//!                                                       ├──► HLS branch
//!                                                       └──► upstream branch
//! ```
//!
//! Every branch is a bounded queue plus a terminal sink. Branches are
//! attached while data is flowing and detached through a quiescence barrier
//! (see [`graph`]). The [`daemon::Daemon`] aggregate owns all consumers behind
//! a single coarse lock and runs the control loop that services timers, queue
//! signals and collaborator events.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use avrelay::daemon::{Daemon, DaemonConfig};
//! use avrelay::media::SimulatedEngine;
//! use avrelay::rtsp::LocalRtspHost;
//!
//! #[tokio::main]
//! async fn main() -> avrelay::Result<()> {
//!     let daemon = Daemon::builder(DaemonConfig::default())
//!         .engine(Arc::new(SimulatedEngine::default()))
//!         .rtsp_host(Arc::new(LocalRtspHost::new()))
//!         .build()?;
//!
//!     let control = daemon.spawn()?;
//!     daemon.enable_rtsp(true, "", 0, "", "").await;
//!     daemon.enable_upstream(true, "127.0.0.1", 9000, "").await;
//!
//!     control.await.ok();
//!     Ok(())
//! }
//! ```

pub mod daemon;
pub mod error;
pub mod graph;
pub mod hls;
pub mod media;
pub mod rtsp;
pub mod source;
pub mod stats;
pub mod upstream;

pub use daemon::{Daemon, DaemonConfig, Notification};
pub use error::{Error, Result};
