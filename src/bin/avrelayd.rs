//! Distribution daemon running on the simulated engine
//!
//! Run with: cargo run --bin avrelayd -- [OPTIONS]
//!
//! Examples:
//!   avrelayd --rtsp                                  # rtsp://localhost:554/stream
//!   avrelayd --rtsp --rtsp-port 8554 --rtsp-path live
//!   avrelayd --hls --hls-port 8080 --hls-dir /tmp/hls
//!   avrelayd --upstream-host 10.0.0.5 --upstream-port 9000 --token secret
//!
//! The RTSP host is the in-process one, so viewers only exist inside this
//! process. Notifications are logged at debug level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tracing::{debug, info, warn};

use avrelay::daemon::{Daemon, DaemonConfig};
use avrelay::hls::HlsConfig;
use avrelay::media::SimulatedEngine;
use avrelay::rtsp::LocalRtspHost;

#[derive(Parser, Debug)]
#[clap(about, version)]
/// Program arguments
struct Args {
    /// Enable the RTSP distributor
    #[clap(long)]
    rtsp: bool,
    /// RTSP port (0 selects the default)
    #[clap(long, default_value_t = 0)]
    rtsp_port: u16,
    /// Mount path of the muxed presentation
    #[clap(long, default_value = "")]
    rtsp_path: String,
    /// Enable the HLS server
    #[clap(long)]
    hls: bool,
    /// HLS HTTP port
    #[clap(long, default_value_t = 8080)]
    hls_port: u16,
    /// Segment directory
    #[clap(long, default_value = "/tmp/hls")]
    hls_dir: PathBuf,
    /// Push the transport stream to this host
    #[clap(long)]
    upstream_host: Option<String>,
    #[clap(long, default_value_t = 9000)]
    upstream_port: u16,
    /// Token sent ahead of the stream
    #[clap(long, default_value = "")]
    token: String,
    /// Basic auth user for RTSP and HLS
    #[clap(long, default_value = "")]
    user: String,
    #[clap(long, default_value = "")]
    pass: String,
}

fn initialize_logging() -> Result<(), Error> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("avrelay=info,avrelayd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(Error::msg)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    initialize_logging()?;

    let config = DaemonConfig::default().hls(HlsConfig::with_directory(&args.hls_dir));
    let daemon = Daemon::builder(config)
        .engine(Arc::new(SimulatedEngine::default()))
        .rtsp_host(Arc::new(LocalRtspHost::new()))
        .build()?;

    let mut notifications = daemon.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            debug!(signal = notification.name(), ?notification, "notification");
        }
    });
    let control = daemon.spawn()?;

    if args.rtsp && !daemon.enable_rtsp(true, &args.rtsp_path, args.rtsp_port, &args.user, &args.pass).await {
        warn!("could not enable rtsp");
    }
    if args.hls && !daemon.enable_hls(true, args.hls_port, &args.user, &args.pass).await {
        warn!("could not enable hls");
    }
    if let Some(host) = args.upstream_host.as_deref() {
        if !daemon.enable_upstream(true, host, args.upstream_port, &args.token).await {
            warn!(host, port = args.upstream_port, "could not enable upstream");
        }
    }
    info!(states = ?daemon.states(), "daemon running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    daemon.shutdown().await;
    control.await?;
    Ok(())
}
