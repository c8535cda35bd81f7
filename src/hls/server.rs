//! Segmented live server
//!
//! ```text
//!   DISABLED ──enable──► IDLE ──playlist request──► RUNNING
//!       ▲                 ▲                            │
//!       │                 └──── idle timeout ──────────┘
//!       └──────── disable (stops the pipeline first) ───┘
//! ```
//!
//! Enabling and disabling are split so that binding the listener and
//! removing the segment directory happen without the daemon lock held.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::watch;

use crate::daemon::{Consumer, Context, Notification, TimerKind, TimerSlot};
use crate::error::Result;
use crate::graph::{Branch, BranchId, QueueConfig};
use crate::hls::config::HlsConfig;
use crate::hls::http::HttpServer;
use crate::hls::segmenter::Segmenter;

/// State of the segmented live server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HlsState {
    #[default]
    Disabled,
    /// Listening, no segmenter attached
    Idle,
    Running,
}

impl HlsState {
    pub fn code(&self) -> i32 {
        match self {
            HlsState::Disabled => 0,
            HlsState::Idle => 1,
            HlsState::Running => 2,
        }
    }
}

impl std::fmt::Display for HlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HlsState::Disabled => "DISABLED",
            HlsState::Idle => "IDLE",
            HlsState::Running => "RUNNING",
        })
    }
}

/// The HLS consumer
pub struct SegmentedLiveServer {
    config: HlsConfig,
    state: HlsState,
    enabling: bool,
    http: Option<HttpServer>,
    branch: Option<Branch>,
    first_segment: Option<watch::Receiver<bool>>,
    idle: TimerSlot,
}

impl SegmentedLiveServer {
    pub fn new(config: HlsConfig) -> Self {
        Self {
            config,
            state: HlsState::Disabled,
            enabling: false,
            http: None,
            branch: None,
            first_segment: None,
            idle: TimerSlot::new(TimerKind::HlsIdle),
        }
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    pub fn state(&self) -> HlsState {
        self.state
    }

    /// Address of the HTTP listener while enabled
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|h| h.local_addr())
    }

    pub fn owns(&self, branch: BranchId) -> bool {
        self.branch.as_ref().is_some_and(|b| b.id() == branch)
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.idle.is_armed()
    }

    fn set_state(&mut self, ctx: &Context<'_>, state: HlsState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "hls state");
        self.state = state;
        ctx.notifier.publish(Notification::HlsStateChanged(state));
    }

    /// Claim the server for enabling; returns the directory to prepare
    pub fn begin_enable(&mut self) -> Option<PathBuf> {
        if self.state != HlsState::Disabled || self.enabling {
            tracing::info!(state = %self.state, "hls already enabled");
            return None;
        }
        self.enabling = true;
        Some(self.config.directory.clone())
    }

    /// Complete enabling with the bound listener
    pub fn finish_enable(&mut self, ctx: &Context<'_>, http: io::Result<HttpServer>) -> bool {
        self.enabling = false;
        match http {
            Ok(http) => {
                tracing::info!(
                    addr = %http.local_addr(),
                    playlist = %self.config.playlist_name,
                    directory = %self.config.directory.display(),
                    "hls enabled"
                );
                self.http = Some(http);
                self.set_state(ctx, HlsState::Idle);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to enable hls");
                false
            }
        }
    }

    /// A client asked for the playlist
    ///
    /// Starts the pipeline when idle. Returns a receiver that turns `true`
    /// once the first segment is listed, or `None` if the playlist cannot
    /// be served.
    pub fn on_playlist_request(&mut self, ctx: &mut Context<'_>) -> Option<watch::Receiver<bool>> {
        match self.state {
            HlsState::Disabled => None,
            HlsState::Running => self.first_segment.clone(),
            HlsState::Idle => match self.start_pipeline(ctx) {
                Ok(()) => self.first_segment.clone(),
                Err(e) => {
                    tracing::error!(error = %e, "failed to start hls pipeline");
                    None
                }
            },
        }
    }

    /// Attach a segmenter to the transport junction and go RUNNING
    pub fn start_pipeline(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.source.ensure_muxed()?;
        let transport = ctx.source.transport_junction()?;

        let segmenter = Segmenter::new(self.config.clone());
        let first_segment = segmenter.first_segment();
        let queue = QueueConfig::time_bounded(self.config.queue_time);
        let mut branch = Branch::new("hls", queue, Box::new(segmenter));
        branch.on_notice(ctx.events.notice_handler(Consumer::Hls));

        let attached = branch
            .link(&transport)
            .and_then(|_| branch.play())
            .and_then(|_| ctx.source.play());
        if let Err(e) = attached {
            branch.detach(ctx.events.detached(Consumer::Hls));
            return Err(e);
        }

        self.branch = Some(branch);
        self.first_segment = Some(first_segment);
        self.idle.arm_once(self.config.idle_timeout(), ctx.events);
        self.set_state(ctx, HlsState::Running);
        Ok(())
    }

    /// Detach the segmenter; false if not running
    pub fn stop_pipeline(&mut self, ctx: &Context<'_>) -> bool {
        if self.state != HlsState::Running {
            tracing::info!(state = %self.state, "hls pipeline not running");
            return false;
        }
        self.idle.cancel();
        if let Some(branch) = self.branch.take() {
            branch.detach(ctx.events.detached(Consumer::Hls));
        }
        self.first_segment = None;
        self.set_state(ctx, HlsState::Idle);
        true
    }

    /// A file was served: postpone the idle stop
    pub fn touch(&mut self, ctx: &Context<'_>) {
        if self.state == HlsState::Running {
            self.idle.arm_once(self.config.idle_timeout(), ctx.events);
        }
    }

    pub fn on_idle_timer(&mut self, ctx: &Context<'_>, generation: u64) {
        if self.idle.fired(generation) && self.state == HlsState::Running {
            tracing::info!("hls clients stopped downloading");
            self.stop_pipeline(ctx);
        }
    }

    pub fn on_sink_failed(&mut self, ctx: &Context<'_>, reason: &str) {
        tracing::warn!(reason, "hls segmenter failed");
        self.stop_pipeline(ctx);
    }

    /// Stop serving; returns the directory to remove, `None` if not enabled
    pub fn disable(&mut self, ctx: &Context<'_>) -> Option<PathBuf> {
        if self.state == HlsState::Disabled {
            tracing::info!("hls not enabled");
            return None;
        }
        if self.state == HlsState::Running {
            self.stop_pipeline(ctx);
        }
        if let Some(mut http) = self.http.take() {
            http.shutdown();
        }
        self.set_state(ctx, HlsState::Disabled);
        Some(self.config.directory.clone())
    }
}

impl std::fmt::Debug for SegmentedLiveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedLiveServer")
            .field("state", &self.state)
            .field("addr", &self.local_addr())
            .field("running", &self.branch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::daemon::{ConsumerStates, ControlEvent, EventSender, Notifier};
    use crate::media::SimulatedEngine;
    use crate::source::{SourcePipeline, SourceState};

    async fn next_idle_timer(rx: &mut mpsc::UnboundedReceiver<ControlEvent>) -> u64 {
        loop {
            match rx.recv().await {
                Some(ControlEvent::Timer {
                    kind: TimerKind::HlsIdle,
                    generation,
                }) => return generation,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(HlsState::Disabled.code(), 0);
        assert_eq!(HlsState::Idle.code(), 1);
        assert_eq!(HlsState::Running.code(), 2);
        assert_eq!(HlsState::default(), HlsState::Disabled);
    }

    #[test]
    fn test_enable_claimed_once() {
        let mut server = SegmentedLiveServer::new(HlsConfig::with_directory("/tmp/hls-test"));
        assert_eq!(server.begin_enable(), Some(PathBuf::from("/tmp/hls-test")));
        assert_eq!(server.begin_enable(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_rearmed_by_requests() {
        let mut source = SourcePipeline::new(
            Arc::new(SimulatedEngine::manual()),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );
        source.create().unwrap();
        let notifier = Notifier::new(16);
        let (events, mut rx) = EventSender::channel();
        let mut ctx = Context {
            source: &mut source,
            notifier: &notifier,
            events: &events,
            peers: ConsumerStates::default(),
        };
        let mut server = SegmentedLiveServer::new(HlsConfig::with_directory("/tmp/hls-idle"));

        server.start_pipeline(&mut ctx).unwrap();
        assert_eq!(server.state(), HlsState::Running);
        assert!(server.is_idle_timer_armed());
        assert_eq!(ctx.source.state(), SourceState::Playing);

        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(8)).await;
        server.touch(&ctx);

        let generation = next_idle_timer(&mut rx).await;
        assert!(start.elapsed() >= Duration::from_secs(18));
        server.on_idle_timer(&ctx, generation);

        assert_eq!(server.state(), HlsState::Idle);
        assert!(!server.is_idle_timer_armed());
        // A late expiry of the same timer is ignored
        server.on_idle_timer(&ctx, generation);
        assert_eq!(server.state(), HlsState::Idle);
    }
}
