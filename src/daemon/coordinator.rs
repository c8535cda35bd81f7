//! Activation coordination
//!
//! [`Core`] is everything guarded by the daemon lock: the source pipeline
//! and the three consumers. Consumers never touch each other; each
//! transition runs with a [`Context`] lending it the source, the notifier,
//! the event sender and a snapshot of its peers' states. After every
//! transition the coordinator re-evaluates
//!
//! ```text
//!   in_use = rtsp == RUNNING || hls == RUNNING || upstream >= CONNECTING
//! ```
//!
//! and halts the source when nobody uses it. Disabling the last enabled
//! consumer destroys and recreates the pipeline instead.

use crate::daemon::event::EventSender;
use crate::daemon::notify::{Notification, Notifier};
use crate::hls::{HlsState, SegmentedLiveServer};
use crate::rtsp::{RtspDistributor, RtspState};
use crate::source::{SourcePipeline, SourceState};
use crate::upstream::{UpstreamPusher, UpstreamState};

/// Snapshot of the three consumer states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStates {
    pub rtsp: RtspState,
    pub hls: HlsState,
    pub upstream: UpstreamState,
}

impl ConsumerStates {
    /// Whether any consumer needs the source running
    pub fn source_in_use(&self) -> bool {
        self.rtsp == RtspState::Running
            || self.hls == HlsState::Running
            || self.upstream.is_enabled()
    }

    pub fn all_disabled(&self) -> bool {
        self.rtsp == RtspState::Disabled
            && self.hls == HlsState::Disabled
            && self.upstream == UpstreamState::Disabled
    }

    /// The encoders may be paused: no viewer is rendering
    pub fn source_pausable(&self) -> bool {
        self.rtsp != RtspState::Running && self.hls != HlsState::Running
    }
}

/// What a consumer transition may use besides its own state
pub struct Context<'a> {
    pub source: &'a mut SourcePipeline,
    pub notifier: &'a Notifier,
    pub events: &'a EventSender,
    pub peers: ConsumerStates,
}

/// State guarded by the daemon lock
pub(crate) struct Core {
    pub source: SourcePipeline,
    pub rtsp: RtspDistributor,
    pub hls: SegmentedLiveServer,
    pub upstream: UpstreamPusher,
    last_source_state: SourceState,
}

impl Core {
    pub fn new(
        source: SourcePipeline,
        rtsp: RtspDistributor,
        hls: SegmentedLiveServer,
        upstream: UpstreamPusher,
    ) -> Self {
        Self {
            last_source_state: source.state(),
            source,
            rtsp,
            hls,
            upstream,
        }
    }

    pub fn states(&self) -> ConsumerStates {
        ConsumerStates {
            rtsp: self.rtsp.state(),
            hls: self.hls.state(),
            upstream: self.upstream.state(),
        }
    }

    pub fn with_rtsp<R>(
        &mut self,
        notifier: &Notifier,
        events: &EventSender,
        f: impl FnOnce(&mut RtspDistributor, &mut Context<'_>) -> R,
    ) -> R {
        let mut ctx = Context {
            peers: self.states(),
            source: &mut self.source,
            notifier,
            events,
        };
        f(&mut self.rtsp, &mut ctx)
    }

    pub fn with_hls<R>(
        &mut self,
        notifier: &Notifier,
        events: &EventSender,
        f: impl FnOnce(&mut SegmentedLiveServer, &mut Context<'_>) -> R,
    ) -> R {
        let mut ctx = Context {
            peers: self.states(),
            source: &mut self.source,
            notifier,
            events,
        };
        f(&mut self.hls, &mut ctx)
    }

    pub fn with_upstream<R>(
        &mut self,
        notifier: &Notifier,
        events: &EventSender,
        f: impl FnOnce(&mut UpstreamPusher, &mut Context<'_>) -> R,
    ) -> R {
        let mut ctx = Context {
            peers: self.states(),
            source: &mut self.source,
            notifier,
            events,
        };
        f(&mut self.upstream, &mut ctx)
    }

    /// Halt the source if no consumer uses it
    pub fn coordinate(&mut self, notifier: &Notifier) {
        let states = self.states();
        let idle = self.source.state() == SourceState::Ready && !self.source.is_muxed();
        if !states.source_in_use() && self.source.is_present() && !idle {
            tracing::info!(?states, "source no longer in use");
            if let Err(e) = self.source.halt() {
                tracing::warn!(error = %e, "failed to halt source");
            }
        }
        self.sync_source_state(notifier);
    }

    /// Follow-up of a successful consumer disable
    pub fn after_disable(&mut self, notifier: &Notifier) {
        if self.states().all_disabled() {
            tracing::info!("last consumer disabled, rebuilding source pipeline");
            self.rebuild_source(notifier);
        } else {
            self.coordinate(notifier);
        }
    }

    /// Follow-up of an upstream write failure
    ///
    /// The encoders are not trusted after the peer vanished mid-write, so the
    /// pipeline is recreated unless RTSP or a running HLS branch still feeds
    /// from it.
    pub fn after_write_failure(&mut self, notifier: &Notifier) {
        let states = self.states();
        if states.rtsp == RtspState::Disabled && states.hls != HlsState::Running {
            tracing::info!(?states, "rebuilding source pipeline after write failure");
            self.rebuild_source(notifier);
        } else {
            self.coordinate(notifier);
        }
    }

    /// Destroy and recreate the encoder pair
    pub fn rebuild_source(&mut self, notifier: &Notifier) {
        self.source.destroy();
        self.sync_source_state(notifier);
        if let Err(e) = self.source.create() {
            tracing::error!(error = %e, "failed to recreate source pipeline");
        }
        self.sync_source_state(notifier);
    }

    /// Publish the source state if it changed since the last call
    pub fn sync_source_state(&mut self, notifier: &Notifier) {
        let state = self.source.state();
        if state != self.last_source_state {
            tracing::debug!(from = %self.last_source_state, to = %state, "source state");
            self.last_source_state = state;
            notifier.publish(Notification::SourceStateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_rtsp_does_not_keep_source() {
        let states = ConsumerStates {
            rtsp: RtspState::Idle,
            hls: HlsState::Idle,
            upstream: UpstreamState::Disabled,
        };
        assert!(!states.source_in_use());
        assert!(!states.all_disabled());
        assert!(states.source_pausable());
    }

    #[test]
    fn test_upstream_keeps_source_in_any_enabled_state() {
        for upstream in [
            UpstreamState::Connecting,
            UpstreamState::Waiting,
            UpstreamState::Transmitting,
            UpstreamState::Overload,
            UpstreamState::Adjusting,
        ] {
            let states = ConsumerStates {
                upstream,
                ..Default::default()
            };
            assert!(states.source_in_use(), "{}", upstream);
        }
    }

    #[test]
    fn test_running_viewer_blocks_pause() {
        let states = ConsumerStates {
            hls: HlsState::Running,
            upstream: UpstreamState::Transmitting,
            ..Default::default()
        };
        assert!(!states.source_pausable());
        assert!(ConsumerStates::default().all_disabled());
    }
}
