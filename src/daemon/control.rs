//! Control loop
//!
//! One task consumes [`ControlEvent`]s and emits the watchdog ping. Each
//! event is handled under the daemon lock.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::daemon::event::{Consumer, ControlEvent, TimerKind};
use crate::daemon::notify::Notification;
use crate::daemon::Shared;
use crate::graph::BranchNotice;
use crate::hls::HlsState;
use crate::media::EngineEvent;
use crate::rtsp::RtspEvent;

pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<ControlEvent>) {
    let period = shared.config.ping_interval;
    let mut ping = time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!("control loop started");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    None => break,
                    Some(ControlEvent::Shutdown) => break,
                    Some(event) => dispatch(&shared, event),
                }
            }
            _ = ping.tick() => shared.notifier.publish(Notification::Ping),
        }
    }
    tracing::info!("control loop stopped");
}

/// Remove an HLS segment directory
pub(crate) async fn remove_directory(directory: PathBuf) {
    match tokio::fs::remove_dir_all(&directory).await {
        Ok(()) => tracing::debug!(directory = %directory.display(), "segment directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(directory = %directory.display(), error = %e, "could not remove segment directory")
        }
    }
}

/// Handle one event
fn dispatch(shared: &Shared, event: ControlEvent) {
    let notifier = &shared.notifier;
    let events = &shared.events;
    let mut core = shared.core.lock();

    match event {
        ControlEvent::Branch {
            consumer: Consumer::Upstream,
            branch,
            notice,
        } => {
            if !core.upstream.owns(branch) {
                tracing::trace!(%branch, ?notice, "stale upstream notice");
                return;
            }
            match notice {
                BranchNotice::Overrun => core.with_upstream(notifier, events, |u, ctx| u.on_overrun(ctx)),
                BranchNotice::Underrun => core.with_upstream(notifier, events, |u, ctx| u.on_underrun(ctx)),
                BranchNotice::SinkFailed(reason) => {
                    core.with_upstream(notifier, events, |u, ctx| u.on_write_failure(ctx, &reason));
                    core.after_write_failure(notifier);
                    return;
                }
            }
            core.coordinate(notifier);
        }
        ControlEvent::Branch {
            consumer: Consumer::Hls,
            branch,
            notice,
        } => {
            if let BranchNotice::SinkFailed(reason) = notice {
                if core.hls.owns(branch) {
                    core.with_hls(notifier, events, |h, ctx| h.on_sink_failed(ctx, &reason));
                    core.coordinate(notifier);
                }
            }
        }
        ControlEvent::Branch {
            consumer: Consumer::Rtsp,
            branch,
            notice,
        } => {
            if let BranchNotice::SinkFailed(reason) = notice {
                tracing::warn!(%branch, reason, "rtsp relay failed");
            }
        }
        ControlEvent::Probe { branch, event } => {
            if core.upstream.owns(branch) {
                core.with_upstream(notifier, events, |u, ctx| u.on_probe(ctx, event));
            }
        }
        ControlEvent::Timer { kind, generation } => {
            match kind {
                TimerKind::HlsIdle => {
                    core.with_hls(notifier, events, |h, ctx| h.on_idle_timer(ctx, generation))
                }
                _ => core.with_upstream(notifier, events, |u, ctx| u.on_timer(ctx, kind, generation)),
            }
            core.coordinate(notifier);
        }
        ControlEvent::Rtsp(event) => {
            core.with_rtsp(notifier, events, |r, ctx| match event {
                RtspEvent::SessionPrepared(kind) => r.on_session_prepared(ctx, kind),
                RtspEvent::SessionUnprepared(kind) => r.on_session_unprepared(ctx, kind),
                RtspEvent::ClientConnected { client, addr } => r.on_client_connected(ctx, client, &addr),
                RtspEvent::ClientClosed(client) => r.on_client_closed(ctx, client),
                RtspEvent::QueryReceived(query) => r.on_query_received(ctx, &query),
            });
            core.coordinate(notifier);
        }
        ControlEvent::Engine(EngineEvent::SignalLost) => {
            tracing::warn!("encoder signal lost");
            notifier.publish(Notification::EncoderSignalLost);
        }
        ControlEvent::Engine(EngineEvent::Error(reason)) => {
            tracing::error!(reason, "encoder error");
            notifier.publish(Notification::EncoderError(reason));
        }
        ControlEvent::Engine(EngineEvent::ReadFailure(reason)) => {
            tracing::error!(reason, "encoder read failure, rebuilding source");
            notifier.publish(Notification::EncoderError(reason));
            core.with_upstream(notifier, events, |u, ctx| u.disable(ctx));
            // HLS restarts on the next playlist request
            core.with_hls(notifier, events, |h, ctx| {
                if h.state() == HlsState::Running {
                    h.stop_pipeline(ctx);
                }
            });
            core.with_rtsp(notifier, events, |r, ctx| r.unlink(ctx));
            core.rebuild_source(notifier);
            core.with_rtsp(notifier, events, |r, ctx| r.relink(ctx));
            core.coordinate(notifier);
        }
        ControlEvent::BranchDetached { consumer, branch } => {
            tracing::debug!(%consumer, %branch, "branch detached");
        }
        ControlEvent::MuxerHalted => {
            tracing::debug!("muxer halted");
            core.sync_source_state(notifier);
        }
        ControlEvent::Shutdown => {}
    }
}
