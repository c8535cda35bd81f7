//! Control loop events
//!
//! Everything that happens outside a control API call reaches the daemon as
//! a [`ControlEvent`]: queue signals and sink failures raised on data-flow
//! threads, probe results, barrier completions, timer expiries, RTSP host
//! callbacks and engine events. Each event carries just enough identity
//! (consumer, branch id, timer generation) for the handler to look up the
//! authoritative state and discard stale events.

use tokio::sync::mpsc;

use crate::graph::{BranchId, BranchNotice, NoticeHandler};
use crate::media::EngineEvent;
use crate::rtsp::RtspEvent;
use crate::stats::Measurement;

/// The three consumers of the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumer {
    Rtsp,
    Hls,
    Upstream,
}

impl std::fmt::Display for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Consumer::Rtsp => "rtsp",
            Consumer::Hls => "hls",
            Consumer::Upstream => "upstream",
        })
    }
}

/// Purpose of a control timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fallback from an overrun to WAITING when no data flows
    UpstreamWaiting,
    /// Periodic keepalive while WAITING
    UpstreamKeepalive,
    /// Retry transmission after OVERLOAD or a bitrate adjustment
    UpstreamResume,
    /// No HTTP request seen for a while
    HlsIdle,
}

/// Result of a probe on the upstream sink edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// The cancel-if-data-flows probe saw a buffer
    DataFlowing,
    /// A throughput window closed
    Bitrate(Measurement),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A branch raised a queue signal or its sink failed
    Branch {
        consumer: Consumer,
        branch: BranchId,
        notice: BranchNotice,
    },
    /// A probe on the upstream branch fired
    Probe { branch: BranchId, event: ProbeEvent },
    Timer { kind: TimerKind, generation: u64 },
    Rtsp(RtspEvent),
    Engine(EngineEvent),
    /// A detach barrier completed and the branch is gone
    BranchDetached { consumer: Consumer, branch: BranchId },
    /// The muxer stage was removed
    MuxerHalted,
    Shutdown,
}

/// Sending half of the control loop channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event; callable from any thread
    pub fn post(&self, event: ControlEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("control loop is gone, event dropped");
        }
    }

    /// Notice handler forwarding branch notices of `consumer`
    pub fn notice_handler(&self, consumer: Consumer) -> NoticeHandler {
        let events = self.clone();
        std::sync::Arc::new(move |branch, notice| {
            events.post(ControlEvent::Branch {
                consumer,
                branch,
                notice,
            })
        })
    }

    /// Completion callback for [`Branch::detach`](crate::graph::Branch::detach)
    pub fn detached(&self, consumer: Consumer) -> impl FnOnce(BranchId) + Send + 'static {
        let events = self.clone();
        move |branch| events.post(ControlEvent::BranchDetached { consumer, branch })
    }
}
