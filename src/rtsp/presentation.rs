//! Viewer-facing presentations
//!
//! A [`Presentation`] is what an RTSP mount serves. Branch sinks relay
//! samples into it; viewers subscribe to its endpoint. Each presentation
//! rebases timestamps against its own baseline:
//!
//! ```text
//!   baseline unset:  delta ──► drop
//!                    keyframe ──► baseline = (pts, dts), forward as 0
//!   baseline set:    pts' = max(0, pts - base_pts)
//!                    dts' = max(0, dts - base_dts)
//! ```
//!
//! Nothing is relayed while the presentation is inactive or has no viewer.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::graph::BranchSink;
use crate::media::{Caps, Sample, StreamKind};

/// Which of the two presentations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationKind {
    /// Separate audio and video elementary streams
    Elementary,
    /// The muxed transport stream
    Muxed,
}

impl std::fmt::Display for PresentationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PresentationKind::Elementary => "es",
            PresentationKind::Muxed => "ts",
        })
    }
}

/// What a viewer receives from a presentation endpoint
#[derive(Debug, Clone)]
pub enum EndpointItem {
    /// New caps for a stream, sent before the first sample that carries them
    Caps(StreamKind, Arc<Caps>),
    Sample(Sample),
}

/// Timestamps of the keyframe that started the presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
    pub pts: Option<Duration>,
    pub dts: Option<Duration>,
}

#[derive(Default)]
struct RelayState {
    active: bool,
    baseline: Option<Baseline>,
    caps: HashMap<StreamKind, Arc<Caps>>,
}

/// One RTSP presentation
pub struct Presentation {
    kind: PresentationKind,
    endpoint: broadcast::Sender<EndpointItem>,
    relay: Mutex<RelayState>,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

impl Presentation {
    /// Create a new, inactive presentation
    pub fn new(kind: PresentationKind, capacity: usize) -> Arc<Self> {
        let (endpoint, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            kind,
            endpoint,
            relay: Mutex::new(RelayState::default()),
            relayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn kind(&self) -> PresentationKind {
        self.kind
    }

    /// Attach a viewer to the endpoint
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointItem> {
        self.endpoint.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.endpoint.receiver_count()
    }

    /// Start relaying with an unset baseline
    pub fn activate(&self) {
        let mut relay = self.relay.lock();
        relay.active = true;
        relay.baseline = None;
        relay.caps.clear();
        tracing::debug!(presentation = %self.kind, "presentation active");
    }

    pub fn deactivate(&self) {
        let mut relay = self.relay.lock();
        relay.active = false;
        relay.baseline = None;
        tracing::debug!(presentation = %self.kind, "presentation inactive");
    }

    pub fn is_active(&self) -> bool {
        self.relay.lock().active
    }

    pub fn baseline(&self) -> Option<Baseline> {
        self.relay.lock().baseline
    }

    /// Samples forwarded to the endpoint
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Samples dropped by the relay rule
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Apply the relay rule to `sample`; returns the forwarded sample
    pub fn relay(&self, sample: &Sample) -> Option<Sample> {
        if self.viewer_count() == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut relay = self.relay.lock();
        if !relay.active {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let baseline = match relay.baseline {
            Some(baseline) => baseline,
            None => {
                let may_start = match self.kind {
                    PresentationKind::Elementary => sample.stream == StreamKind::Video,
                    PresentationKind::Muxed => true,
                };
                if sample.delta || !may_start {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                let baseline = Baseline {
                    pts: sample.pts,
                    dts: sample.dts,
                };
                tracing::debug!(presentation = %self.kind, ?baseline, "timestamp baseline set");
                relay.baseline = Some(baseline);
                baseline
            }
        };

        let mut out = sample.clone();
        out.pts = rebase(sample.pts, baseline.pts);
        out.dts = rebase(sample.dts, baseline.dts);

        let caps_changed = relay
            .caps
            .get(&sample.stream)
            .map_or(true, |caps| **caps != *sample.caps);
        if caps_changed {
            relay.caps.insert(sample.stream, Arc::clone(&sample.caps));
            tracing::debug!(presentation = %self.kind, caps = %sample.caps, "caps changed");
            let _ = self
                .endpoint
                .send(EndpointItem::Caps(sample.stream, Arc::clone(&sample.caps)));
        }
        let _ = self.endpoint.send(EndpointItem::Sample(out.clone()));
        self.relayed.fetch_add(1, Ordering::Relaxed);
        Some(out)
    }
}

impl std::fmt::Debug for Presentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presentation")
            .field("kind", &self.kind)
            .field("viewers", &self.viewer_count())
            .field("relayed", &self.relayed())
            .finish()
    }
}

fn rebase(ts: Option<Duration>, base: Option<Duration>) -> Option<Duration> {
    match (ts, base) {
        (Some(ts), Some(base)) => Some(ts.saturating_sub(base)),
        (ts, _) => ts,
    }
}

/// Branch sink feeding a presentation
pub struct RelaySink {
    presentation: Arc<Presentation>,
}

impl RelaySink {
    pub fn new(presentation: Arc<Presentation>) -> Self {
        Self { presentation }
    }
}

#[async_trait]
impl BranchSink for RelaySink {
    async fn render(&mut self, sample: &Sample) -> io::Result<()> {
        self.presentation.relay(sample);
        Ok(())
    }
}
