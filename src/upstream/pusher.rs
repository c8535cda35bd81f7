//! Congestion-aware TCP push of the transport stream
//!
//! The pusher owns one branch on the transport junction: a 400-buffer leaky
//! queue drained into a [`TcpSink`]. Queue overruns are the congestion
//! signal; underruns mean the peer keeps up again. All transitions run on
//! the control loop under the daemon lock, driven by [`ControlEvent`]s that
//! carry the branch id so events of a replaced branch are ignored.
//!
//! [`ControlEvent`]: crate::daemon::ControlEvent

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::daemon::{Consumer, Context, ControlEvent, Notification, ProbeEvent, TimerKind, TimerSlot};
use crate::error::Result;
use crate::graph::{Branch, BranchId, ProbeId, ProbeReturn, QueueConfig};
use crate::media::EncoderKind;
use crate::rtsp::RtspState;
use crate::stats::{BitrateMeter, Measurement, UpstreamStats};
use crate::upstream::config::UpstreamConfig;
use crate::upstream::congestion::{reduce_bitrate, OverrunWindow};
use crate::upstream::sink::{keepalive_packet, token_bytes, TcpSink, UpstreamWriter};
use crate::upstream::state::UpstreamState;

/// TCP push consumer
pub struct UpstreamPusher {
    config: UpstreamConfig,
    state: UpstreamState,
    adaptive: bool,
    branch: Option<Branch>,
    /// Peer of the current connection, for logging
    peer: String,
    /// Ticket of the connect in flight; bumped by every enable and disable
    connection: u64,
    window: OverrunWindow,
    meter: Arc<Mutex<BitrateMeter>>,
    cancel_probe: Option<ProbeId>,
    bitrate_probe: Option<ProbeId>,
    waiting: TimerSlot,
    keepalive: TimerSlot,
    resume: TimerSlot,
    keepalives: u64,
    adjustments: u64,
}

impl UpstreamPusher {
    /// Create a new, disabled pusher
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            adaptive: config.adaptive_bitrate,
            window: OverrunWindow::new(config.max_overruns, config.overrun_window),
            meter: Arc::new(Mutex::new(BitrateMeter::new(config.bitrate_period))),
            config,
            state: UpstreamState::Disabled,
            branch: None,
            peer: String::new(),
            connection: 0,
            cancel_probe: None,
            bitrate_probe: None,
            waiting: TimerSlot::new(TimerKind::UpstreamWaiting),
            keepalive: TimerSlot::new(TimerKind::UpstreamKeepalive),
            resume: TimerSlot::new(TimerKind::UpstreamResume),
            keepalives: 0,
            adjustments: 0,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch.as_ref().map(|b| b.id())
    }

    /// Whether events tagged with `branch` belong to the live branch
    pub fn owns(&self, branch: BranchId) -> bool {
        self.branch_id() == Some(branch)
    }

    pub fn adaptive_bitrate(&self) -> bool {
        self.adaptive
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::UpstreamWaiting => self.waiting.is_armed(),
            TimerKind::UpstreamKeepalive => self.keepalive.is_armed(),
            TimerKind::UpstreamResume => self.resume.is_armed(),
            TimerKind::HlsIdle => false,
        }
    }

    pub fn stats(&self) -> UpstreamStats {
        let branch = self.branch.as_ref().map(|b| b.stats()).unwrap_or_default();
        UpstreamStats {
            overruns: self.window.count(),
            keepalives: self.keepalives,
            adjustments: self.adjustments,
            average_bitrate: self.meter.lock().average(),
            bytes_sent: branch.bytes + branch.injected,
            leaked: branch.leaked,
        }
    }

    fn set_state(&mut self, ctx: &Context<'_>, state: UpstreamState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, peer = %self.peer, "upstream state");
        self.state = state;
        ctx.notifier.publish(Notification::UpstreamStateChanged(state));
    }

    /// First half of enabling: claim the pusher and announce CONNECTING
    ///
    /// The connection itself is made by the caller without holding the lock.
    /// The returned ticket must be handed to [`finish_enable`](Self::finish_enable).
    pub fn begin_enable(&mut self, ctx: &Context<'_>, host: &str, port: u16) -> Option<u64> {
        if self.state != UpstreamState::Disabled {
            tracing::info!(state = %self.state, "upstream already enabled");
            return None;
        }
        self.connection += 1;
        self.peer = format!("{}:{}", host, port);
        self.window.reset();
        self.set_state(ctx, UpstreamState::Connecting);
        Some(self.connection)
    }

    /// Second half of enabling, with the outcome of the connect
    ///
    /// A connection whose ticket was superseded by a disable or a later
    /// enable is dropped.
    pub fn finish_enable(
        &mut self,
        ctx: &mut Context<'_>,
        ticket: u64,
        connection: io::Result<UpstreamWriter>,
        token: &str,
    ) -> bool {
        let current = ticket == self.connection && self.state == UpstreamState::Connecting;
        if !current || self.branch.is_some() {
            tracing::info!(
                ticket,
                latest = self.connection,
                state = %self.state,
                "upstream connection superseded"
            );
            drop(connection);
            return false;
        }
        let writer = match connection {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "upstream connection refused");
                self.set_state(ctx, UpstreamState::Disabled);
                return false;
            }
        };
        if let Err(e) = self.build_branch(ctx, writer, token) {
            tracing::error!(peer = %self.peer, error = %e, "failed to build upstream branch");
            if let Some(branch) = self.branch.take() {
                branch.detach(ctx.events.detached(Consumer::Upstream));
            }
            self.set_state(ctx, UpstreamState::Disabled);
            return false;
        }
        tracing::info!(peer = %self.peer, token = !token.is_empty(), "upstream enabled");
        true
    }

    fn build_branch(&mut self, ctx: &mut Context<'_>, writer: UpstreamWriter, token: &str) -> Result<()> {
        ctx.source.ensure_muxed()?;
        let transport = ctx.source.transport_junction()?;

        let sink = TcpSink::new(writer, self.config.block_size);
        let queue = QueueConfig::count_bounded(self.config.queue_buffers);
        let mut branch = Branch::new("upstream", queue, Box::new(sink));
        branch.on_notice(ctx.events.notice_handler(Consumer::Upstream));

        if !token.is_empty() {
            let token = token_bytes(token, self.config.token_len);
            branch.probes().add(move |_, cx| {
                cx.inject(token.clone());
                ProbeReturn::Remove
            });
        }
        branch.set_max_lateness(Some(self.config.max_lateness));
        branch.queue().arm_overrun(true);

        // Keep the half-built branch around so a failure below detaches it
        self.branch = Some(branch);
        if let Some(branch) = self.branch.as_mut() {
            branch.link(&transport)?;
            branch.play()?;
        }
        ctx.source.play()?;
        Ok(())
    }

    /// Tear the pusher down; false if it was not enabled
    pub fn disable(&mut self, ctx: &Context<'_>) -> bool {
        if !self.state.is_enabled() {
            tracing::info!("upstream not enabled");
            return false;
        }
        self.connection += 1;
        self.waiting.cancel();
        self.keepalive.cancel();
        self.resume.cancel();
        if let Some(branch) = self.branch.take() {
            branch.queue().disarm();
            branch.probes().clear();
            branch.detach(ctx.events.detached(Consumer::Upstream));
        }
        self.cancel_probe = None;
        self.bitrate_probe = None;
        self.window.reset();
        self.set_state(ctx, UpstreamState::Disabled);
        true
    }

    /// The sink failed writing: the peer is gone
    pub fn on_write_failure(&mut self, ctx: &Context<'_>, reason: &str) {
        tracing::warn!(peer = %self.peer, reason, "upstream write failure");
        ctx.notifier
            .publish(Notification::UpstreamStateChanged(UpstreamState::Failed));
        self.disable(ctx);
    }

    pub fn on_overrun(&mut self, ctx: &mut Context<'_>) {
        let Some(queue) = self.branch.as_ref().map(|b| Arc::clone(b.queue())) else {
            return;
        };
        let now = Instant::now();
        match self.state {
            UpstreamState::Connecting => {
                queue.arm_overrun(false);
                self.enter_waiting(ctx);
            }
            UpstreamState::Transmitting => {
                if self.waiting.is_armed() {
                    // Re-armed by the data flow probe
                    queue.arm_overrun(false);
                    return;
                }
                if !self.window.record(now) {
                    tracing::debug!(overruns = self.window.count(), "upstream overrun");
                    self.install_cancel_probe(ctx);
                    self.waiting.arm_once(self.config.waiting_timeout, ctx.events);
                } else if self.adaptive {
                    self.set_state(ctx, UpstreamState::Adjusting);
                    self.adjust_bitrate(ctx, now);
                } else {
                    self.set_state(ctx, UpstreamState::Overload);
                    self.waiting.cancel();
                    self.resume.arm_once(self.config.resume_delay, ctx.events);
                }
            }
            UpstreamState::Overload => {
                self.window.bump();
                tracing::debug!(overruns = self.window.count(), "overrun while overloaded");
                self.resume.arm_once(self.config.resume_delay, ctx.events);
            }
            UpstreamState::Adjusting => {
                if self.window.record_adjusting(now, self.config.adjust_grace) {
                    self.adjust_bitrate(ctx, now);
                }
            }
            state => tracing::trace!(%state, "overrun ignored"),
        }
    }

    pub fn on_underrun(&mut self, ctx: &mut Context<'_>) {
        if self.state != UpstreamState::Waiting || ctx.peers.rtsp == RtspState::Running {
            return;
        }
        if let Err(e) = ctx.source.resume() {
            tracing::warn!(error = %e, "could not resume source for upstream");
            return;
        }
        let Some(branch) = self.branch.as_ref() else {
            return;
        };
        branch.set_max_lateness(None);
        branch.queue().arm_underrun(false);
        branch.queue().arm_overrun(true);
        self.keepalive.cancel();

        if self.bitrate_probe.is_none() {
            let meter = Arc::clone(&self.meter);
            let events = ctx.events.clone();
            let id = branch.id();
            self.bitrate_probe = Some(branch.probes().add(move |sample, _| {
                let measurement = meter.lock().record(sample.size(), Instant::now());
                if let Some(m) = measurement {
                    events.post(ControlEvent::Probe {
                        branch: id,
                        event: ProbeEvent::Bitrate(m),
                    });
                }
                ProbeReturn::Keep
            }));
        }
        let now = Instant::now();
        self.meter.lock().reset(now);
        self.window.mark_start(now);
        self.set_state(ctx, UpstreamState::Transmitting);
    }

    pub fn on_probe(&mut self, ctx: &Context<'_>, event: ProbeEvent) {
        match event {
            ProbeEvent::DataFlowing => self.on_data_flowing(),
            ProbeEvent::Bitrate(m) => self.on_bitrate(ctx, m),
        }
    }

    fn on_data_flowing(&mut self) {
        if self.state != UpstreamState::Transmitting {
            return;
        }
        let (Some(id), Some(branch)) = (self.cancel_probe.take(), self.branch.as_ref()) else {
            return;
        };
        branch.probes().remove(id);
        tracing::debug!("data flow restored, waiting cancelled");
        self.waiting.cancel();
        self.keepalive.cancel();
        branch.queue().arm_overrun(true);
    }

    fn on_bitrate(&mut self, ctx: &Context<'_>, m: Measurement) {
        if self.bitrate_probe.is_none() {
            return;
        }
        tracing::debug!(bitrate = m.bitrate, average = m.average, "upstream throughput");
        ctx.notifier.publish(Notification::TcpBitrate(m.bitrate));
    }

    pub fn on_timer(&mut self, ctx: &mut Context<'_>, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::UpstreamWaiting => {
                if self.waiting.fired(generation) && self.state == UpstreamState::Transmitting {
                    tracing::info!("no data flow after overrun");
                    self.enter_waiting(ctx);
                }
            }
            TimerKind::UpstreamKeepalive => {
                if self.keepalive.fired(generation) && self.state == UpstreamState::Waiting {
                    self.send_keepalive();
                }
            }
            TimerKind::UpstreamResume => {
                if self.resume.fired(generation)
                    && matches!(self.state, UpstreamState::Overload | UpstreamState::Adjusting)
                {
                    self.resume_transmitting(ctx);
                }
            }
            TimerKind::HlsIdle => {}
        }
    }

    /// Switch adaptive bitrate; leaving OVERLOAD immediately when set
    pub fn set_adaptive_bitrate(&mut self, ctx: &Context<'_>, adaptive: bool) {
        self.adaptive = adaptive;
        tracing::info!(adaptive, "adaptive bitrate");
        if self.state == UpstreamState::Overload {
            self.resume.cancel();
            self.resume_transmitting(ctx);
        }
    }

    fn install_cancel_probe(&mut self, ctx: &Context<'_>) {
        let Some(branch) = self.branch.as_ref() else {
            return;
        };
        if let Some(old) = self.cancel_probe.take() {
            branch.probes().remove(old);
        }
        let events = ctx.events.clone();
        let id = branch.id();
        self.cancel_probe = Some(branch.probes().add(move |_, _| {
            events.post(ControlEvent::Probe {
                branch: id,
                event: ProbeEvent::DataFlowing,
            });
            ProbeReturn::Remove
        }));
    }

    fn enter_waiting(&mut self, ctx: &mut Context<'_>) {
        self.window.reset();
        if let Some(branch) = self.branch.as_ref() {
            branch.set_max_lateness(Some(self.config.waiting_lateness));
            for probe in [self.cancel_probe.take(), self.bitrate_probe.take()].into_iter().flatten() {
                branch.probes().remove(probe);
            }
        }
        self.set_state(ctx, UpstreamState::Waiting);
        ctx.notifier.publish(Notification::TcpBitrate(0));
        if ctx.peers.source_pausable() {
            if let Err(e) = ctx.source.pause() {
                tracing::warn!(error = %e, "could not pause source");
            }
        }
        self.waiting.cancel();
        self.keepalive
            .arm_periodic(self.config.keepalive_interval, ctx.events);
        // Armed last: an already empty queue reports underrun right away
        if let Some(branch) = self.branch.as_ref() {
            branch.queue().arm_underrun(true);
        }
    }

    fn send_keepalive(&mut self) {
        let Some(branch) = self.branch.as_ref() else {
            return;
        };
        self.keepalives += 1;
        if branch.is_sink_idle() {
            tracing::debug!(peer = %self.peer, "injecting keepalive");
            branch.inject(keepalive_packet());
        } else {
            tracing::trace!("sink busy, keepalive skipped");
        }
    }

    fn resume_transmitting(&mut self, ctx: &Context<'_>) {
        self.window.reset();
        self.waiting.cancel();
        self.keepalive.cancel();
        self.set_state(ctx, UpstreamState::Transmitting);
    }

    fn adjust_bitrate(&mut self, ctx: &mut Context<'_>, now: Instant) {
        let current = ctx.source.refresh_properties().clone();
        let average = self.meter.lock().average();
        let decision = reduce_bitrate(current.audio_bitrate, average);
        tracing::info!(
            average,
            audio_from = current.audio_bitrate,
            audio_to = decision.audio,
            video_from = current.video_bitrate,
            video_to = decision.video,
            "reducing encoder bitrate"
        );
        if decision.audio != current.audio_bitrate {
            if let Err(e) = ctx.source.set_bitrate(EncoderKind::Audio, decision.audio) {
                tracing::warn!(error = %e, "audio bitrate not reduced");
            }
        }
        if let Err(e) = ctx.source.set_bitrate(EncoderKind::Video, decision.video) {
            tracing::warn!(error = %e, "video bitrate not reduced");
        }
        self.adjustments += 1;
        self.resume.arm_once(self.config.resume_delay, ctx.events);
        self.window.restart(now);
    }
}

impl std::fmt::Debug for UpstreamPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPusher")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("adaptive", &self.adaptive)
            .field("overruns", &self.window.count())
            .finish()
    }
}
