//! RTSP distributor
//!
//! Serves two presentations through an [`RtspHost`]:
//!
//! ```text
//!   atee ──► rtsp-es-audio ──┐
//!   vtee ──► rtsp-es-video ──┴──► ES presentation  ──► <path>-es
//!   tstee ─► rtsp-ts ────────────► TS presentation ──► <path>
//! ```
//!
//! The three branches live from `enable` to `disable`. A presentation only
//! relays while a viewer session is prepared on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::{Consumer, Context, Notification};
use crate::error::Result;
use crate::graph::{Branch, BranchId, QueueConfig};
use crate::rtsp::host::{ClientId, RtspHost};
use crate::rtsp::presentation::{Presentation, PresentationKind, RelaySink};

/// State of the RTSP distributor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RtspState {
    #[default]
    Disabled,
    /// Mounted, no presentation playing
    Idle,
    Running,
}

impl RtspState {
    pub fn code(&self) -> i32 {
        match self {
            RtspState::Disabled => 0,
            RtspState::Idle => 1,
            RtspState::Running => 2,
        }
    }
}

impl std::fmt::Display for RtspState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RtspState::Disabled => "DISABLED",
            RtspState::Idle => "IDLE",
            RtspState::Running => "RUNNING",
        })
    }
}

/// RTSP distributor configuration options
#[derive(Debug, Clone)]
pub struct RtspConfig {
    /// Port used when `enable` is given 0
    pub port: u16,

    /// Mount path used when `enable` is given an empty path
    pub path: String,

    /// Suffix of the elementary stream mount
    pub es_suffix: String,

    /// Time bound of the branch queues (leaky)
    pub queue_time: Duration,

    /// Items buffered per viewer endpoint
    pub endpoint_capacity: usize,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            port: 554,
            path: "/stream".into(),
            es_suffix: "-es".into(),
            queue_time: Duration::from_secs(5),
            endpoint_capacity: 256,
        }
    }
}

impl RtspConfig {
    /// Set the default port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the default mount path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Mount path for a requested path: default when empty, always rooted
pub fn normalize_path(path: &str, default: &str) -> String {
    let path = if path.is_empty() { default } else { path };
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// The RTSP consumer
pub struct RtspDistributor {
    config: RtspConfig,
    host: Arc<dyn RtspHost>,
    state: RtspState,
    path: String,
    port: u16,
    es: Option<Arc<Presentation>>,
    ts: Option<Arc<Presentation>>,
    branches: Vec<Branch>,
    clients: HashMap<ClientId, String>,
    query: String,
}

impl RtspDistributor {
    /// Create a new, disabled distributor serving through `host`
    pub fn new(config: RtspConfig, host: Arc<dyn RtspHost>) -> Self {
        Self {
            config,
            host,
            state: RtspState::Disabled,
            path: String::new(),
            port: 0,
            es: None,
            ts: None,
            branches: Vec::new(),
            clients: HashMap::new(),
            query: String::new(),
        }
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    /// Muxed mount path; empty while disabled
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn es_path(&self) -> String {
        format!("{}{}", self.path, self.config.es_suffix)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Last query string supplied by a viewer
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn presentation(&self, kind: PresentationKind) -> Option<&Arc<Presentation>> {
        match kind {
            PresentationKind::Elementary => self.es.as_ref(),
            PresentationKind::Muxed => self.ts.as_ref(),
        }
    }

    pub fn owns(&self, branch: BranchId) -> bool {
        self.branches.iter().any(|b| b.id() == branch)
    }

    /// Relay branches currently linked to the source
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    fn set_state(&mut self, ctx: &Context<'_>, state: RtspState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "rtsp state");
        self.state = state;
        ctx.notifier.publish(Notification::RtspStateChanged(state));
    }

    /// Mount both presentations; false if already enabled or construction failed
    pub fn enable(
        &mut self,
        ctx: &mut Context<'_>,
        path: &str,
        port: u16,
        user: &str,
        pass: &str,
    ) -> bool {
        if self.state != RtspState::Disabled {
            tracing::info!(state = %self.state, "rtsp already enabled");
            return false;
        }
        self.path = normalize_path(path, &self.config.path);
        self.port = if port == 0 { self.config.port } else { port };

        if let Err(e) = self.build(ctx, user, pass) {
            tracing::error!(error = %e, "failed to enable rtsp");
            self.teardown(ctx);
            return false;
        }
        tracing::info!(
            port = self.port,
            path = %self.path,
            es_path = %self.es_path(),
            auth = !user.is_empty(),
            "rtsp enabled"
        );
        self.set_state(ctx, RtspState::Idle);
        true
    }

    fn build(&mut self, ctx: &mut Context<'_>, user: &str, pass: &str) -> Result<()> {
        let es = Presentation::new(PresentationKind::Elementary, self.config.endpoint_capacity);
        let ts = Presentation::new(PresentationKind::Muxed, self.config.endpoint_capacity);
        self.link_branches(ctx, &es, &ts)?;
        self.es = Some(Arc::clone(&es));
        self.ts = Some(Arc::clone(&ts));

        let es_path = self.es_path();
        self.host.start(self.port)?;
        self.host.mount(&self.path, ts)?;
        self.host.mount(&es_path, es)?;
        if !user.is_empty() {
            self.host
                .set_auth(&[self.path.clone(), es_path], user, pass);
        }
        Ok(())
    }

    /// Feed both presentations from the current source junctions
    fn link_branches(
        &mut self,
        ctx: &mut Context<'_>,
        es: &Arc<Presentation>,
        ts: &Arc<Presentation>,
    ) -> Result<()> {
        ctx.source.ensure_muxed()?;
        let feeds = [
            ("rtsp-es-audio", ctx.source.audio_junction()?, es),
            ("rtsp-es-video", ctx.source.video_junction()?, es),
            ("rtsp-ts", ctx.source.transport_junction()?, ts),
        ];
        for (name, junction, presentation) in feeds {
            let sink = RelaySink::new(Arc::clone(presentation));
            let queue = QueueConfig::time_bounded(self.config.queue_time);
            let mut branch = Branch::new(name, queue, Box::new(sink));
            branch.on_notice(ctx.events.notice_handler(Consumer::Rtsp));
            branch.link(&junction)?;
            branch.play()?;
            self.branches.push(branch);
        }
        Ok(())
    }

    /// Detach the relay branches ahead of a source rebuild
    ///
    /// Mounts, presentations and viewer sessions stay; [`relink`](Self::relink)
    /// feeds them from the new source.
    pub fn unlink(&mut self, ctx: &Context<'_>) {
        for branch in self.branches.drain(..) {
            branch.detach(ctx.events.detached(Consumer::Rtsp));
        }
    }

    /// Reattach the relay branches to a rebuilt source
    ///
    /// Disables the distributor when the branches cannot be linked.
    pub fn relink(&mut self, ctx: &mut Context<'_>) -> bool {
        if self.state == RtspState::Disabled {
            return false;
        }
        let (Some(es), Some(ts)) = (self.es.clone(), self.ts.clone()) else {
            return false;
        };
        let mut linked = self.link_branches(ctx, &es, &ts);
        if linked.is_ok() && self.state == RtspState::Running {
            linked = ctx.source.play();
        }
        if let Err(e) = linked {
            tracing::error!(error = %e, "could not relink rtsp to the rebuilt source");
            self.disable(ctx);
            return false;
        }
        tracing::info!(state = %self.state, branches = self.branches.len(), "rtsp relinked");
        true
    }

    fn teardown(&mut self, ctx: &Context<'_>) {
        let es_path = self.es_path();
        for path in [self.path.as_str(), es_path.as_str()] {
            self.host.evict_sessions(path);
            self.host.unmount(path);
        }
        self.host.clear_auth();
        self.host.stop();

        for presentation in self.es.take().into_iter().chain(self.ts.take()) {
            presentation.deactivate();
        }
        for branch in self.branches.drain(..) {
            branch.detach(ctx.events.detached(Consumer::Rtsp));
        }
    }

    /// Unmount and release everything; false if not enabled
    pub fn disable(&mut self, ctx: &Context<'_>) -> bool {
        if self.state == RtspState::Disabled {
            tracing::info!("rtsp not enabled");
            return false;
        }
        self.teardown(ctx);
        if !self.clients.is_empty() {
            self.clients.clear();
            ctx.notifier.publish(Notification::RtspClientCountChanged {
                count: 0,
                addr: String::new(),
            });
        }
        self.query.clear();
        self.path.clear();
        self.port = 0;
        self.set_state(ctx, RtspState::Disabled);
        true
    }

    /// A viewer requested `kind`: relay it from the next keyframe on
    pub fn on_session_prepared(&mut self, ctx: &mut Context<'_>, kind: PresentationKind) {
        if self.state == RtspState::Disabled {
            return;
        }
        let Some(presentation) = self.presentation(kind).cloned() else {
            return;
        };
        presentation.activate();
        tracing::info!(presentation = %kind, "rtsp session prepared");
        self.set_state(ctx, RtspState::Running);

        let started = ctx.source.ensure_muxed().and_then(|_| ctx.source.play());
        if let Err(e) = started {
            tracing::error!(error = %e, "could not start source for rtsp");
        }
    }

    pub fn on_session_unprepared(&mut self, ctx: &Context<'_>, kind: PresentationKind) {
        if self.state == RtspState::Disabled {
            return;
        }
        if let Some(presentation) = self.presentation(kind) {
            presentation.deactivate();
        }
        tracing::info!(presentation = %kind, "rtsp session unprepared");
        let any_active = self
            .es
            .iter()
            .chain(self.ts.iter())
            .any(|p| p.is_active());
        if !any_active {
            self.set_state(ctx, RtspState::Idle);
        }
    }

    pub fn on_client_connected(&mut self, ctx: &Context<'_>, client: ClientId, addr: &str) {
        if self.state == RtspState::Disabled {
            return;
        }
        self.clients.insert(client, addr.to_string());
        tracing::info!(client = client.as_u64(), addr, count = self.clients.len(), "rtsp client connected");
        ctx.notifier.publish(Notification::RtspClientCountChanged {
            count: self.clients.len(),
            addr: addr.to_string(),
        });
    }

    pub fn on_client_closed(&mut self, ctx: &Context<'_>, client: ClientId) {
        let Some(addr) = self.clients.remove(&client) else {
            return;
        };
        tracing::info!(client = client.as_u64(), addr = %addr, count = self.clients.len(), "rtsp client closed");
        ctx.notifier.publish(Notification::RtspClientCountChanged {
            count: self.clients.len(),
            addr: String::new(),
        });
    }

    pub fn on_query_received(&mut self, ctx: &Context<'_>, query: &str) {
        if self.state == RtspState::Disabled {
            return;
        }
        tracing::info!(query, "uri parameters");
        self.query = query.to_string();
        ctx.notifier
            .publish(Notification::UriParametersChanged(self.query.clone()));
    }
}

impl std::fmt::Debug for RtspDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspDistributor")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("port", &self.port)
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("", "/stream"), "/stream");
        assert_eq!(normalize_path("live", "/stream"), "/live");
        assert_eq!(normalize_path("/live", "/stream"), "/live");
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(RtspState::Disabled.code(), 0);
        assert_eq!(RtspState::Idle.code(), 1);
        assert_eq!(RtspState::Running.code(), 2);
        assert!(RtspState::Running > RtspState::Idle);
    }

    #[test]
    fn test_default_config() {
        let config = RtspConfig::default();
        assert_eq!(config.port, 554);
        assert_eq!(config.path, "/stream");
        assert_eq!(config.es_suffix, "-es");
    }
}
