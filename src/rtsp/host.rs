//! RTSP server boundary
//!
//! The RTSP wire protocol lives behind [`RtspHost`]. The distributor tells
//! the host what to serve (mount points, credentials) and the host reports
//! viewer activity back as [`RtspEvent`]s.
//!
//! [`LocalRtspHost`] is an in-process host: it keeps the mount table and
//! lets callers play the part of viewers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::rtsp::presentation::{EndpointItem, Presentation, PresentationKind};

/// Opaque handle of a connected viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Viewer activity reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspEvent {
    /// The first viewer of a presentation started it
    SessionPrepared(PresentationKind),
    /// The last viewer of a presentation went away
    SessionUnprepared(PresentationKind),
    ClientConnected { client: ClientId, addr: String },
    ClientClosed(ClientId),
    /// A viewer supplied a query string with its request
    QueryReceived(String),
}

/// Callback receiving host events
pub type RtspEventSink = Arc<dyn Fn(RtspEvent) + Send + Sync>;

/// An RTSP server the distributor can drive
pub trait RtspHost: Send + Sync {
    fn set_event_sink(&self, sink: RtspEventSink);

    /// Start serving on `port`
    fn start(&self, port: u16) -> Result<()>;

    fn stop(&self);

    fn mount(&self, path: &str, presentation: Arc<Presentation>) -> Result<()>;

    fn unmount(&self, path: &str);

    /// Require basic authentication on `paths`
    fn set_auth(&self, paths: &[String], user: &str, pass: &str);

    fn clear_auth(&self);

    /// Close every session on `path`; returns how many were closed
    fn evict_sessions(&self, path: &str) -> usize;
}

/// Basic-auth rule installed on a host
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRule {
    pub paths: Vec<String>,
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for AuthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRule")
            .field("paths", &self.paths)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// A viewer attached to a [`LocalRtspHost`] mount
pub struct Viewer {
    pub client: ClientId,
    pub path: String,
    pub receiver: broadcast::Receiver<EndpointItem>,
}

struct Session {
    path: String,
}

#[derive(Default)]
struct HostState {
    port: Option<u16>,
    mounts: HashMap<String, Arc<Presentation>>,
    auth: Option<AuthRule>,
    sessions: HashMap<ClientId, Session>,
    sink: Option<RtspEventSink>,
}

/// In-process RTSP host
#[derive(Default)]
pub struct LocalRtspHost {
    state: Mutex<HostState>,
    next_client: AtomicU64,
}

impl LocalRtspHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port the host is serving on, if started
    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    /// Mounted paths, sorted
    pub fn mounts(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.state.lock().mounts.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn auth(&self) -> Option<AuthRule> {
        self.state.lock().auth.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn emit(&self, events: Vec<RtspEvent>) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            for event in events {
                sink(event);
            }
        }
    }

    /// Play `uri` (a mount path, optionally with `?query`) as a viewer from `addr`
    ///
    /// Returns `None` if nothing is mounted there. The first viewer of a
    /// mount prepares its session.
    pub fn connect(&self, addr: &str, uri: &str) -> Option<Viewer> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri, ""),
        };
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed) + 1);
        let (viewer, kind, first) = {
            let mut state = self.state.lock();
            let presentation = Arc::clone(state.mounts.get(path)?);
            let first = !state.sessions.values().any(|s| s.path == path);
            state.sessions.insert(
                client,
                Session {
                    path: path.to_string(),
                },
            );
            let viewer = Viewer {
                client,
                path: path.to_string(),
                receiver: presentation.subscribe(),
            };
            (viewer, presentation.kind(), first)
        };

        let mut events = vec![RtspEvent::ClientConnected {
            client,
            addr: addr.to_string(),
        }];
        if !query.is_empty() {
            events.push(RtspEvent::QueryReceived(query.to_string()));
        }
        if first {
            events.push(RtspEvent::SessionPrepared(kind));
        }
        self.emit(events);
        Some(viewer)
    }

    /// Disconnect a viewer; the last viewer of a mount unprepares its session
    pub fn disconnect(&self, viewer: Viewer) {
        let Viewer { client, path, .. } = viewer;
        let kind = {
            let mut state = self.state.lock();
            if state.sessions.remove(&client).is_none() {
                return;
            }
            let last = !state.sessions.values().any(|s| s.path == path);
            if last {
                state.mounts.get(&path).map(|p| p.kind())
            } else {
                None
            }
        };
        let mut events = vec![RtspEvent::ClientClosed(client)];
        if let Some(kind) = kind {
            events.push(RtspEvent::SessionUnprepared(kind));
        }
        self.emit(events);
    }
}

impl RtspHost for LocalRtspHost {
    fn set_event_sink(&self, sink: RtspEventSink) {
        self.state.lock().sink = Some(sink);
    }

    fn start(&self, port: u16) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(current) = state.port {
            if current != port {
                return Err(Error::InvalidState(format!(
                    "RTSP host already serving on port {}",
                    current
                )));
            }
        }
        state.port = Some(port);
        tracing::info!(port, "RTSP host started");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.port = None;
        state.sessions.clear();
        tracing::info!("RTSP host stopped");
    }

    fn mount(&self, path: &str, presentation: Arc<Presentation>) -> Result<()> {
        let mut state = self.state.lock();
        if state.mounts.contains_key(path) {
            return Err(Error::InvalidState(format!("{} is already mounted", path)));
        }
        tracing::info!(path, presentation = %presentation.kind(), "mount point added");
        state.mounts.insert(path.to_string(), presentation);
        Ok(())
    }

    fn unmount(&self, path: &str) {
        if self.state.lock().mounts.remove(path).is_some() {
            tracing::info!(path, "mount point removed");
        }
    }

    fn set_auth(&self, paths: &[String], user: &str, pass: &str) {
        self.state.lock().auth = Some(AuthRule {
            paths: paths.to_vec(),
            user: user.to_string(),
            pass: pass.to_string(),
        });
    }

    fn clear_auth(&self) {
        self.state.lock().auth = None;
    }

    fn evict_sessions(&self, path: &str) -> usize {
        let evicted: Vec<ClientId> = {
            let mut state = self.state.lock();
            let ids: Vec<_> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.path == path)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                state.sessions.remove(id);
            }
            ids
        };
        if !evicted.is_empty() {
            tracing::info!(path, sessions = evicted.len(), "sessions evicted");
        }
        self.emit(evicted.iter().map(|id| RtspEvent::ClientClosed(*id)).collect());
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_with_mount() -> (LocalRtspHost, Arc<Mutex<Vec<RtspEvent>>>) {
        let host = LocalRtspHost::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        host.set_event_sink(Arc::new(move |ev| sink.lock().push(ev)));
        host.mount("/stream", Presentation::new(PresentationKind::Muxed, 8))
            .unwrap();
        (host, seen)
    }

    #[test]
    fn test_first_viewer_prepares_last_unprepares() {
        let (host, seen) = host_with_mount();

        let a = host.connect("10.0.0.1", "/stream?token=1").unwrap();
        let b = host.connect("10.0.0.2", "/stream").unwrap();
        host.disconnect(a);
        host.disconnect(b);

        let events = seen.lock().clone();
        let prepared = events
            .iter()
            .filter(|e| matches!(e, RtspEvent::SessionPrepared(_)))
            .count();
        assert_eq!(prepared, 1);
        assert!(events.contains(&RtspEvent::QueryReceived("token=1".into())));
        assert_eq!(
            events.last(),
            Some(&RtspEvent::SessionUnprepared(PresentationKind::Muxed))
        );
    }

    #[test]
    fn test_unknown_mount() {
        let (host, _) = host_with_mount();
        assert!(host.connect("10.0.0.1", "/other").is_none());
    }

    #[test]
    fn test_evict_closes_sessions() {
        let (host, seen) = host_with_mount();
        let _a = host.connect("10.0.0.1", "/stream").unwrap();

        assert_eq!(host.evict_sessions("/stream"), 1);
        assert_eq!(host.session_count(), 0);
        assert!(matches!(seen.lock().last(), Some(RtspEvent::ClientClosed(_))));
    }

    #[test]
    fn test_auth_debug_hides_password() {
        let rule = AuthRule {
            paths: vec!["/stream".into()],
            user: "admin".into(),
            pass: "secret".into(),
        };
        assert!(!format!("{:?}", rule).contains("secret"));
    }
}
