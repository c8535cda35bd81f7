//! Fan-out junctions and their edges
//!
//! A [`Junction`] hands every sample pushed into it to each of its edges in
//! turn. An [`Edge`] connects the junction to one downstream target and is the
//! unit of safe structural mutation: a quiescence barrier registered on an
//! edge runs exactly once, at a moment when no sample is in flight on it.
//!
//! ```text
//!   producer thread                         control task
//!   ───────────────                         ────────────
//!   junction.push(s)
//!     edge.deliver(s)  busy = true
//!       target.receive(s)                   edge.add_barrier(f)
//!                                             busy, so f is queued
//!     busy = false
//!     blocked = true
//!       f()            unlink, teardown
//!     blocked = false, wake waiters
//! ```
//!
//! If the edge is idle when the barrier is registered, the edge is blocked
//! immediately and the barrier runs on a worker thread, never on the caller.
//! Producers reaching a blocked edge wait for the barrier to finish, then see
//! the edge unlinked and skip it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::media::Sample;

/// Downstream end of an edge
pub trait EdgeTarget: Send + Sync {
    /// Accept one sample. Must not block for long: it runs on the producer thread.
    fn receive(&self, sample: &Sample);
}

type Barrier = Box<dyn FnOnce() + Send + 'static>;

struct EdgeState {
    linked: bool,
    busy: bool,
    blocked: bool,
    barriers: Vec<Barrier>,
}

/// Link between a junction port and one target
pub struct Edge {
    port: u32,
    name: String,
    target: Arc<dyn EdgeTarget>,
    junction: Weak<Junction>,
    state: Mutex<EdgeState>,
    idle: Condvar,
}

impl Edge {
    /// Port number on the owning junction
    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    /// Deliver one sample to the target, honouring barriers
    fn deliver(&self, sample: &Sample) {
        let mut state = self.state.lock();
        while state.blocked {
            self.idle.wait(&mut state);
        }
        if !state.linked {
            return;
        }
        state.busy = true;
        drop(state);

        self.target.receive(sample);

        let mut state = self.state.lock();
        state.busy = false;
        if state.barriers.is_empty() {
            return;
        }
        state.blocked = true;
        drop(state);
        self.run_barriers();
    }

    /// Run queued barriers until none are left, then unblock the edge.
    ///
    /// Caller must have set `blocked`.
    fn run_barriers(&self) {
        loop {
            let barriers = {
                let mut state = self.state.lock();
                let barriers = std::mem::take(&mut state.barriers);
                if barriers.is_empty() {
                    state.blocked = false;
                    break;
                }
                barriers
            };
            for barrier in barriers {
                barrier();
            }
        }
        self.idle.notify_all();
    }

    /// Register a one-shot quiescence barrier on this edge
    ///
    /// `barrier` runs once, with no sample in flight on this edge. If a
    /// delivery is in progress it runs on the delivering thread right after
    /// it; otherwise it runs on a worker thread.
    pub fn add_barrier<F>(self: &Arc<Self>, barrier: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        state.barriers.push(Box::new(barrier));
        if state.busy || state.blocked {
            tracing::trace!(edge = %self.name, "barrier queued behind in-flight data");
            return;
        }
        state.blocked = true;
        drop(state);

        let edge = Arc::clone(self);
        spawn_worker(move || edge.run_barriers());
    }

    /// Unlink the edge from its junction and release the port
    ///
    /// Samples already past the edge are unaffected; no further sample is
    /// delivered to the target.
    pub fn unlink(&self) {
        let was_linked = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.linked, false)
        };
        if !was_linked {
            return;
        }
        if let Some(junction) = self.junction.upgrade() {
            junction.release_port(self.port);
        }
        tracing::debug!(edge = %self.name, "edge unlinked");
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish()
    }
}

/// Run `f` off the calling thread: on the tokio blocking pool when a runtime
/// is available, on a plain thread otherwise.
pub(crate) fn spawn_worker<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(f);
        }
        Err(_) => {
            if let Err(e) = std::thread::Builder::new()
                .name("graph-barrier".into())
                .spawn(f)
            {
                tracing::error!(error = %e, "failed to spawn barrier thread");
            }
        }
    }
}

/// One-to-many fan-out point
pub struct Junction {
    name: String,
    ports: Mutex<Vec<Arc<Edge>>>,
    next_port: AtomicU32,
    pushed: AtomicU64,
}

impl Junction {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ports: Mutex::new(Vec::new()),
            next_port: AtomicU32::new(0),
            pushed: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate a port feeding `target`
    pub fn request_port(self: &Arc<Self>, target: Arc<dyn EdgeTarget>) -> Arc<Edge> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let edge = Arc::new(Edge {
            port,
            name: format!("{}:src_{}", self.name, port),
            target,
            junction: Arc::downgrade(self),
            state: Mutex::new(EdgeState {
                linked: true,
                busy: false,
                blocked: false,
                barriers: Vec::new(),
            }),
            idle: Condvar::new(),
        });
        self.ports.lock().push(Arc::clone(&edge));
        tracing::debug!(edge = %edge.name, "port requested");
        edge
    }

    fn release_port(&self, port: u32) {
        self.ports.lock().retain(|edge| edge.port != port);
    }

    /// Hand `sample` to every linked edge
    pub fn push(&self, sample: &Sample) {
        let ports = self.ports.lock().clone();
        for edge in &ports {
            edge.deliver(sample);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of linked ports
    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    /// Samples pushed since creation
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Junction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Junction")
            .field("name", &self.name)
            .field("ports", &self.port_count())
            .finish()
    }
}
