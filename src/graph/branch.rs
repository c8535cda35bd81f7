//! Consumer branches
//!
//! A [`Branch`] is a [`BranchQueue`] plus a terminal [`BranchSink`], attached
//! to exactly one junction at a time:
//!
//! ```text
//!   created ──link()──► linked ──play()──► playing ──detach()──► (barrier) ──► dropped
//! ```
//!
//! `play()` spawns the drain task that pops the queue, runs the probe chain
//! and hands each sample to the sink. Detaching goes through the quiescence
//! barrier of the branch's junction edge; the branch itself is moved into
//! the barrier so every part it owns stays alive until the edge is idle.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::graph::junction::{Edge, EdgeTarget, Junction};
use crate::graph::queue::{BranchQueue, QueueConfig, QueueSignal};
use crate::media::Sample;

static NEXT_BRANCH_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a branch
///
/// Events raised by a branch carry its id so the owning consumer can ignore
/// events from a branch it has already replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(u64);

impl BranchId {
    fn next() -> Self {
        Self(NEXT_BRANCH_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "branch-{}", self.0)
    }
}

/// Terminal element of a branch
#[async_trait]
pub trait BranchSink: Send {
    /// Consume one sample
    async fn render(&mut self, sample: &Sample) -> io::Result<()>;

    /// Write out-of-band bytes (tokens, keepalives) ahead of regular data
    async fn write_raw(&mut self, _data: Bytes) -> io::Result<()> {
        Ok(())
    }
}

/// Whether a probe stays installed after running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    Keep,
    Remove,
}

/// Handle of an installed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

/// What a probe may do besides observing the sample
#[derive(Debug, Default)]
pub struct ProbeContext {
    injected: Vec<Bytes>,
}

impl ProbeContext {
    /// Write `data` to the sink before the probed sample
    pub fn inject(&mut self, data: Bytes) {
        self.injected.push(data);
    }
}

type ProbeFn = Box<dyn FnMut(&Sample, &mut ProbeContext) -> ProbeReturn + Send>;

/// Interception points on the sink edge of a branch
///
/// Probes run on the drain task, in installation order, for every sample
/// just before it reaches the sink.
pub struct ProbeChain {
    next_id: AtomicU64,
    probes: Mutex<Vec<(ProbeId, ProbeFn)>>,
}

impl ProbeChain {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, probe: F) -> ProbeId
    where
        F: FnMut(&Sample, &mut ProbeContext) -> ProbeReturn + Send + 'static,
    {
        let id = ProbeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.probes.lock().push((id, Box::new(probe)));
        id
    }

    /// Remove a probe; returns false if it already removed itself
    pub fn remove(&self, id: ProbeId) -> bool {
        let mut probes = self.probes.lock();
        let before = probes.len();
        probes.retain(|(pid, _)| *pid != id);
        probes.len() != before
    }

    pub fn contains(&self, id: ProbeId) -> bool {
        self.probes.lock().iter().any(|(pid, _)| *pid == id)
    }

    pub fn clear(&self) {
        self.probes.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.lock().is_empty()
    }

    /// Run every probe on `sample`, returning the bytes they injected
    fn run(&self, sample: &Sample) -> Vec<Bytes> {
        let mut ctx = ProbeContext::default();
        self.probes
            .lock()
            .retain_mut(|(_, probe)| probe(sample, &mut ctx) == ProbeReturn::Keep);
        ctx.injected
    }
}

/// Asynchronous conditions a branch reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchNotice {
    /// The queue was full when a sample arrived
    Overrun,
    /// The drain task found the queue empty
    Underrun,
    /// The sink failed; the drain task has stopped
    SinkFailed(String),
}

/// Receiver of branch notices
pub type NoticeHandler = Arc<dyn Fn(BranchId, BranchNotice) + Send + Sync>;

/// Counters of a branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStats {
    /// Samples handed to the sink
    pub rendered: u64,
    /// Payload bytes handed to the sink
    pub bytes: u64,
    /// Samples dropped for exceeding the maximum lateness
    pub late: u64,
    /// Out-of-band writes (sideband and probe injections)
    pub injected: u64,
    /// Samples leaked by the queue
    pub leaked: u64,
}

#[derive(Default)]
struct BranchControl {
    max_lateness: Mutex<Option<Duration>>,
    writing: AtomicBool,
    failed: AtomicBool,
    rendered: AtomicU64,
    bytes: AtomicU64,
    late: AtomicU64,
    injected: AtomicU64,
    notices: Mutex<Option<NoticeHandler>>,
}

impl BranchControl {
    fn notify(&self, id: BranchId, notice: BranchNotice) {
        let handler = self.notices.lock().clone();
        if let Some(handler) = handler {
            handler(id, notice);
        }
    }
}

/// Queue plus sink attached to one junction
pub struct Branch {
    id: BranchId,
    name: String,
    queue: Arc<BranchQueue>,
    probes: Arc<ProbeChain>,
    control: Arc<BranchControl>,
    sink: Option<Box<dyn BranchSink>>,
    sideband_tx: mpsc::UnboundedSender<Bytes>,
    sideband_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    edge: Option<Arc<Edge>>,
    drain: Option<JoinHandle<()>>,
}

impl Branch {
    /// Create a new, unlinked branch
    pub fn new(name: impl Into<String>, config: QueueConfig, sink: Box<dyn BranchSink>) -> Self {
        let name = name.into();
        let (sideband_tx, sideband_rx) = mpsc::unbounded_channel();
        Self {
            id: BranchId::next(),
            queue: Arc::new(BranchQueue::new(format!("{}-queue", name), config)),
            name,
            probes: Arc::new(ProbeChain::new()),
            control: Arc::new(BranchControl::default()),
            sink: Some(sink),
            sideband_tx,
            sideband_rx: Some(sideband_rx),
            edge: None,
            drain: None,
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<BranchQueue> {
        &self.queue
    }

    pub fn probes(&self) -> &Arc<ProbeChain> {
        &self.probes
    }

    /// Route queue signals and sink failures to `handler`
    pub fn on_notice(&self, handler: NoticeHandler) {
        let id = self.id;
        let forward = Arc::clone(&handler);
        self.queue.set_handler(Arc::new(move |signal| {
            let notice = match signal {
                QueueSignal::Overrun => BranchNotice::Overrun,
                QueueSignal::Underrun => BranchNotice::Underrun,
            };
            forward(id, notice);
        }));
        *self.control.notices.lock() = Some(handler);
    }

    /// Attach the queue to a new port of `junction`
    pub fn link(&mut self, junction: &Arc<Junction>) -> Result<()> {
        if self.edge.is_some() {
            return Err(Error::Link(format!("{} is already linked", self.name)));
        }
        let edge = junction.request_port(Arc::clone(&self.queue) as Arc<dyn EdgeTarget>);
        tracing::debug!(branch = %self.name, edge = %edge.name(), "branch linked");
        self.edge = Some(edge);
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.edge.as_ref().is_some_and(|edge| edge.is_linked())
    }

    pub fn is_playing(&self) -> bool {
        self.drain.is_some()
    }

    /// Start the drain task
    pub fn play(&mut self) -> Result<()> {
        let (Some(sink), Some(sideband)) = (self.sink.take(), self.sideband_rx.take()) else {
            return Err(Error::InvalidState(format!("{} is already playing", self.name)));
        };
        let task = DrainTask {
            id: self.id,
            name: self.name.clone(),
            queue: Arc::clone(&self.queue),
            probes: Arc::clone(&self.probes),
            control: Arc::clone(&self.control),
        };
        self.drain = Some(tokio::spawn(task.run(sink, sideband)));
        Ok(())
    }

    /// Drop samples that waited longer than `lateness` in the queue
    ///
    /// `None` accepts samples of any age.
    pub fn set_max_lateness(&self, lateness: Option<Duration>) {
        *self.control.max_lateness.lock() = lateness;
    }

    pub fn max_lateness(&self) -> Option<Duration> {
        *self.control.max_lateness.lock()
    }

    /// Queue `data` for an out-of-band write to the sink
    pub fn inject(&self, data: Bytes) -> bool {
        self.sideband_tx.send(data).is_ok()
    }

    /// True while the sink is not writing and nothing is queued
    pub fn is_sink_idle(&self) -> bool {
        !self.control.writing.load(Ordering::Acquire) && self.queue.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        self.control.failed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BranchStats {
        BranchStats {
            rendered: self.control.rendered.load(Ordering::Relaxed),
            bytes: self.control.bytes.load(Ordering::Relaxed),
            late: self.control.late.load(Ordering::Relaxed),
            injected: self.control.injected.load(Ordering::Relaxed),
            leaked: self.queue.leaked(),
        }
    }

    /// Detach the branch through the quiescence barrier of its edge
    ///
    /// Queue signals stop at once. `done` runs after the branch has been
    /// unlinked and torn down, on whichever thread ran the barrier.
    pub fn detach<F>(self, done: F)
    where
        F: FnOnce(BranchId) + Send + 'static,
    {
        self.queue.disarm();
        *self.control.notices.lock() = None;
        let id = self.id;
        match self.edge.clone() {
            Some(edge) => {
                tracing::debug!(branch = %self.name, "detach requested");
                edge.add_barrier(move || {
                    drop(self);
                    done(id);
                });
            }
            None => {
                drop(self);
                done(id);
            }
        }
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        if let Some(edge) = self.edge.take() {
            edge.unlink();
        }
        self.queue.close();
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        tracing::debug!(branch = %self.name, "branch dropped");
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("linked", &self.is_linked())
            .field("playing", &self.is_playing())
            .finish()
    }
}

struct DrainTask {
    id: BranchId,
    name: String,
    queue: Arc<BranchQueue>,
    probes: Arc<ProbeChain>,
    control: Arc<BranchControl>,
}

impl DrainTask {
    async fn run(
        self,
        mut sink: Box<dyn BranchSink>,
        mut sideband: mpsc::UnboundedReceiver<Bytes>,
    ) {
        tracing::debug!(branch = %self.name, "drain task started");
        loop {
            let result = tokio::select! {
                biased;
                Some(data) = sideband.recv() => self.write_raw(sink.as_mut(), data).await,
                item = self.queue.pop() => {
                    let Some(item) = item else { break };
                    let max_lateness = *self.control.max_lateness.lock();
                    if let Some(max) = max_lateness {
                        if item.enqueued.elapsed() > max {
                            self.control.late.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                    self.render(sink.as_mut(), &item.sample).await
                }
            };

            if let Err(e) = result {
                tracing::warn!(branch = %self.name, error = %e, "sink failed");
                self.control.failed.store(true, Ordering::Release);
                self.control.notify(self.id, BranchNotice::SinkFailed(e.to_string()));
                break;
            }
        }
        tracing::debug!(branch = %self.name, "drain task finished");
    }

    async fn write_raw(&self, sink: &mut dyn BranchSink, data: Bytes) -> io::Result<()> {
        self.control.writing.store(true, Ordering::Release);
        let result = sink.write_raw(data).await;
        self.control.writing.store(false, Ordering::Release);
        if result.is_ok() {
            self.control.injected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn render(&self, sink: &mut dyn BranchSink, sample: &Sample) -> io::Result<()> {
        self.control.writing.store(true, Ordering::Release);
        let injected = self.probes.run(sample);
        let mut result = Ok(());
        for data in injected {
            result = sink.write_raw(data).await;
            if result.is_err() {
                break;
            }
            self.control.injected.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_ok() {
            result = sink.render(sample).await;
        }
        self.control.writing.store(false, Ordering::Release);
        if result.is_ok() {
            self.control.rendered.fetch_add(1, Ordering::Relaxed);
            self.control
                .bytes
                .fetch_add(sample.size() as u64, Ordering::Relaxed);
        }
        result
    }
}
