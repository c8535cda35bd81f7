//! Bounded leaky queue at the head of every branch
//!
//! When full, the oldest sample is dropped to make room (downstream leak).
//! The queue reports backpressure through two signals:
//!
//! - **overrun**: a sample arrived while the queue was full
//! - **underrun**: the consumer found the queue empty
//!
//! Each signal is delivered only while armed, so a consumer state machine can
//! connect and disconnect its handlers as it changes state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::graph::junction::EdgeTarget;
use crate::media::Sample;

/// Size limits of a branch queue; `None` means unbounded in that dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued samples
    pub max_buffers: Option<usize>,
    /// Maximum time span between the oldest and the newest queued sample
    pub max_time: Option<Duration>,
}

impl QueueConfig {
    /// Queue bounded only by time span
    pub fn time_bounded(max_time: Duration) -> Self {
        Self {
            max_buffers: None,
            max_time: Some(max_time),
        }
    }

    /// Queue bounded only by sample count
    pub fn count_bounded(max_buffers: usize) -> Self {
        Self {
            max_buffers: Some(max_buffers),
            max_time: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::time_bounded(Duration::from_secs(5))
    }
}

/// Backpressure signal emitted by a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSignal {
    Overrun,
    Underrun,
}

/// Receiver of queue signals
pub type SignalHandler = Arc<dyn Fn(QueueSignal) + Send + Sync>;

/// A sample waiting in the queue
#[derive(Debug, Clone)]
pub struct Queued {
    pub sample: Sample,
    pub enqueued: Instant,
}

struct QueueInner {
    items: VecDeque<Queued>,
    closed: bool,
    /// Underrun already reported for the current empty period
    drained: bool,
}

/// Bounded, leaky, single-consumer sample queue
pub struct BranchQueue {
    name: String,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    handler: Mutex<Option<SignalHandler>>,
    overrun_armed: AtomicBool,
    underrun_armed: AtomicBool,
    leaked: AtomicU64,
}

impl BranchQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                drained: false,
            }),
            notify: Notify::new(),
            handler: Mutex::new(None),
            overrun_armed: AtomicBool::new(false),
            underrun_armed: AtomicBool::new(false),
            leaked: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Install the signal handler. Signals stay silent until armed.
    pub fn set_handler(&self, handler: SignalHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Connect or disconnect overrun delivery
    pub fn arm_overrun(&self, armed: bool) {
        self.overrun_armed.store(armed, Ordering::Release);
    }

    /// Connect or disconnect underrun delivery
    ///
    /// Arming while the queue is already empty reports the underrun at once,
    /// since the consumer will not look again until new data arrives.
    pub fn arm_underrun(&self, armed: bool) {
        self.underrun_armed.store(armed, Ordering::Release);
        if armed {
            let report = {
                let mut inner = self.inner.lock();
                if inner.items.is_empty() && !inner.closed {
                    inner.drained = true;
                    true
                } else {
                    false
                }
            };
            if report {
                self.emit(QueueSignal::Underrun);
            }
        }
    }

    /// Disconnect both signals
    pub fn disarm(&self) {
        self.overrun_armed.store(false, Ordering::Release);
        self.underrun_armed.store(false, Ordering::Release);
    }

    pub fn overrun_armed(&self) -> bool {
        self.overrun_armed.load(Ordering::Acquire)
    }

    pub fn underrun_armed(&self) -> bool {
        self.underrun_armed.load(Ordering::Acquire)
    }

    fn emit(&self, signal: QueueSignal) {
        let armed = match signal {
            QueueSignal::Overrun => self.overrun_armed(),
            QueueSignal::Underrun => self.underrun_armed(),
        };
        if !armed {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            tracing::trace!(queue = %self.name, ?signal, "queue signal");
            handler(signal);
        }
    }

    fn is_full(&self, inner: &QueueInner, now: Instant) -> bool {
        if let Some(max) = self.config.max_buffers {
            if inner.items.len() >= max {
                return true;
            }
        }
        if let (Some(max), Some(front)) = (self.config.max_time, inner.items.front()) {
            if now.saturating_duration_since(front.enqueued) >= max {
                return true;
            }
        }
        false
    }

    /// Enqueue a sample, leaking the oldest ones if the queue is full
    pub fn push(&self, sample: Sample) {
        let now = Instant::now();
        let mut overrun = false;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            while !inner.items.is_empty() && self.is_full(&inner, now) {
                overrun = true;
                inner.items.pop_front();
                self.leaked.fetch_add(1, Ordering::Relaxed);
            }
            inner.items.push_back(Queued {
                sample,
                enqueued: now,
            });
            inner.drained = false;
        }
        if overrun {
            self.emit(QueueSignal::Overrun);
        }
        self.notify.notify_one();
    }

    /// Take the oldest sample, waiting for one if the queue is empty
    ///
    /// Returns `None` once the queue is closed. Cancel-safe.
    pub async fn pop(&self) -> Option<Queued> {
        loop {
            let report_underrun = {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
                !std::mem::replace(&mut inner.drained, true)
            };
            if report_underrun {
                self.emit(QueueSignal::Underrun);
            }
            self.notify.notified().await;
        }
    }

    /// Drop queued samples and wake the consumer with end-of-queue
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.items.clear();
        }
        self.disarm();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Samples dropped because the queue was full
    pub fn leaked(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }
}

impl EdgeTarget for BranchQueue {
    fn receive(&self, sample: &Sample) {
        self.push(sample.clone());
    }
}

impl std::fmt::Debug for BranchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::media::{Caps, StreamKind};

    fn sample(n: u8) -> Sample {
        Sample::delta(
            StreamKind::Transport,
            Bytes::from(vec![n]),
            Duration::from_millis(n as u64),
            Arc::new(Caps::new("video/mpegts")),
        )
    }

    fn recorder(queue: &BranchQueue) -> Arc<Mutex<Vec<QueueSignal>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.set_handler(Arc::new(move |signal| sink.lock().push(signal)));
        seen
    }

    #[tokio::test]
    async fn test_full_count_queue_leaks_oldest_and_signals_overrun() {
        let queue = BranchQueue::new("tstcpqueue", QueueConfig::count_bounded(3));
        let seen = recorder(&queue);
        queue.arm_overrun(true);

        for n in 0..5 {
            queue.push(sample(n));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.leaked(), 2);
        assert_eq!(*seen.lock(), vec![QueueSignal::Overrun, QueueSignal::Overrun]);
        let first = queue.pop().await.unwrap();
        assert_eq!(first.sample.data[0], 2);
    }

    #[tokio::test]
    async fn test_disarmed_signals_are_silent() {
        let queue = BranchQueue::new("q", QueueConfig::count_bounded(1));
        let seen = recorder(&queue);

        queue.push(sample(0));
        queue.push(sample(1));
        assert!(seen.lock().is_empty());
        assert_eq!(queue.leaked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_bounded_queue_leaks_by_age() {
        let queue = BranchQueue::new("hlsqueue", QueueConfig::time_bounded(Duration::from_secs(5)));
        queue.push(sample(0));
        tokio::time::advance(Duration::from_secs(3)).await;
        queue.push(sample(1));
        tokio::time::advance(Duration::from_secs(3)).await;
        queue.push(sample(2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.unwrap().sample.data[0], 1);
    }

    #[tokio::test]
    async fn test_underrun_reported_once_per_empty_period() {
        let queue = Arc::new(BranchQueue::new("q", QueueConfig::count_bounded(10)));
        let seen = recorder(&queue);
        queue.arm_underrun(true);
        // Arming on an empty queue reports straight away.
        assert_eq!(*seen.lock(), vec![QueueSignal::Underrun]);

        queue.push(sample(0));
        let consumer = Arc::clone(&queue);
        let task = tokio::spawn(async move {
            let a = consumer.pop().await.unwrap();
            let b = consumer.pop().await.unwrap();
            (a.sample.data[0], b.sample.data[0])
        });
        tokio::task::yield_now().await;
        queue.push(sample(1));

        assert_eq!(task.await.unwrap(), (0, 1));
        assert_eq!(
            *seen.lock(),
            vec![QueueSignal::Underrun, QueueSignal::Underrun]
        );
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(BranchQueue::new("q", QueueConfig::default()));
        let consumer = Arc::clone(&queue);
        let task = tokio::spawn(async move { consumer.pop().await.is_none() });
        tokio::task::yield_now().await;

        queue.close();
        assert!(task.await.unwrap());
        queue.push(sample(1));
        assert!(queue.is_empty());
    }
}
