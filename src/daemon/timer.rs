//! Control timers
//!
//! A [`TimerSlot`] holds at most one armed timer for one purpose. Arming
//! replaces (and aborts) the previous timer. Each expiry is posted to the
//! control loop tagged with the generation it was armed with, and
//! [`TimerSlot::fired`] rejects generations that were cancelled or replaced
//! in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::daemon::event::{ControlEvent, EventSender, TimerKind};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Single timer slot
#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    periodic: bool,
    task: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            periodic: false,
            task: None,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Fire once after `after`
    pub fn arm_once(&mut self, after: Duration, events: &EventSender) {
        let generation = self.rearm(false);
        let kind = self.kind;
        let events = events.clone();
        self.task = Some(tokio::spawn(async move {
            time::sleep(after).await;
            events.post(ControlEvent::Timer { kind, generation });
        }));
    }

    /// Fire every `every`, first after one period
    pub fn arm_periodic(&mut self, every: Duration, events: &EventSender) {
        let generation = self.rearm(true);
        let kind = self.kind;
        let events = events.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                events.post(ControlEvent::Timer { kind, generation });
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::trace!(timer = ?self.kind, generation = self.generation, "timer cancelled");
        }
    }

    /// Check an expiry against this slot
    ///
    /// Returns false for expiries of a cancelled or replaced timer. A
    /// one-shot timer is disarmed by its accepted expiry.
    pub fn fired(&mut self, generation: u64) -> bool {
        if self.task.is_none() || generation != self.generation {
            return false;
        }
        if !self.periodic {
            self.task = None;
        }
        true
    }

    fn rearm(&mut self, periodic: bool) -> u64 {
        self.cancel();
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.periodic = periodic;
        self.generation
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer_generation(event: ControlEvent) -> u64 {
        match event {
            ControlEvent::Timer { generation, .. } => generation,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (events, mut rx) = EventSender::channel();
        let mut slot = TimerSlot::new(TimerKind::UpstreamResume);

        slot.arm_once(Duration::from_secs(20), &events);
        let generation = timer_generation(rx.recv().await.unwrap());

        assert!(slot.fired(generation));
        assert!(!slot.is_armed());
        assert!(!slot.fired(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous_generation() {
        let (events, mut rx) = EventSender::channel();
        let mut slot = TimerSlot::new(TimerKind::UpstreamWaiting);

        slot.arm_once(Duration::from_secs(5), &events);
        let stale = slot.generation;
        slot.arm_once(Duration::from_secs(5), &events);

        let generation = timer_generation(rx.recv().await.unwrap());
        assert_ne!(generation, stale);
        assert!(!slot.fired(stale));
        assert!(slot.fired(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_keeps_firing_until_cancelled() {
        let (events, mut rx) = EventSender::channel();
        let mut slot = TimerSlot::new(TimerKind::UpstreamKeepalive);

        slot.arm_periodic(Duration::from_secs(5), &events);
        let start = Instant::now();
        let first = timer_generation(rx.recv().await.unwrap());
        let second = timer_generation(rx.recv().await.unwrap());

        assert_eq!(first, second);
        assert!(slot.fired(first));
        assert!(slot.is_armed());
        assert!(start.elapsed() >= Duration::from_secs(10));

        slot.cancel();
        assert!(!slot.fired(second));
    }
}
