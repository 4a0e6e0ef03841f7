//! Monotonic time source and scheduled wake-ups.
//!
//! The dispatcher, control-flow interpreter, and trigger registry never read
//! `Utc::now()` directly; they go through a [`Clock`] so tests can advance
//! time deterministically instead of sleeping, by injecting `DateTime<Utc>`
//! offsets rather than using real delays.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// Payload carried by a scheduled wake-up, identifying what should happen
/// when the clock fires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeupPayload {
    RetryJob { run_id: Uuid, step_id: String, attempt: u32 },
    Timeout { run_id: Uuid, step_id: String },
    SleepElapsed { run_id: Uuid, step_id: String },
    PauseExpired { token: Uuid },
    CronFire { trigger_id: String },
}

/// Opaque handle for cancelling a scheduled wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeupId(u64);

struct ScheduledWakeup {
    at: DateTime<Utc>,
    id: WakeupId,
    payload: WakeupPayload,
}

impl PartialEq for ScheduledWakeup {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}
impl Eq for ScheduledWakeup {}

impl Ord for ScheduledWakeup {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (max-heap) pops the earliest wake-up first.
        other.at.cmp(&self.at)
    }
}
impl PartialOrd for ScheduledWakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Abstracts "now" and a priority queue of future wake-ups.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn schedule(&self, at: DateTime<Utc>, payload: WakeupPayload) -> WakeupId;
    fn cancel(&self, id: WakeupId);
    /// Pops and returns every wake-up whose `at` is `<= now()`.
    fn poll_due(&self) -> Vec<WakeupPayload>;
}

/// Real-time clock; wake-ups are polled by a background tick loop in the dispatcher.
#[derive(Default)]
pub struct SystemClock {
    queue: Mutex<BinaryHeap<ScheduledWakeup>>,
    next_id: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, at: DateTime<Utc>, payload: WakeupPayload) -> WakeupId {
        let id = WakeupId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.queue.lock().push(ScheduledWakeup { at, id, payload });
        id
    }

    fn cancel(&self, id: WakeupId) {
        let mut queue = self.queue.lock();
        let remaining: Vec<ScheduledWakeup> = queue.drain().filter(|w| w.id != id).collect();
        queue.extend(remaining);
    }

    fn poll_due(&self) -> Vec<WakeupPayload> {
        let now = self.now();
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        while let Some(top) = queue.peek() {
            if top.at <= now {
                due.push(queue.pop().unwrap().payload);
            } else {
                break;
            }
        }
        due
    }
}

/// Manually-advanced clock used by tests that exercise retry backoff,
/// timeouts, and sleep steps without real delays.
#[derive(Default)]
pub struct TestClock {
    now: Mutex<DateTime<Utc>>,
    queue: Mutex<BinaryHeap<ScheduledWakeup>>,
    next_id: AtomicU64,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            queue: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Advance time by `delta`, returning any wake-ups that are now due.
    pub fn advance(&self, delta: chrono::Duration) -> Vec<WakeupPayload> {
        {
            let mut now = self.now.lock();
            *now += delta;
        }
        self.poll_due()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn schedule(&self, at: DateTime<Utc>, payload: WakeupPayload) -> WakeupId {
        let id = WakeupId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.queue.lock().push(ScheduledWakeup { at, id, payload });
        id
    }

    fn cancel(&self, id: WakeupId) {
        let mut queue = self.queue.lock();
        let remaining: Vec<ScheduledWakeup> = queue.drain().filter(|w| w.id != id).collect();
        queue.extend(remaining);
    }

    fn poll_due(&self) -> Vec<WakeupPayload> {
        let now = self.now();
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        while let Some(top) = queue.peek() {
            if top.at <= now {
                due.push(queue.pop().unwrap().payload);
            } else {
                break;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_and_fires_in_order() {
        let clock = TestClock::new(Utc::now());
        let t0 = clock.now();
        clock.schedule(
            t0 + chrono::Duration::milliseconds(20),
            WakeupPayload::SleepElapsed {
                run_id: Uuid::now_v7(),
                step_id: "a".into(),
            },
        );
        clock.schedule(
            t0 + chrono::Duration::milliseconds(10),
            WakeupPayload::SleepElapsed {
                run_id: Uuid::now_v7(),
                step_id: "b".into(),
            },
        );

        assert!(clock.advance(chrono::Duration::milliseconds(5)).is_empty());

        let due = clock.advance(chrono::Duration::milliseconds(10));
        assert_eq!(due.len(), 1);
        assert!(matches!(&due[0], WakeupPayload::SleepElapsed { step_id, .. } if step_id == "b"));

        let due = clock.advance(chrono::Duration::milliseconds(10));
        assert_eq!(due.len(), 1);
        assert!(matches!(&due[0], WakeupPayload::SleepElapsed { step_id, .. } if step_id == "a"));
    }

    #[test]
    fn cancel_removes_pending_wakeup() {
        let clock = TestClock::new(Utc::now());
        let id = clock.schedule(
            clock.now() + chrono::Duration::milliseconds(5),
            WakeupPayload::PauseExpired { token: Uuid::now_v7() },
        );
        clock.cancel(id);
        assert!(clock.advance(chrono::Duration::milliseconds(10)).is_empty());
    }

    #[test]
    fn system_clock_now_is_monotonic_enough() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
