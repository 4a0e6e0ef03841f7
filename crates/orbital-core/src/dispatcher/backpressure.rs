//! Bounds dispatcher concurrency: at most `max_concurrency` jobs run at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackpressureError {
    #[error("no capacity available")]
    NoCapacity,
}

struct Inner {
    max: u32,
    in_flight: AtomicU32,
}

/// Counting semaphore over in-flight dispatcher jobs.
#[derive(Clone)]
pub struct Backpressure {
    inner: Arc<Inner>,
}

/// Held for the lifetime of one job's execution; releases its slot on drop.
pub struct BackpressurePermit {
    inner: Arc<Inner>,
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Backpressure {
    pub fn new(max_concurrency: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                max: max_concurrency.max(1),
                in_flight: AtomicU32::new(0),
            }),
        }
    }

    /// How many more jobs can be admitted right now.
    pub fn available(&self) -> u32 {
        let in_flight = self.inner.in_flight.load(Ordering::Acquire);
        self.inner.max.saturating_sub(in_flight)
    }

    /// Reserves one slot, incrementing in-flight unconditionally; callers
    /// are expected to have checked [`Backpressure::available`] first via
    /// the dispatcher's claim-sizing, which never claims more jobs than it
    /// has capacity for.
    pub fn acquire(&self) -> BackpressurePermit {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        BackpressurePermit {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_shrinks_and_grows_with_permits() {
        let bp = Backpressure::new(2);
        assert_eq!(bp.available(), 2);
        let p1 = bp.acquire();
        assert_eq!(bp.available(), 1);
        let p2 = bp.acquire();
        assert_eq!(bp.available(), 0);
        drop(p1);
        assert_eq!(bp.available(), 1);
        drop(p2);
        assert_eq!(bp.available(), 2);
    }
}
