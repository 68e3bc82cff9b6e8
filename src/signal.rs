//! Shared termination request

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

#[derive(Debug)]
struct Inner {
    requested: AtomicBool,
    since: Mutex<Option<Instant>>,
    grace: Duration,
}

/// Cancellation flag polled by every blocking loop.
///
/// Once requested, operations stop at their next safe point. After `grace` has
/// passed the request becomes forced and in-flight operations abort.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                since: Mutex::new(None),
                grace,
            }),
        }
    }

    /// Safe to call from a signal handler thread, repeated calls keep the first instant
    pub fn request(&self) {
        if let Ok(mut since) = self.inner.since.lock() {
            since.get_or_insert_with(Instant::now);
        }
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// How long ago shutdown was requested
    pub fn requested_for(&self) -> Option<Duration> {
        if !self.is_requested() {
            return None;
        }
        self.inner
            .since
            .lock()
            .ok()
            .and_then(|since| since.map(|t| t.elapsed()))
    }

    pub fn is_forced(&self) -> bool {
        self.requested_for()
            .map_or(false, |elapsed| elapsed >= self.inner.grace)
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_after_grace() {
        let signal = ShutdownSignal::new(Duration::from_millis(20));
        assert!(!signal.is_requested());
        assert!(!signal.is_forced());
        signal.clone().request();
        assert!(signal.is_requested());
        assert!(!signal.is_forced());
        std::thread::sleep(Duration::from_millis(30));
        assert!(signal.is_forced());
    }

    #[test]
    fn zero_grace_forces_immediately() {
        let signal = ShutdownSignal::new(Duration::ZERO);
        signal.request();
        assert!(signal.is_forced());
    }
}
