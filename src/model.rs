use std::sync::atomic::{AtomicUsize, Ordering};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryMetrics {
    pub workers: usize,
    pub callbacks: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl FactoryMetrics {
    /// Jobs dispatched that have not reported an outcome yet.
    pub fn in_flight(&self) -> usize {
        self.dispatched
            .saturating_sub(self.succeeded + self.failed + self.rejected)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / total as f64
    }
}


/// Live counters shared by the factory, its workers and dispatch helpers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    rejected: AtomicUsize,
}

impl Counters {
    #[inline]
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, workers: usize, callbacks: usize) -> FactoryMetrics {
        FactoryMetrics {
            workers,
            callbacks,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
