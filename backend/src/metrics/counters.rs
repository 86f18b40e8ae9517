use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub redemptions: Arc<AtomicU64>,
    pub redemptions_replayed: Arc<AtomicU64>,
    pub redemption_failures: Arc<AtomicU64>,

    pub allocations: Arc<AtomicU64>,
    pub lock_contention: Arc<AtomicU64>,

    // request workflow
    pub approvals: Arc<AtomicU64>,
    pub approval_failures: Arc<AtomicU64>,
    pub declines: Arc<AtomicU64>,
    pub cancellations: Arc<AtomicU64>,
    pub cancellation_failures: Arc<AtomicU64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub redemptions: u64,
    pub redemptions_replayed: u64,
    pub redemption_failures: u64,
    pub allocations: u64,
    pub lock_contention: u64,
    pub approvals: u64,
    pub approval_failures: u64,
    pub declines: u64,
    pub cancellations: u64,
    pub cancellation_failures: u64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        CounterSnapshot {
            redemptions: load(&self.redemptions),
            redemptions_replayed: load(&self.redemptions_replayed),
            redemption_failures: load(&self.redemption_failures),
            allocations: load(&self.allocations),
            lock_contention: load(&self.lock_contention),
            approvals: load(&self.approvals),
            approval_failures: load(&self.approval_failures),
            declines: load(&self.declines),
            cancellations: load(&self.cancellations),
            cancellation_failures: load(&self.cancellation_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_cells() {
        let a = Counters::default();
        let b = a.clone();
        Counters::incr(&a.approvals);
        Counters::incr(&b.approvals);
        Counters::incr(&b.lock_contention);

        let snap = a.snapshot();
        assert_eq!(snap.approvals, 2);
        assert_eq!(snap.lock_contention, 1);
        assert_eq!(snap.redemptions, 0);
    }
}
