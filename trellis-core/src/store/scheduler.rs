//! Deferred commit scheduling.
//!
//! Every scheduled flush is stamped with a generation. Scheduling again, or
//! flushing by hand, moves the generation on, so only the most recently
//! scheduled flush still finds itself current when it wakes up.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    generation: AtomicU64,
}

impl Scheduler {
    /// Claim a new generation for a flush about to be scheduled.
    pub(crate) fn schedule(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Invalidate every scheduled flush.
    pub(crate) fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_latest_generation_is_current() {
        let scheduler = Scheduler::default();
        let first = scheduler.schedule();
        let second = scheduler.schedule();
        assert!(!scheduler.is_current(first));
        assert!(scheduler.is_current(second));

        scheduler.cancel();
        assert!(!scheduler.is_current(second));
    }
}
