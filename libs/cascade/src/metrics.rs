//! Array-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by an array and the components layered on it
#[derive(Debug, Default)]
pub struct ArrayMetrics {
    pub systems_joined: AtomicU64,
    pub systems_departed: AtomicU64,
    pub rounds_started: AtomicU64,
    pub rounds_completed: AtomicU64,
    pub replies_accepted: AtomicU64,
    pub replies_discarded: AtomicU64,
    pub pieces_lost: AtomicU64,
    pub invokes_forwarded: AtomicU64,
    pub invokes_unhandled: AtomicU64,
    pub invokes_dropped: AtomicU64,
}

impl ArrayMetrics {
    pub fn record_round_completed(&self, lost_pieces: u64) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        self.pieces_lost.fetch_add(lost_pieces, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> ArrayStats {
        ArrayStats {
            systems_joined: self.systems_joined.load(Ordering::Relaxed),
            systems_departed: self.systems_departed.load(Ordering::Relaxed),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            replies_accepted: self.replies_accepted.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            pieces_lost: self.pieces_lost.load(Ordering::Relaxed),
            invokes_forwarded: self.invokes_forwarded.load(Ordering::Relaxed),
            invokes_unhandled: self.invokes_unhandled.load(Ordering::Relaxed),
            invokes_dropped: self.invokes_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ArrayMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrayStats {
    pub systems_joined: u64,
    pub systems_departed: u64,
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub replies_accepted: u64,
    pub replies_discarded: u64,
    pub pieces_lost: u64,
    pub invokes_forwarded: u64,
    pub invokes_unhandled: u64,
    pub invokes_dropped: u64,
}

impl ArrayStats {
    /// Systems currently counted as members
    pub fn active_systems(&self) -> u64 {
        self.systems_joined.saturating_sub(self.systems_departed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ArrayMetrics::default();
        ArrayMetrics::bump(&metrics.systems_joined);
        ArrayMetrics::bump(&metrics.systems_joined);
        ArrayMetrics::bump(&metrics.systems_departed);
        metrics.record_round_completed(3);

        let stats = metrics.snapshot();
        assert_eq!(stats.active_systems(), 1);
        assert_eq!(stats.rounds_completed, 1);
        assert_eq!(stats.pieces_lost, 3);
        assert_eq!(stats.invokes_forwarded, 0);
    }
}
