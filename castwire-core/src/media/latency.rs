//! Submit-to-output latency bookkeeping for the decode pipeline.
//!
//! Each submission records `(timestamp, when)`. When the decoder emits
//! a frame with that timestamp the entry is taken and the elapsed time
//! reported. The queue is bounded; the oldest entries are evicted first
//! so a decoder that silently drops frames cannot grow it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded FIFO of outstanding decoder submissions.
pub struct PendingTimestamps {
    /// Entries: `(source timestamp, submitted at)`.
    entries: VecDeque<(i64, Instant)>,
    capacity: usize,
}

impl PendingTimestamps {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a submission at the current instant.
    pub fn record(&mut self, timestamp: i64) {
        self.record_at(timestamp, Instant::now());
    }

    /// Record with an explicit instant (useful for testing).
    pub fn record_at(&mut self, timestamp: i64, when: Instant) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp, when));
    }

    /// Remove the entry for `timestamp` and return the time since it was
    /// submitted.
    pub fn take(&mut self, timestamp: i64) -> Option<Duration> {
        self.take_at(timestamp, Instant::now())
    }

    pub fn take_at(&mut self, timestamp: i64, now: Instant) -> Option<Duration> {
        let pos = self.entries.iter().position(|(ts, _)| *ts == timestamp)?;
        let (_, when) = self.entries.remove(pos)?;
        Some(now.saturating_duration_since(when))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_reports_elapsed() {
        let mut p = PendingTimestamps::new(4);
        let t0 = Instant::now();
        p.record_at(100, t0);
        p.record_at(200, t0);

        let later = t0 + Duration::from_millis(15);
        assert_eq!(p.take_at(200, later), Some(Duration::from_millis(15)));
        assert_eq!(p.take_at(200, later), None);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut p = PendingTimestamps::new(100);
        let t0 = Instant::now();
        for ts in 0..150 {
            p.record_at(ts, t0);
        }
        assert_eq!(p.len(), 100);
        assert_eq!(p.take_at(0, t0), None);
        assert_eq!(p.take_at(49, t0), None);
        assert!(p.take_at(50, t0).is_some());
        assert!(p.take_at(149, t0).is_some());
    }

    #[test]
    fn unknown_timestamp_is_none() {
        let mut p = PendingTimestamps::new(8);
        assert!(p.take(42).is_none());
        assert!(p.is_empty());
    }
}
