//! Timestamp ordering across media inputs
//!
//! Video and audio are encoded in separate contexts and reach the muxer in
//! arbitrary interleavings. The scheduler holds units back for a short window
//! and releases them in non-decreasing timestamp order. A unit that arrives
//! after something newer was already released is dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use super::muxer::StreamUnit;

struct Pending {
    timestamp: i64,
    arrival: u64,
    unit: StreamUnit,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed: BinaryHeap is a max-heap, we want the oldest first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub emitted: u64,
    pub late_dropped: u64,
}

pub struct MuxScheduler {
    window_micros: i64,
    heap: BinaryHeap<Pending>,
    arrivals: u64,
    last_emitted: Option<i64>,
    stats: SchedulerStats,
}

impl MuxScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window_micros: window.as_micros() as i64,
            heap: BinaryHeap::new(),
            arrivals: 0,
            last_emitted: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Queue a unit. Returns false when it was too late to keep order.
    pub fn push(&mut self, unit: StreamUnit) -> bool {
        let timestamp = unit.timestamp_micros();
        if self.last_emitted.is_some_and(|last| timestamp < last) {
            self.stats.late_dropped += 1;
            tracing::debug!(
                timestamp,
                last = self.last_emitted,
                "Dropping late unit"
            );
            return false;
        }

        self.heap.push(Pending {
            timestamp,
            arrival: self.arrivals,
            unit,
        });
        self.arrivals += 1;
        true
    }

    /// Release every unit older than `now_micros - window`
    pub fn pop_ready(&mut self, now_micros: i64) -> Vec<StreamUnit> {
        let horizon = now_micros - self.window_micros;
        let mut ready = Vec::new();
        while self.heap.peek().is_some_and(|p| p.timestamp <= horizon) {
            if let Some(pending) = self.heap.pop() {
                ready.push(self.emit(pending));
            }
        }
        ready
    }

    /// Release everything regardless of age
    pub fn flush(&mut self) -> Vec<StreamUnit> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(pending) = self.heap.pop() {
            out.push(self.emit(pending));
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    fn emit(&mut self, pending: Pending) -> StreamUnit {
        self.last_emitted = Some(pending.timestamp);
        self.stats.emitted += 1;
        pending.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodedUnit;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn video(ts: i64) -> StreamUnit {
        StreamUnit::new(Some(EncodedUnit::video(Bytes::new(), ts, false)), None, None).unwrap()
    }

    fn audio(ts: i64) -> StreamUnit {
        StreamUnit::new(None, Some(EncodedUnit::audio(Bytes::new(), ts)), None).unwrap()
    }

    #[test]
    fn test_reorders_within_window() {
        let mut scheduler = MuxScheduler::new(Duration::from_millis(40));
        scheduler.push(video(30_000));
        scheduler.push(audio(10_000));
        scheduler.push(audio(20_000));

        // Nothing old enough yet
        assert!(scheduler.pop_ready(45_000).is_empty());

        let out: Vec<i64> = scheduler
            .pop_ready(75_000)
            .iter()
            .map(|u| u.timestamp_micros())
            .collect();
        assert_eq!(out, vec![10_000, 20_000, 30_000]);
    }

    #[test]
    fn test_late_units_dropped() {
        let mut scheduler = MuxScheduler::new(Duration::ZERO);
        scheduler.push(video(100));
        assert_eq!(scheduler.pop_ready(100).len(), 1);

        assert!(!scheduler.push(audio(50)));
        assert!(scheduler.push(audio(100)));
        assert_eq!(scheduler.stats().late_dropped, 1);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut scheduler = MuxScheduler::new(Duration::ZERO);
        scheduler.push(video(5));
        scheduler.push(audio(5));
        let out = scheduler.flush();
        assert!(out[0].video().is_some());
        assert!(out[1].audio().is_some());
    }

    proptest! {
        #[test]
        fn prop_emission_is_non_decreasing(
            stamps in proptest::collection::vec(0i64..100_000, 1..200),
            window_ms in 0u64..50,
        ) {
            let mut scheduler = MuxScheduler::new(Duration::from_millis(window_ms));
            let mut emitted = Vec::new();
            let mut clock = 0i64;
            for ts in stamps {
                scheduler.push(video(ts));
                clock += 1_000;
                emitted.extend(scheduler.pop_ready(clock));
            }
            emitted.extend(scheduler.flush());

            let times: Vec<i64> = emitted.iter().map(|u| u.timestamp_micros()).collect();
            prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
            let stats = scheduler.stats();
            prop_assert_eq!(stats.emitted as usize, times.len());
        }
    }
}
