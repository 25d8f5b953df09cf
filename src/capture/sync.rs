//! Frame and pose synchronization
//!
//! Pairs each camera frame with the newest tracker sample taken at or before
//! the frame's exposure. Frames without a usable pose still flow, just without
//! AR data.

use std::collections::VecDeque;
use std::time::Duration;

use super::frame::RawFrame;
use crate::constants::POSE_HISTORY_CAPACITY;
use crate::tracking::{ArDataPacket, TrackerSample, TrackingState};

/// A camera frame and the AR packet that goes with it
#[derive(Debug, Clone)]
pub struct SyncedFrame {
    pub frame: RawFrame,
    pub ar: Option<ArDataPacket>,
}

/// Synchronization counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub matched: u64,
    pub unmatched: u64,
}

pub struct FrameSynchronizer {
    history: VecDeque<TrackerSample>,
    capacity: usize,
    tolerance: Option<Duration>,
    next_sequence: u64,
    stats: SyncStats,
}

impl FrameSynchronizer {
    /// `tolerance` bounds how stale a pose may be; `None` accepts any age
    pub fn new(tolerance: Option<Duration>) -> Self {
        Self::with_capacity(tolerance, POSE_HISTORY_CAPACITY)
    }

    pub fn with_capacity(tolerance: Option<Duration>, capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            tolerance,
            next_sequence: 0,
            stats: SyncStats::default(),
        }
    }

    /// Record a tracker sample. History stays sorted by timestamp.
    pub fn push_sample(&mut self, sample: TrackerSample) {
        let ts = sample.pose.timestamp_nanos;
        match self.history.back() {
            Some(last) if last.pose.timestamp_nanos == ts => {
                if let Some(slot) = self.history.back_mut() {
                    *slot = sample;
                }
            }
            Some(last) if last.pose.timestamp_nanos > ts => {
                let pos = self
                    .history
                    .partition_point(|s| s.pose.timestamp_nanos <= ts);
                self.history.insert(pos, sample);
            }
            _ => self.history.push_back(sample),
        }

        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// Attach AR data to `frame` when tracking is good and a pose matches.
    ///
    /// Sequence numbers are consumed only by emitted packets.
    pub fn synchronize(
        &mut self,
        frame: RawFrame,
        state: TrackingState,
        include_depth: bool,
    ) -> SyncedFrame {
        let matched = if state == TrackingState::Tracking {
            self.find_sample(frame.timestamp_nanos).cloned()
        } else {
            None
        };

        let ar = matched.map(|sample| {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            ArDataPacket {
                timestamp_nanos: frame.timestamp_nanos,
                sequence,
                pose: sample.pose,
                depth: if include_depth { sample.depth } else { None },
            }
        });

        if ar.is_some() {
            self.stats.matched += 1;
        } else {
            self.stats.unmatched += 1;
            tracing::trace!(frame_ts = frame.timestamp_nanos, %state, "Frame sent without AR data");
        }

        SyncedFrame { frame, ar }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Sequence the next emitted packet will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn find_sample(&self, frame_ts: i64) -> Option<&TrackerSample> {
        let idx = self
            .history
            .partition_point(|s| s.pose.timestamp_nanos <= frame_ts);
        let sample = self.history.get(idx.checked_sub(1)?)?;

        match self.tolerance {
            Some(tol) if frame_ts - sample.pose.timestamp_nanos > tol.as_nanos() as i64 => None,
            _ => Some(sample),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{DepthSnapshot, PoseSnapshot};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn frame(ts: i64) -> RawFrame {
        RawFrame {
            width: 2,
            height: 2,
            timestamp_nanos: ts,
            index: 0,
            data: Bytes::from(vec![0u8; 12]),
        }
    }

    fn sample(ts: i64) -> TrackerSample {
        TrackerSample {
            pose: PoseSnapshot::identity(ts),
            depth: Some(DepthSnapshot {
                width: 1,
                height: 1,
                samples: None,
            }),
        }
    }

    #[test]
    fn test_picks_latest_at_or_before_frame() {
        let mut sync = FrameSynchronizer::new(None);
        sync.push_sample(sample(100));
        sync.push_sample(sample(200));
        sync.push_sample(sample(300));

        let out = sync.synchronize(frame(250), TrackingState::Tracking, false);
        let ar = out.ar.unwrap();
        assert_eq!(ar.pose.timestamp_nanos, 200);
        assert_eq!(ar.timestamp_nanos, 250);
        assert!(ar.depth.is_none());

        let exact = sync.synchronize(frame(300), TrackingState::Tracking, true);
        assert_eq!(exact.ar.unwrap().pose.timestamp_nanos, 300);
    }

    #[test]
    fn test_no_pose_before_frame() {
        let mut sync = FrameSynchronizer::new(None);
        sync.push_sample(sample(500));
        let out = sync.synchronize(frame(100), TrackingState::Tracking, false);
        assert!(out.ar.is_none());
        assert_eq!(sync.next_sequence(), 0);
    }

    #[test]
    fn test_tolerance_rejects_stale_pose() {
        let mut sync = FrameSynchronizer::new(Some(Duration::from_nanos(50)));
        sync.push_sample(sample(100));
        assert!(sync
            .synchronize(frame(200), TrackingState::Tracking, false)
            .ar
            .is_none());
        assert!(sync
            .synchronize(frame(150), TrackingState::Tracking, false)
            .ar
            .is_some());
    }

    #[test]
    fn test_not_tracking_sends_video_only() {
        let mut sync = FrameSynchronizer::new(None);
        sync.push_sample(sample(100));
        for state in [
            TrackingState::Initializing,
            TrackingState::NotTracking,
            TrackingState::Unsupported,
            TrackingState::Error,
        ] {
            let out = sync.synchronize(frame(200), state, false);
            assert!(out.ar.is_none());
            assert_eq!(out.frame.timestamp_nanos, 200);
        }
        assert_eq!(sync.stats().unmatched, 4);
        assert_eq!(sync.next_sequence(), 0);
    }

    #[test]
    fn test_out_of_order_sample_inserted_sorted() {
        let mut sync = FrameSynchronizer::new(None);
        sync.push_sample(sample(300));
        sync.push_sample(sample(100));
        let out = sync.synchronize(frame(200), TrackingState::Tracking, false);
        assert_eq!(out.ar.unwrap().pose.timestamp_nanos, 100);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sync = FrameSynchronizer::with_capacity(None, 2);
        sync.push_sample(sample(100));
        sync.push_sample(sample(200));
        sync.push_sample(sample(300));
        // 100 was evicted
        assert!(sync
            .synchronize(frame(150), TrackingState::Tracking, false)
            .ar
            .is_none());
    }

    proptest! {
        #[test]
        fn prop_sequences_start_at_zero_and_increase(
            samples in proptest::collection::vec(0i64..10_000, 1..40),
            frames in proptest::collection::vec(0i64..10_000, 1..40),
            tracking in proptest::collection::vec(any::<bool>(), 40),
        ) {
            let mut sync = FrameSynchronizer::new(None);
            for ts in &samples {
                sync.push_sample(sample(*ts));
            }

            let mut expected = 0u64;
            for (i, ts) in frames.iter().enumerate() {
                let state = if tracking[i] { TrackingState::Tracking } else { TrackingState::NotTracking };
                let out = sync.synchronize(frame(*ts), state, false);
                if let Some(ar) = out.ar {
                    prop_assert!(state == TrackingState::Tracking);
                    prop_assert_eq!(ar.sequence, expected);
                    prop_assert!(ar.pose.timestamp_nanos <= *ts);
                    expected += 1;
                }
            }
        }

        #[test]
        fn prop_chosen_pose_is_latest_not_after_frame(
            samples in proptest::collection::vec(0i64..10_000, 1..40),
            frame_ts in 0i64..10_000,
        ) {
            let mut sync = FrameSynchronizer::with_capacity(None, 64);
            for ts in &samples {
                sync.push_sample(sample(*ts));
            }
            let best = samples.iter().copied().filter(|ts| *ts <= frame_ts).max();
            let out = sync.synchronize(frame(frame_ts), TrackingState::Tracking, false);
            prop_assert_eq!(out.ar.map(|a| a.pose.timestamp_nanos), best);
        }
    }
}
