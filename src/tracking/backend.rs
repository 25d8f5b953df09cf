//! Tracking backends
//!
//! The pipeline never talks to a tracking SDK directly. Everything goes through
//! [`TrackingBackend`], which ships in two flavours here: a deterministic
//! simulator (used by tests and headless hosts) and a backend that always
//! reports the device as unsupported.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;

use super::types::{DepthImage, PoseSnapshot, TrackerFrame};
use crate::clock::SessionClock;
use crate::error::TrackingError;

/// Result of a capability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Ready to start
    Available,
    /// Not ready yet (e.g. still installing or busy), worth retrying
    Transient(String),
    /// Permanently incapable
    Unsupported(String),
}

/// Capability interface implemented by every tracking provider
pub trait TrackingBackend: Send {
    /// Human readable backend name for logs
    fn name(&self) -> &str;

    /// Probe whether the device can track at all
    fn check_capability(&mut self) -> Capability;

    /// Acquire tracking resources
    fn start(&mut self) -> Result<(), TrackingError>;

    /// Non-blocking. `Ok(None)` means nothing new since the last call.
    fn poll(&mut self) -> Result<Option<TrackerFrame>, TrackingError>;

    /// Release tracking resources. Must tolerate being called when not started.
    fn stop(&mut self);
}

/// Backend for devices without tracking hardware
pub struct UnsupportedTracker {
    reason: String,
}

impl UnsupportedTracker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl TrackingBackend for UnsupportedTracker {
    fn name(&self) -> &str {
        "unsupported"
    }

    fn check_capability(&mut self) -> Capability {
        Capability::Unsupported(self.reason.clone())
    }

    fn start(&mut self) -> Result<(), TrackingError> {
        Err(TrackingError::Unsupported(self.reason.clone()))
    }

    fn poll(&mut self) -> Result<Option<TrackerFrame>, TrackingError> {
        Ok(None)
    }

    fn stop(&mut self) {}
}

/// Deterministic tracker that orbits the origin.
///
/// Emits a pose every `period`, optionally with a synthetic depth map, and
/// reports tracking loss inside the configured windows.
pub struct SimulatedTracker {
    clock: SessionClock,
    period: Duration,
    radius: f32,
    depth_size: Option<(u32, u32)>,
    capability_script: VecDeque<Capability>,
    lost_windows: Vec<Range<i64>>,
    last_emit_nanos: Option<i64>,
    frames_emitted: u64,
    running: bool,
}

impl SimulatedTracker {
    pub fn new(clock: SessionClock) -> Self {
        Self {
            clock,
            period: Duration::from_micros(16_667),
            radius: 1.0,
            depth_size: None,
            capability_script: VecDeque::new(),
            lost_windows: Vec::new(),
            last_emit_nanos: None,
            frames_emitted: 0,
            running: false,
        }
    }

    /// Pose update rate
    pub fn with_rate_hz(mut self, hz: f32) -> Self {
        self.period = Duration::from_secs_f32(1.0 / hz.max(1.0));
        self
    }

    /// Emit a depth map of the given size with every pose
    pub fn with_depth(mut self, width: u32, height: u32) -> Self {
        self.depth_size = Some((width, height));
        self
    }

    /// Answers returned by successive capability checks before `Available`
    pub fn with_capability_script(mut self, script: Vec<Capability>) -> Self {
        self.capability_script = script.into();
        self
    }

    /// Report tracking loss for session times inside `window` (nanoseconds)
    pub fn with_tracking_loss(mut self, window: Range<i64>) -> Self {
        self.lost_windows.push(window);
        self
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    fn pose_at(&self, timestamp_nanos: i64) -> PoseSnapshot {
        let t = timestamp_nanos as f32 / 1e9;
        let angle = t * 0.5;
        let (sin_half, cos_half) = (angle / 2.0).sin_cos();
        PoseSnapshot {
            timestamp_nanos,
            translation: [self.radius * angle.cos(), 1.5, self.radius * angle.sin()],
            rotation: [0.0, sin_half, 0.0, cos_half],
        }
    }

    fn depth_map(&self, width: u32, height: u32) -> DepthImage {
        let phase = (self.frames_emitted % 500) as u32;
        let samples = (0..height)
            .flat_map(|y| (0..width).map(move |x| (800 + (x + y + phase) % 1200) as u16))
            .collect();
        DepthImage {
            width,
            height,
            samples,
        }
    }
}

impl TrackingBackend for SimulatedTracker {
    fn name(&self) -> &str {
        "simulated"
    }

    fn check_capability(&mut self) -> Capability {
        self.capability_script
            .pop_front()
            .unwrap_or(Capability::Available)
    }

    fn start(&mut self) -> Result<(), TrackingError> {
        self.running = true;
        self.last_emit_nanos = None;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<TrackerFrame>, TrackingError> {
        if !self.running {
            return Err(TrackingError::Backend("simulator not started".into()));
        }

        let now = self.clock.now_nanos();
        if let Some(last) = self.last_emit_nanos {
            if now - last < self.period.as_nanos() as i64 {
                return Ok(None);
            }
        }
        self.last_emit_nanos = Some(now);

        let tracked = !self.lost_windows.iter().any(|w| w.contains(&now));
        let depth = self.depth_size.map(|(w, h)| self.depth_map(w, h));
        self.frames_emitted += 1;

        Ok(Some(TrackerFrame {
            pose: self.pose_at(now),
            tracked,
            depth,
        }))
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_rate_limits() {
        let mut tracker = SimulatedTracker::new(SessionClock::new()).with_rate_hz(1.0);
        tracker.start().unwrap();

        assert!(tracker.poll().unwrap().is_some());
        // Second poll inside the same period yields nothing new
        assert!(tracker.poll().unwrap().is_none());
        assert_eq!(tracker.frames_emitted(), 1);
    }

    #[test]
    fn test_simulator_requires_start() {
        let mut tracker = SimulatedTracker::new(SessionClock::new());
        assert!(tracker.poll().is_err());
    }

    #[test]
    fn test_simulator_depth_and_loss() {
        let mut tracker = SimulatedTracker::new(SessionClock::new())
            .with_depth(8, 4)
            .with_tracking_loss(0..i64::MAX);
        tracker.start().unwrap();

        let frame = tracker.poll().unwrap().unwrap();
        assert!(!frame.tracked);
        let depth = frame.depth.unwrap();
        assert_eq!(depth.samples.len(), 32);
    }

    #[test]
    fn test_unit_quaternion() {
        let tracker = SimulatedTracker::new(SessionClock::new());
        let pose = tracker.pose_at(3_000_000_000);
        let norm: f32 = pose.rotation.iter().map(|c| c * c).sum();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_capability_script() {
        let mut tracker = SimulatedTracker::new(SessionClock::new())
            .with_capability_script(vec![Capability::Transient("busy".into())]);
        assert_eq!(tracker.check_capability(), Capability::Transient("busy".into()));
        assert_eq!(tracker.check_capability(), Capability::Available);
    }
}
