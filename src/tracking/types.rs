//! AR data model shared by the tracking, synchronization and mux stages

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Tracking state machine value
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    Initializing = 0,
    Tracking = 1,
    NotTracking = 2,
    Unsupported = 3,
    Error = 4,
}

impl TrackingState {
    /// Unsupported and Error stay put until the session is restarted
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackingState::Unsupported | TrackingState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackingState::Initializing => "initializing",
            TrackingState::Tracking => "tracking",
            TrackingState::NotTracking => "not_tracking",
            TrackingState::Unsupported => "unsupported",
            TrackingState::Error => "error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TrackingState::Initializing,
            1 => TrackingState::Tracking,
            2 => TrackingState::NotTracking,
            3 => TrackingState::Unsupported,
            _ => TrackingState::Error,
        }
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write side of the published tracking state. Not `Clone`: one writer only.
#[derive(Debug)]
pub struct TrackingStatePublisher {
    cell: Arc<AtomicU8>,
}

/// Read side of the published tracking state
#[derive(Debug, Clone)]
pub struct TrackingStateHandle {
    cell: Arc<AtomicU8>,
}

/// Create a publisher/handle pair seeded with `initial`
pub fn tracking_state_channel(
    initial: TrackingState,
) -> (TrackingStatePublisher, TrackingStateHandle) {
    let cell = Arc::new(AtomicU8::new(initial as u8));
    (
        TrackingStatePublisher { cell: cell.clone() },
        TrackingStateHandle { cell },
    )
}

impl TrackingStatePublisher {
    pub fn set(&self, state: TrackingState) {
        let previous = self.cell.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            tracing::info!(
                from = %TrackingState::from_u8(previous),
                to = %state,
                "Tracking state changed"
            );
        }
    }

    pub fn get(&self) -> TrackingState {
        TrackingState::from_u8(self.cell.load(Ordering::Acquire))
    }

    pub fn handle(&self) -> TrackingStateHandle {
        TrackingStateHandle {
            cell: self.cell.clone(),
        }
    }
}

impl TrackingStateHandle {
    pub fn get(&self) -> TrackingState {
        TrackingState::from_u8(self.cell.load(Ordering::Acquire))
    }
}

/// Camera pose at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSnapshot {
    /// Session clock nanoseconds
    pub timestamp_nanos: i64,
    /// Position in meters `[x, y, z]`
    pub translation: [f32; 3],
    /// Orientation quaternion `[qx, qy, qz, qw]`
    pub rotation: [f32; 4],
}

impl PoseSnapshot {
    pub fn identity(timestamp_nanos: i64) -> Self {
        Self {
            timestamp_nanos,
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Raw 16-bit depth map as handed out by a backend.
///
/// Consumed (compressed) in the poll cycle that produced it.
#[derive(Debug)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    /// Row-major depth in millimeters
    pub samples: Vec<u16>,
}

/// Depth map attached to an AR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthSnapshot {
    pub width: u32,
    pub height: u32,
    /// Gzip-compressed little-endian DEPTH16 samples, absent when over the size cap
    pub samples: Option<Bytes>,
}

/// One update from a tracking backend
#[derive(Debug)]
pub struct TrackerFrame {
    pub pose: PoseSnapshot,
    /// Whether the backend considers the camera tracked in this frame
    pub tracked: bool,
    pub depth: Option<DepthImage>,
}

/// Pose plus compressed depth, as consumed by the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSample {
    pub pose: PoseSnapshot,
    pub depth: Option<DepthSnapshot>,
}

/// AR metadata for one synchronized camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct ArDataPacket {
    pub timestamp_nanos: i64,
    /// Starts at 0 and strictly increases for the lifetime of a session
    pub sequence: u64,
    pub pose: PoseSnapshot,
    pub depth: Option<DepthSnapshot>,
}

impl ArDataPacket {
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_nanos / 1_000
    }
}
