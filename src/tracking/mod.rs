//! AR tracking
//!
//! Pose and depth acquisition behind a capability interface, plus the state
//! machine that publishes [`TrackingState`].

pub mod backend;
pub mod depth;
pub mod session;
pub mod types;

pub use backend::{Capability, SimulatedTracker, TrackingBackend, UnsupportedTracker};
pub use session::{Polled, TrackingSession};
pub use types::{
    tracking_state_channel, ArDataPacket, DepthImage, DepthSnapshot, PoseSnapshot, TrackerFrame,
    TrackerSample, TrackingState, TrackingStateHandle, TrackingStatePublisher,
};
