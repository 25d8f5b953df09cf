//! Multiplexing and session description
//!
//! Encoded media and AR packets are combined into [`StreamUnit`]s, put back in
//! timestamp order by [`MuxScheduler`] and described to clients through
//! [`SessionDescription`].

pub mod ar_json;
pub mod muxer;
pub mod scheduler;
pub mod sdp;

pub use ar_json::{decode_ar_packet, encode_ar_packet};
pub use muxer::{DataMuxer, StreamUnit};
pub use scheduler::{MuxScheduler, SchedulerStats};
pub use sdp::{describe_session, SessionDescription, SessionOrigin, TrackDescription, TrackKind};
