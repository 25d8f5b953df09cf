//! RTSP/1.0 server
//!
//! Control requests and, for TCP clients, RTP media share one connection per
//! client. Each connection runs in its own task and reads stream units from
//! a private bounded queue, so a stalled viewer never holds up the others.

mod client;
pub mod queue;
pub mod request;
pub mod rtp;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;

pub use queue::{ClientQueue, QueuedUnit};
pub use request::{parse_message, Incoming, Method, RtspRequest, RtspResponse};
pub use rtp::{RtpHeader, RtpPacketizer};
pub use server::{StreamDistributor, StreamServer};
pub use session::{ClientSession, ProtocolState};
pub use status::{ServerStatus, StatusHandle, StatusPublisher};
pub use transport::{parse_transport, TrackTransport, TransportRequest};
