//! # AR Streamer
//!
//! Real-time RTSP streaming of camera frames annotated with AR pose and depth
//! telemetry, advertised on the local network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 DEVICE                                      │
//! │  ┌──────────────┐        ┌──────────────┐             ┌──────────────┐      │
//! │  │   Tracking   │        │    Camera    │             │  Microphone  │      │
//! │  │   Thread     │        │    Thread    │             │   (cpal)     │      │
//! │  └──────┬───────┘        └──────┬───────┘             └──────┬───────┘      │
//! │         │ poses + depth         │ LatestSlot (depth 1)       │ RingBuffer   │
//! │         ▼                       ▼                            ▼              │
//! │  ┌──────────────────────────────────────────┐        ┌──────────────┐       │
//! │  │  Video Thread                            │        │ Audio Thread │       │
//! │  │  FrameSynchronizer ──▶ H.264 Encoder     │        │ Opus Encoder │       │
//! │  └──────────────────────┬───────────────────┘        └──────┬───────┘       │
//! │                         │ video + AR                        │ audio         │
//! │                         ▼                                   ▼               │
//! │  ┌─────────────────────────────────────────────────────────────────────┐    │
//! │  │            Muxer Task (mux::scheduler) - timestamp ordered          │    │
//! │  └──────────────────────────────────┬──────────────────────────────────┘    │
//! │                                     ▼                                       │
//! │  ┌─────────────────────────────────────────────────────────────────────┐    │
//! │  │          StreamDistributor - one drop-oldest queue per client       │    │
//! │  └──────┬──────────────────────────┬──────────────────────────┬────────┘    │
//! │         ▼                          ▼                          ▼             │
//! │  ┌─────────────┐            ┌─────────────┐            ┌─────────────┐      │
//! │  │ Client Task │            │ Client Task │            │ Client Task │      │
//! │  │ RTSP + RTP  │            │ RTSP + RTP  │            │ RTSP + RTP  │      │
//! │  └──────┬──────┘            └──────┬──────┘            └──────┬──────┘      │
//! └─────────┼──────────────────────────┼──────────────────────────┼─────────────┘
//!           │ TCP interleaved / UDP    │                          │
//!           ▼                          ▼                          ▼
//!        viewer                     viewer                     viewer
//! ```
//!
//! The mDNS advertiser runs beside the pipeline and only reads the bound
//! server address.

pub mod capture;
pub mod clock;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod rtsp;
pub mod tracking;
pub mod ui;

pub use config::{AppConfig, StreamConfig, StreamMode};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::Pipeline;

/// Application-wide constants
pub mod constants {
    /// Default RTSP port
    pub const DEFAULT_RTSP_PORT: u16 = 8086;

    /// Default HTTP status port
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Path component of the stream URL
    pub const STREAM_PATH: &str = "stream";

    /// mDNS service type for the stream endpoint
    pub const SERVICE_TYPE: &str = "_rtsp._tcp.local.";

    /// Default advertised service instance name
    pub const DEFAULT_SERVICE_NAME: &str = "ArStreamer";

    /// Default RTP packet size (MTU - IP/UDP headers, with headroom)
    pub const DEFAULT_RTP_MTU: usize = 1400;

    /// Largest payload an interleaved RTP frame can carry ($ framing length is u16)
    pub const MAX_INTERLEAVED_PACKET: usize = u16::MAX as usize;

    /// Per-client outbound queue capacity (in stream units)
    pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 64;

    /// RTSP session idle timeout in seconds
    pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

    /// Opus always runs its RTP clock at 48 kHz (RFC 7587)
    pub const OPUS_RTP_CLOCK: u32 = 48_000;

    /// RTP clock rate for video and AR tracks
    pub const VIDEO_RTP_CLOCK: u32 = 90_000;

    /// Capture rates the Opus encoder accepts; audio is never resampled
    pub const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

    /// Opus frame duration used by the audio encoder
    pub const AUDIO_FRAME_MS: u32 = 20;

    /// Audio ring buffer capacity (in capture chunks)
    pub const RING_BUFFER_CAPACITY: usize = 256;

    /// Number of tracker samples kept for frame synchronization
    pub const POSE_HISTORY_CAPACITY: usize = 64;

    /// Upper bound on compressed depth payloads
    pub const DEFAULT_MAX_DEPTH_BYTES: usize = 48 * 1024;
}
