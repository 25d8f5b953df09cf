//! Media encoding
//!
//! [`EncodingStage`] owns one encoder and enforces its lifecycle. Video goes
//! through [`VideoEncoder`] (H.264 via openh264), audio through
//! [`AudioEncoder`] (Opus).

pub mod audio;
#[cfg(feature = "h264")]
pub mod h264;
pub mod stage;
pub mod video;

use bytes::Bytes;

use crate::error::CodecError;

pub use audio::{AudioCodec, AudioEncoder, OpusCodec};
#[cfg(feature = "h264")]
pub use h264::H264Codec;
pub use stage::{EncodingStage, StageState};
pub use video::{CodedPicture, VideoCodec, VideoEncoder};

/// Media type of an encoded unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One compressed access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub kind: MediaKind,
    pub payload: Bytes,
    /// Session clock microseconds of the first sample / exposure
    pub timestamp_micros: i64,
    pub is_key_frame: bool,
}

impl EncodedUnit {
    pub fn video(payload: Bytes, timestamp_micros: i64, is_key_frame: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            payload,
            timestamp_micros,
            is_key_frame,
        }
    }

    pub fn audio(payload: Bytes, timestamp_micros: i64) -> Self {
        Self {
            kind: MediaKind::Audio,
            payload,
            timestamp_micros,
            is_key_frame: true,
        }
    }
}

/// An encoder driven by [`EncodingStage`]
pub trait MediaEncoder {
    type Input;

    fn kind(&self) -> MediaKind;

    /// Encode one input. May return zero or more units.
    fn encode(&mut self, input: Self::Input) -> Result<Vec<EncodedUnit>, CodecError>;

    /// Emit everything still buffered inside the encoder
    fn flush(&mut self) -> Result<Vec<EncodedUnit>, CodecError>;
}

/// Encoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderStats {
    pub units_encoded: u64,
    pub bytes_produced: u64,
    pub key_frames: u64,
}

impl EncoderStats {
    pub(crate) fn record(&mut self, unit: &EncodedUnit) {
        self.units_encoded += 1;
        self.bytes_produced += unit.payload.len() as u64;
        if unit.is_key_frame && unit.kind == MediaKind::Video {
            self.key_frames += 1;
        }
    }

    pub fn average_unit_size(&self) -> f32 {
        if self.units_encoded == 0 {
            0.0
        } else {
            self.bytes_produced as f32 / self.units_encoded as f32
        }
    }
}
