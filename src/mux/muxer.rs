//! Stream units

use crate::codec::{EncodedUnit, MediaKind};
use crate::tracking::ArDataPacket;

/// Everything sent to clients for one instant.
///
/// Never empty: the only constructor refuses a unit without any payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUnit {
    video: Option<EncodedUnit>,
    audio: Option<EncodedUnit>,
    ar: Option<ArDataPacket>,
}

impl StreamUnit {
    pub fn new(
        video: Option<EncodedUnit>,
        audio: Option<EncodedUnit>,
        ar: Option<ArDataPacket>,
    ) -> Option<Self> {
        if video.is_none() && audio.is_none() && ar.is_none() {
            return None;
        }
        Some(Self { video, audio, ar })
    }

    pub fn video(&self) -> Option<&EncodedUnit> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&EncodedUnit> {
        self.audio.as_ref()
    }

    pub fn ar(&self) -> Option<&ArDataPacket> {
        self.ar.as_ref()
    }

    /// Presentation time in session microseconds, taken from the first present
    /// part in video, audio, AR order
    pub fn timestamp_micros(&self) -> i64 {
        self.video
            .as_ref()
            .map(|v| v.timestamp_micros)
            .or_else(|| self.audio.as_ref().map(|a| a.timestamp_micros))
            .or_else(|| self.ar.as_ref().map(|ar| ar.timestamp_micros()))
            .unwrap_or_default()
    }

    pub fn is_key_frame(&self) -> bool {
        self.video.as_ref().is_some_and(|v| v.is_key_frame)
    }

    /// Total payload bytes carried
    pub fn payload_len(&self) -> usize {
        self.video.as_ref().map_or(0, |v| v.payload.len())
            + self.audio.as_ref().map_or(0, |a| a.payload.len())
    }
}

/// Combines encoded media and AR data into stream units
pub struct DataMuxer;

impl DataMuxer {
    /// Pure combination, timestamps untouched.
    ///
    /// Units of the wrong kind are discarded rather than misfiled.
    pub fn combine(
        video: Option<EncodedUnit>,
        audio: Option<EncodedUnit>,
        ar: Option<ArDataPacket>,
    ) -> Option<StreamUnit> {
        let video = video.filter(|v| v.kind == MediaKind::Video);
        let audio = audio.filter(|a| a.kind == MediaKind::Audio);
        StreamUnit::new(video, audio, ar)
    }
}
