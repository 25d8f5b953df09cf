//! Video encoding with a fixed key frame cadence

use bytes::Bytes;

use super::{EncodedUnit, MediaEncoder, MediaKind};
use crate::capture::RawFrame;
use crate::config::VideoSettings;
use crate::error::CodecError;

/// Output of a single [`VideoCodec::encode`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedPicture {
    /// Annex B byte stream for the whole picture
    pub data: Bytes,
    pub is_key: bool,
}

/// A concrete video codec
pub trait VideoCodec {
    fn name(&self) -> &str;

    /// Encode one RGB24 frame. `None` when rate control skipped it.
    fn encode(&mut self, frame: &RawFrame, force_key: bool) -> Result<Option<CodedPicture>, CodecError>;

    /// Pictures still held by the codec
    fn flush(&mut self) -> Result<Vec<CodedPicture>, CodecError>;
}

/// Enforces the key frame policy on top of a [`VideoCodec`].
///
/// The first frame and every `fps * keyframe_interval_secs`-th frame after the
/// previous key frame are forced to be key frames.
pub struct VideoEncoder {
    codec: Box<dyn VideoCodec>,
    width: u32,
    height: u32,
    keyframe_interval: u32,
    frames_since_key: Option<u32>,
    last_timestamp_micros: i64,
}

impl VideoEncoder {
    pub fn new(codec: Box<dyn VideoCodec>, settings: &VideoSettings) -> Self {
        Self {
            codec,
            width: settings.width,
            height: settings.height,
            keyframe_interval: settings.keyframe_interval_frames(),
            frames_since_key: None,
            last_timestamp_micros: 0,
        }
    }

    pub fn codec_name(&self) -> &str {
        self.codec.name()
    }

    fn key_due(&self) -> bool {
        self.frames_since_key
            .map_or(true, |n| n >= self.keyframe_interval)
    }
}

impl MediaEncoder for VideoEncoder {
    type Input = RawFrame;

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn encode(&mut self, frame: RawFrame) -> Result<Vec<EncodedUnit>, CodecError> {
        if frame.width != self.width || frame.height != self.height || !frame.is_well_formed() {
            return Err(CodecError::InvalidFrameSize(frame.data.len()));
        }

        let force_key = self.key_due();
        let picture = self.codec.encode(&frame, force_key)?;
        self.last_timestamp_micros = frame.timestamp_micros();

        let Some(picture) = picture else {
            // A skipped frame still counts toward the interval unless a key was pending
            if let Some(n) = self.frames_since_key.as_mut() {
                if !force_key {
                    *n += 1;
                }
            }
            return Ok(Vec::new());
        };

        self.frames_since_key = Some(if picture.is_key {
            1
        } else {
            self.frames_since_key.unwrap_or(0) + 1
        });

        Ok(vec![EncodedUnit::video(
            picture.data,
            frame.timestamp_micros(),
            picture.is_key,
        )])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, CodecError> {
        let timestamp = self.last_timestamp_micros;
        Ok(self
            .codec
            .flush()?
            .into_iter()
            .map(|p| EncodedUnit::video(p.data, timestamp, p.is_key))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Emits one byte per frame, key only when asked
    pub(crate) struct ScriptedCodec {
        pub skip_every: Option<u64>,
        pub seen: u64,
    }

    impl ScriptedCodec {
        pub(crate) fn new() -> Self {
            Self {
                skip_every: None,
                seen: 0,
            }
        }
    }

    impl VideoCodec for ScriptedCodec {
        fn name(&self) -> &str {
            "scripted"
        }

        fn encode(&mut self, _frame: &RawFrame, force_key: bool) -> Result<Option<CodedPicture>, CodecError> {
            self.seen += 1;
            if self.skip_every.is_some_and(|n| self.seen % n == 0) {
                return Ok(None);
            }
            Ok(Some(CodedPicture {
                data: Bytes::from(vec![0, 0, 0, 1, if force_key { 0x65 } else { 0x41 }]),
                is_key: force_key,
            }))
        }

        fn flush(&mut self) -> Result<Vec<CodedPicture>, CodecError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn frame(width: u32, height: u32, ts_micros: i64) -> RawFrame {
        RawFrame {
            width,
            height,
            timestamp_nanos: ts_micros * 1_000,
            index: 0,
            data: Bytes::from(vec![0u8; RawFrame::rgb_len(width, height)]),
        }
    }

    fn settings(fps: u32, interval: u32) -> VideoSettings {
        VideoSettings {
            width: 4,
            height: 4,
            fps,
            keyframe_interval_secs: interval,
            ..VideoSettings::default()
        }
    }

    #[test]
    fn test_first_frame_is_key() {
        let mut encoder = VideoEncoder::new(Box::new(ScriptedCodec::new()), &settings(30, 1));
        let units = encoder.encode(frame(4, 4, 1_000)).unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_key_frame);
        assert_eq!(units[0].timestamp_micros, 1_000);
        assert_eq!(units[0].kind, MediaKind::Video);
    }

    #[test]
    fn test_key_frame_cadence() {
        let mut encoder = VideoEncoder::new(Box::new(ScriptedCodec::new()), &settings(5, 2));
        let keys: Vec<usize> = (0..25)
            .filter_map(|i| {
                let unit = encoder.encode(frame(4, 4, i as i64)).unwrap().remove(0);
                unit.is_key_frame.then_some(i)
            })
            .collect();
        assert_eq!(keys, vec![0, 10, 20]);
    }

    #[test]
    fn test_rejects_wrong_geometry() {
        let mut encoder = VideoEncoder::new(Box::new(ScriptedCodec::new()), &settings(30, 1));
        assert!(matches!(
            encoder.encode(frame(8, 4, 0)),
            Err(CodecError::InvalidFrameSize(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_key_gap_never_exceeds_interval(fps in 1u32..10, interval in 1u32..4, skip in 2u64..7, n in 1usize..120) {
            let codec = ScriptedCodec { skip_every: Some(skip), seen: 0 };
            let mut encoder = VideoEncoder::new(Box::new(codec), &settings(fps, interval));
            let limit = (fps * interval) as usize;

            let mut since_key = None;
            for i in 0..n {
                let units = encoder.encode(frame(4, 4, i as i64)).unwrap();
                since_key = since_key.map(|k: usize| k + 1);
                if let Some(unit) = units.first() {
                    if unit.is_key_frame {
                        since_key = Some(0);
                    }
                }
                if let Some(k) = since_key {
                    // A skipped forced key is retried on the very next frame
                    prop_assert!(k <= limit);
                }
            }
        }
    }
}
