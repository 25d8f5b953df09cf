//! H.264 through openh264

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;

use super::video::{CodedPicture, VideoCodec};
use crate::capture::RawFrame;
use crate::config::VideoSettings;
use crate::error::CodecError;

const MIN_BITRATE: u32 = 64_000;
const MAX_BITRATE: u32 = 50_000_000;
const MAX_FPS: u32 = 60;
const MAX_WIDTH: u32 = 3840;
const MAX_HEIGHT: u32 = 2160;

/// Baseline-profile H.264 encoder
pub struct H264Codec {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl H264Codec {
    /// Check that openh264 can honour `settings`
    pub fn check_settings(settings: &VideoSettings) -> Result<(), CodecError> {
        let VideoSettings {
            width,
            height,
            fps,
            bitrate,
            ..
        } = *settings;

        if width % 2 != 0 || height % 2 != 0 {
            return Err(CodecError::Unsupported(format!(
                "{}x{}: dimensions must be even",
                width, height
            )));
        }
        if width > MAX_WIDTH || height > MAX_HEIGHT {
            return Err(CodecError::Unsupported(format!(
                "{}x{} exceeds {}x{}",
                width, height, MAX_WIDTH, MAX_HEIGHT
            )));
        }
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
            return Err(CodecError::Unsupported(format!(
                "bitrate {} outside {}..={}",
                bitrate, MIN_BITRATE, MAX_BITRATE
            )));
        }
        if fps == 0 || fps > MAX_FPS {
            return Err(CodecError::Unsupported(format!(
                "frame rate {} outside 1..={}",
                fps, MAX_FPS
            )));
        }
        Ok(())
    }

    pub fn new(settings: &VideoSettings) -> Result<Self, CodecError> {
        Self::check_settings(settings)?;

        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(settings.bitrate))
            .max_frame_rate(FrameRate::from_hz(settings.fps as f32));

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        tracing::info!(
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            bitrate = settings.bitrate,
            "H.264 encoder ready"
        );

        Ok(Self {
            encoder,
            width: settings.width,
            height: settings.height,
        })
    }
}

impl VideoCodec for H264Codec {
    fn name(&self) -> &str {
        "openh264"
    }

    fn encode(&mut self, frame: &RawFrame, force_key: bool) -> Result<Option<CodedPicture>, CodecError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(CodecError::InvalidFrameSize(frame.data.len()));
        }
        if force_key {
            self.encoder.force_intra_frame();
        }

        let rgb = RgbSliceU8::new(&frame.data, (frame.width as usize, frame.height as usize));
        let yuv = YUVBuffer::from_rgb_source(rgb);

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip | FrameType::Invalid) {
            return Ok(None);
        }
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(CodedPicture {
            data: Bytes::from(data),
            is_key: matches!(frame_type, FrameType::IDR | FrameType::I),
        }))
    }

    fn flush(&mut self) -> Result<Vec<CodedPicture>, CodecError> {
        // Baseline profile has no reordering delay
        Ok(Vec::new())
    }
}
