//! Opus audio encoding
//!
//! Capture chunks arrive in whatever size the backend delivers. The encoder
//! re-blocks them into fixed 20 ms frames; the trailing partial frame is padded
//! with silence on flush.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use super::{EncodedUnit, MediaEncoder, MediaKind};
use crate::capture::AudioChunk;
use crate::config::AudioSettings;
use crate::constants::OPUS_SAMPLE_RATES;
use crate::error::CodecError;

const MIN_BITRATE: u32 = 6_000;
const MAX_BITRATE: u32 = 510_000;

/// A codec that compresses one fixed-size PCM frame at a time
pub trait AudioCodec {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Samples per channel in one frame
    fn frame_size(&self) -> usize;

    /// `pcm` holds exactly `frame_size() * channels()` interleaved samples
    fn encode_frame(&mut self, pcm: &[f32]) -> Result<Bytes, CodecError>;
}

/// libopus encoder
pub struct OpusCodec {
    encoder: Encoder,
    settings: AudioSettings,
    frame_size: usize,
    /// Reused output buffer (an Opus packet never exceeds ~1275 bytes per frame)
    encode_buffer: Vec<u8>,
}

impl OpusCodec {
    pub fn check_settings(settings: &AudioSettings) -> Result<(), CodecError> {
        if !OPUS_SAMPLE_RATES.contains(&settings.sample_rate) {
            return Err(CodecError::Unsupported(format!(
                "Opus sample rate {} not in {:?}",
                settings.sample_rate, OPUS_SAMPLE_RATES
            )));
        }
        if !(1..=2).contains(&settings.channels) {
            return Err(CodecError::Unsupported(format!(
                "Opus channel count {}",
                settings.channels
            )));
        }
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&settings.bitrate) {
            return Err(CodecError::Unsupported(format!(
                "Opus bitrate {} outside {}..={}",
                settings.bitrate, MIN_BITRATE, MAX_BITRATE
            )));
        }
        Ok(())
    }

    pub fn new(settings: &AudioSettings) -> Result<Self, CodecError> {
        Self::check_settings(settings)?;

        let channels = if settings.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };

        let mut encoder = Encoder::new(settings.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(settings.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        tracing::info!(
            sample_rate = settings.sample_rate,
            channels = settings.channels,
            bitrate = settings.bitrate,
            "Opus encoder ready"
        );

        Ok(Self {
            encoder,
            settings: *settings,
            frame_size: settings.frame_size(),
            encode_buffer: vec![0u8; 4000],
        })
    }
}

impl AudioCodec for OpusCodec {
    fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    fn channels(&self) -> u16 {
        self.settings.channels
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn encode_frame(&mut self, pcm: &[f32]) -> Result<Bytes, CodecError> {
        let expected = self.frame_size * self.settings.channels as usize;
        if pcm.len() != expected {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode_float(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}

/// Re-blocks capture chunks into codec frames
pub struct AudioEncoder {
    codec: Box<dyn AudioCodec>,
    pending: Vec<f32>,
    /// Capture time of `pending[0]`
    pending_start_micros: Option<i64>,
    frame_duration_micros: i64,
}

impl AudioEncoder {
    pub fn new(codec: Box<dyn AudioCodec>) -> Self {
        let frame_duration_micros =
            (codec.frame_size() as i64 * 1_000_000) / codec.sample_rate().max(1) as i64;
        Self {
            pending: Vec::with_capacity(codec.frame_size() * codec.channels() as usize * 2),
            codec,
            pending_start_micros: None,
            frame_duration_micros,
        }
    }

    fn samples_per_frame(&self) -> usize {
        self.codec.frame_size() * self.codec.channels() as usize
    }

    /// Samples waiting for a full frame
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    fn emit_frame(&mut self, frame: &[f32]) -> Result<EncodedUnit, CodecError> {
        let payload = self.codec.encode_frame(frame)?;
        let start = self.pending_start_micros.unwrap_or(0);
        self.pending_start_micros = Some(start + self.frame_duration_micros);
        Ok(EncodedUnit::audio(payload, start))
    }
}

impl MediaEncoder for AudioEncoder {
    type Input = AudioChunk;

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn encode(&mut self, chunk: AudioChunk) -> Result<Vec<EncodedUnit>, CodecError> {
        if chunk.channels != self.codec.channels() || chunk.sample_rate != self.codec.sample_rate() {
            return Err(CodecError::Unsupported(format!(
                "chunk is {}Hz/{}ch, encoder expects {}Hz/{}ch",
                chunk.sample_rate,
                chunk.channels,
                self.codec.sample_rate(),
                self.codec.channels()
            )));
        }

        if self.pending.is_empty() {
            self.pending_start_micros = Some(chunk.timestamp_micros);
        }
        self.pending.extend_from_slice(&chunk.samples);

        let per_frame = self.samples_per_frame();
        let mut units = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= per_frame {
            let frame: Vec<f32> = self.pending[consumed..consumed + per_frame].to_vec();
            units.push(self.emit_frame(&frame)?);
            consumed += per_frame;
        }
        self.pending.drain(..consumed);
        if self.pending.is_empty() {
            self.pending_start_micros = None;
        }

        Ok(units)
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, CodecError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut frame = std::mem::take(&mut self.pending);
        let padding = self.samples_per_frame() - frame.len();
        frame.resize(self.samples_per_frame(), 0.0);
        tracing::debug!(padding, "Padded trailing audio frame with silence");

        let unit = self.emit_frame(&frame)?;
        self.pending_start_micros = None;
        Ok(vec![unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes a frame as its sample count, little endian
    struct CountingCodec {
        channels: u16,
    }

    impl AudioCodec for CountingCodec {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn frame_size(&self) -> usize {
            960
        }

        fn encode_frame(&mut self, pcm: &[f32]) -> Result<Bytes, CodecError> {
            let nonzero = pcm.iter().filter(|s| **s != 0.0).count() as u32;
            Ok(Bytes::copy_from_slice(&nonzero.to_le_bytes()))
        }
    }

    fn chunk(frames: usize, channels: u16, ts: i64) -> AudioChunk {
        AudioChunk::new(vec![0.5; frames * channels as usize], channels, 48_000, ts)
    }

    fn nonzero(unit: &EncodedUnit) -> u32 {
        u32::from_le_bytes([unit.payload[0], unit.payload[1], unit.payload[2], unit.payload[3]])
    }

    #[test]
    fn test_reblocks_into_20ms_frames() {
        let mut encoder = AudioEncoder::new(Box::new(CountingCodec { channels: 2 }));

        // 480 frames: not enough yet
        assert!(encoder.encode(chunk(480, 2, 1_000)).unwrap().is_empty());
        // 480 + 1200 = 1680 frames: one full frame, 720 left over
        let units = encoder.encode(chunk(1_200, 2, 11_000)).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp_micros, 1_000);
        assert_eq!(units[0].kind, MediaKind::Audio);
        assert_eq!(encoder.pending_samples(), 720 * 2);
    }

    #[test]
    fn test_timestamps_advance_by_frame_duration() {
        let mut encoder = AudioEncoder::new(Box::new(CountingCodec { channels: 1 }));
        let units = encoder.encode(chunk(960 * 3, 1, 5_000)).unwrap();
        let stamps: Vec<i64> = units.iter().map(|u| u.timestamp_micros).collect();
        assert_eq!(stamps, vec![5_000, 25_000, 45_000]);
        assert_eq!(encoder.pending_samples(), 0);
    }

    #[test]
    fn test_flush_pads_with_silence() {
        let mut encoder = AudioEncoder::new(Box::new(CountingCodec { channels: 1 }));
        encoder.encode(chunk(100, 1, 0)).unwrap();

        let flushed = encoder.flush().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(nonzero(&flushed[0]), 100);
        assert_eq!(flushed[0].timestamp_micros, 0);
        assert!(encoder.flush().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_format_mismatch() {
        let mut encoder = AudioEncoder::new(Box::new(CountingCodec { channels: 2 }));
        assert!(encoder.encode(chunk(10, 1, 0)).is_err());
    }

    #[test]
    fn test_opus_settings_checked() {
        let mut settings = AudioSettings::default();
        settings.sample_rate = 44_100;
        assert!(matches!(
            OpusCodec::check_settings(&settings),
            Err(CodecError::Unsupported(_))
        ));
        assert!(OpusCodec::check_settings(&AudioSettings::default()).is_ok());
    }

    #[test]
    fn test_opus_encodes_silence() {
        let mut codec = OpusCodec::new(&AudioSettings::default()).unwrap();
        let pcm = vec![0.0f32; codec.frame_size() * 2];
        let packet = codec.encode_frame(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < pcm.len() * 4);
        assert!(codec.encode_frame(&pcm[..10]).is_err());
    }
}
