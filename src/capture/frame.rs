//! Captured media types

use bytes::Bytes;

/// One camera frame, packed RGB24
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Session clock nanoseconds at exposure
    pub timestamp_nanos: i64,
    /// Capture counter, gaps mean frames were replaced before consumption
    pub index: u64,
    pub data: Bytes,
}

impl RawFrame {
    /// Expected RGB24 buffer length for the given dimensions
    pub fn rgb_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_nanos / 1_000
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == Self::rgb_len(self.width, self.height)
    }
}

/// A block of interleaved PCM from an audio backend
#[derive(Clone, Debug)]
pub struct AudioChunk {
    /// Interleaved f32 samples
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Session clock microseconds of the first sample
    pub timestamp_micros: i64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32, timestamp_micros: i64) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            timestamp_micros,
        }
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_micros(&self) -> i64 {
        (self.frames() as i64 * 1_000_000) / self.sample_rate.max(1) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(vec![0.0; 960 * 2], 2, 48_000, 0);
        assert_eq!(chunk.frames(), 960);
        assert_eq!(chunk.duration_micros(), 20_000);
    }

    #[test]
    fn test_frame_shape() {
        let frame = RawFrame {
            width: 4,
            height: 2,
            timestamp_nanos: 5_000,
            index: 0,
            data: Bytes::from(vec![0u8; 24]),
        };
        assert!(frame.is_well_formed());
        assert_eq!(frame.timestamp_micros(), 5);
    }
}
