//! Depth map compression
//!
//! Depth maps leave the tracking context as gzip-compressed little-endian
//! DEPTH16 buffers. Anything larger than the configured cap keeps its
//! dimensions but loses its samples.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::types::{DepthImage, DepthSnapshot};
use crate::error::TrackingError;

/// Compress a raw depth image, consuming it
pub fn compress_depth(image: DepthImage, max_bytes: usize) -> DepthSnapshot {
    let DepthImage {
        width,
        height,
        samples,
    } = image;

    let expected = width as usize * height as usize;
    if samples.len() != expected {
        tracing::warn!(
            width,
            height,
            len = samples.len(),
            "Depth image size mismatch, dropping samples"
        );
        return DepthSnapshot {
            width,
            height,
            samples: None,
        };
    }

    let mut raw = Vec::with_capacity(samples.len() * 2);
    for sample in &samples {
        raw.extend_from_slice(&sample.to_le_bytes());
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::fast());
    let compressed = encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish());

    let samples = match compressed {
        Ok(data) if data.len() <= max_bytes => Some(Bytes::from(data)),
        Ok(data) => {
            tracing::debug!(
                size = data.len(),
                cap = max_bytes,
                "Compressed depth over cap, sending dimensions only"
            );
            None
        }
        Err(e) => {
            tracing::warn!("Depth compression failed: {}", e);
            None
        }
    };

    DepthSnapshot {
        width,
        height,
        samples,
    }
}

/// Inflate a compressed depth buffer back to millimeter samples
pub fn decompress_depth(data: &[u8]) -> Result<Vec<u16>, TrackingError> {
    let mut raw = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut raw)
        .map_err(|e| TrackingError::Backend(format!("corrupt depth buffer: {}", e)))?;

    if raw.len() % 2 != 0 {
        return Err(TrackingError::Backend("odd depth buffer length".into()));
    }

    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DepthImage {
        let samples = (0..width * height).map(|i| (1000 + i % 500) as u16).collect();
        DepthImage {
            width,
            height,
            samples,
        }
    }

    #[test]
    fn test_compress_and_restore() {
        let snapshot = compress_depth(gradient(160, 90), usize::MAX);
        assert_eq!((snapshot.width, snapshot.height), (160, 90));

        let data = snapshot.samples.expect("samples present");
        assert!(data.len() < 160 * 90 * 2);

        let restored = decompress_depth(&data).unwrap();
        assert_eq!(restored.len(), 160 * 90);
        assert_eq!(restored[0], 1000);
        assert_eq!(restored[501], 1001);
    }

    #[test]
    fn test_cap_drops_samples_keeps_dimensions() {
        let snapshot = compress_depth(gradient(160, 90), 16);
        assert_eq!(snapshot.width, 160);
        assert_eq!(snapshot.height, 90);
        assert!(snapshot.samples.is_none());
    }

    #[test]
    fn test_size_mismatch() {
        let image = DepthImage {
            width: 4,
            height: 4,
            samples: vec![0; 3],
        };
        assert!(compress_depth(image, usize::MAX).samples.is_none());
    }
}
