//! AR telemetry wire format
//!
//! One JSON object per packet. Depth samples travel as base64 of the gzip
//! buffer produced by the tracking session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::tracking::{ArDataPacket, DepthSnapshot, PoseSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArJson {
    timestamp_nanos: i64,
    sequence: u64,
    camera_pose_translation: [f32; 3],
    camera_pose_rotation: [f32; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_data_compressed: Option<String>,
}

/// Serialize a packet to its JSON payload.
///
/// Non-finite pose values are refused; JSON would carry them as `null`.
pub fn encode_ar_packet(packet: &ArDataPacket) -> Result<Bytes, ProtocolError> {
    let pose = &packet.pose;
    if !pose.translation.iter().chain(&pose.rotation).all(|v| v.is_finite()) {
        return Err(ProtocolError::Malformed(format!(
            "AR packet {} has a non-finite pose",
            packet.sequence
        )));
    }

    let depth = packet.depth.as_ref();
    let json = ArJson {
        timestamp_nanos: packet.timestamp_nanos,
        sequence: packet.sequence,
        camera_pose_translation: packet.pose.translation,
        camera_pose_rotation: packet.pose.rotation,
        depth_width: depth.map(|d| d.width),
        depth_height: depth.map(|d| d.height),
        depth_data_compressed: depth
            .and_then(|d| d.samples.as_ref())
            .map(|s| STANDARD.encode(s)),
    };

    serde_json::to_vec(&json)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Malformed(format!("AR payload: {}", e)))
}

/// Parse a JSON payload back into a packet
pub fn decode_ar_packet(data: &[u8]) -> Result<ArDataPacket, ProtocolError> {
    let json: ArJson = serde_json::from_slice(data)
        .map_err(|e| ProtocolError::Malformed(format!("AR payload: {}", e)))?;

    let samples = json
        .depth_data_compressed
        .map(|b64| STANDARD.decode(b64))
        .transpose()
        .map_err(|e| ProtocolError::Malformed(format!("AR depth: {}", e)))?
        .map(Bytes::from);

    let depth = match (json.depth_width, json.depth_height) {
        (Some(width), Some(height)) => Some(DepthSnapshot {
            width,
            height,
            samples,
        }),
        _ => None,
    };

    Ok(ArDataPacket {
        timestamp_nanos: json.timestamp_nanos,
        sequence: json.sequence,
        pose: PoseSnapshot {
            // Pose time is not on the wire; the packet time stands in
            timestamp_nanos: json.timestamp_nanos,
            translation: json.camera_pose_translation,
            rotation: json.camera_pose_rotation,
        },
        depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(depth: Option<DepthSnapshot>) -> ArDataPacket {
        ArDataPacket {
            timestamp_nanos: 1_500_000,
            sequence: 3,
            pose: PoseSnapshot {
                timestamp_nanos: 1_500_000,
                translation: [1.0, 2.0, 3.0],
                rotation: [0.0, 0.0, 0.0, 1.0],
            },
            depth,
        }
    }

    #[test]
    fn test_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&encode_ar_packet(&packet(None)).unwrap()).unwrap();
        assert_eq!(value["timestampNanos"], 1_500_000);
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["cameraPoseTranslation"][2], 3.0);
        assert_eq!(value["cameraPoseRotation"][3], 1.0);
        assert!(value.get("depthWidth").is_none());
    }

    #[test]
    fn test_depth_is_base64() {
        let depth = DepthSnapshot {
            width: 2,
            height: 1,
            samples: Some(Bytes::from_static(&[1, 2, 3])),
        };
        let data = encode_ar_packet(&packet(Some(depth.clone()))).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["depthDataCompressed"], "AQID");

        let back = decode_ar_packet(&data).unwrap();
        assert_eq!(back.depth, Some(depth));
        assert_eq!(back.sequence, 3);
    }

    #[test]
    fn test_dimensions_without_samples() {
        let depth = DepthSnapshot {
            width: 160,
            height: 90,
            samples: None,
        };
        let back = decode_ar_packet(&encode_ar_packet(&packet(Some(depth.clone()))).unwrap()).unwrap();
        assert_eq!(back.depth, Some(depth));
    }

    #[test]
    fn test_non_finite_pose_refused() {
        let mut bad = packet(None);
        bad.pose.rotation[1] = f32::NAN;
        assert!(matches!(encode_ar_packet(&bad), Err(ProtocolError::Malformed(_))));

        bad.pose.rotation[1] = 0.0;
        bad.pose.translation[0] = f32::INFINITY;
        assert!(encode_ar_packet(&bad).is_err());
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(matches!(
            decode_ar_packet(b"{\"sequence\":1}"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(decode_ar_packet(
            br#"{"timestampNanos":1,"sequence":1,"cameraPoseTranslation":[0,0,0],"cameraPoseRotation":[0,0,0,1],"depthWidth":1,"depthHeight":1,"depthDataCompressed":"!!"}"#
        )
        .is_err());
    }
}
