//! Session description
//!
//! Track layout is fixed: video is track 0, audio track 1, AR track 2. A
//! disabled modality leaves its index unused so the others never move.

use std::fmt::Write;
use std::net::IpAddr;

use crate::config::StreamConfig;
use crate::constants::{OPUS_RTP_CLOCK, VIDEO_RTP_CLOCK};

pub const VIDEO_TRACK_ID: u8 = 0;
pub const AUDIO_TRACK_ID: u8 = 1;
pub const AR_TRACK_ID: u8 = 2;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;
pub const AR_PAYLOAD_TYPE: u8 = 98;

/// Version of the AR JSON schema announced in the description
pub const AR_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
    Ar,
}

impl TrackKind {
    pub fn media(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
            TrackKind::Ar => "application",
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescription {
    pub id: u8,
    pub kind: TrackKind,
    pub payload_type: u8,
    pub encoding: &'static str,
    pub clock_rate: u32,
    pub encoding_params: Option<u16>,
    pub fmtp: Option<String>,
    pub extra: Vec<String>,
}

impl TrackDescription {
    /// Value of the `a=control` attribute
    pub fn control(&self) -> String {
        format!("trackID={}", self.id)
    }
}

/// `o=` line identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOrigin {
    pub session_id: u64,
    pub version: u64,
    pub address: IpAddr,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: SessionOrigin,
    pub tracks: Vec<TrackDescription>,
}

/// Describe the tracks a session with `config` offers. Pure.
pub fn describe_session(config: &StreamConfig, origin: SessionOrigin) -> SessionDescription {
    let mut tracks = Vec::with_capacity(3);

    if config.has_video {
        let v = &config.video;
        tracks.push(TrackDescription {
            id: VIDEO_TRACK_ID,
            kind: TrackKind::Video,
            payload_type: VIDEO_PAYLOAD_TYPE,
            encoding: "H264",
            clock_rate: VIDEO_RTP_CLOCK,
            encoding_params: None,
            fmtp: Some("packetization-mode=1;profile-level-id=42e01f".into()),
            extra: vec![
                format!("framerate:{}", v.fps),
                format!("x-dimensions:{},{}", v.width, v.height),
            ],
        });
    }

    if config.has_audio {
        let a = &config.audio;
        tracks.push(TrackDescription {
            id: AUDIO_TRACK_ID,
            kind: TrackKind::Audio,
            payload_type: AUDIO_PAYLOAD_TYPE,
            encoding: "opus",
            // Opus is always announced as 48 kHz stereo
            clock_rate: OPUS_RTP_CLOCK,
            encoding_params: Some(2),
            fmtp: Some(format!(
                "sprop-maxcapturerate={};sprop-stereo={};maxaveragebitrate={}",
                a.sample_rate,
                u8::from(a.channels > 1),
                a.bitrate
            )),
            extra: Vec::new(),
        });
    }

    if config.has_ar {
        let mut fmtp = format!("type=ar-data;format=json;schema={}", AR_SCHEMA_VERSION);
        if config.include_depth {
            fmtp.push_str(";depth=1");
        }
        tracks.push(TrackDescription {
            id: AR_TRACK_ID,
            kind: TrackKind::Ar,
            payload_type: AR_PAYLOAD_TYPE,
            encoding: "x-ar-telemetry",
            clock_rate: VIDEO_RTP_CLOCK,
            encoding_params: None,
            fmtp: Some(fmtp),
            extra: Vec::new(),
        });
    }

    SessionDescription { origin, tracks }
}

impl SessionDescription {
    pub fn track(&self, id: u8) -> Option<&TrackDescription> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Resolve the track named by a SETUP URL (`.../trackID=N`)
    pub fn track_for_url(&self, url: &str) -> Option<&TrackDescription> {
        let id = url.trim_end_matches('/').rsplit('/').next()?;
        let id = id.strip_prefix("trackID=")?.parse().ok()?;
        self.track(id)
    }

    /// Render RFC 4566 text
    pub fn to_sdp(&self) -> String {
        let (net, addr) = match self.origin.address {
            IpAddr::V4(a) => ("IP4", a.to_string()),
            IpAddr::V6(a) => ("IP6", a.to_string()),
        };
        let unspecified = if net == "IP4" { "0.0.0.0" } else { "::" };

        let mut sdp = String::with_capacity(512);
        let _ = write!(sdp, "v=0\r\n");
        let _ = write!(
            sdp,
            "o=- {} {} IN {} {}\r\n",
            self.origin.session_id, self.origin.version, net, addr
        );
        let _ = write!(sdp, "s={}\r\n", self.origin.name);
        let _ = write!(sdp, "c=IN {} {}\r\n", net, unspecified);
        let _ = write!(sdp, "t=0 0\r\n");
        let _ = write!(sdp, "a=control:*\r\n");
        let _ = write!(sdp, "a=range:npt=0-\r\n");

        for track in &self.tracks {
            let _ = write!(
                sdp,
                "m={} 0 RTP/AVP {}\r\n",
                track.kind.media(),
                track.payload_type
            );
            match track.encoding_params {
                Some(params) => {
                    let _ = write!(
                        sdp,
                        "a=rtpmap:{} {}/{}/{}\r\n",
                        track.payload_type, track.encoding, track.clock_rate, params
                    );
                }
                None => {
                    let _ = write!(
                        sdp,
                        "a=rtpmap:{} {}/{}\r\n",
                        track.payload_type, track.encoding, track.clock_rate
                    );
                }
            }
            if let Some(fmtp) = &track.fmtp {
                let _ = write!(sdp, "a=fmtp:{} {}\r\n", track.payload_type, fmtp);
            }
            for attr in &track.extra {
                let _ = write!(sdp, "a={}\r\n", attr);
            }
            let _ = write!(sdp, "a=control:{}\r\n", track.control());
        }

        sdp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamMode;
    use std::net::Ipv4Addr;

    fn origin() -> SessionOrigin {
        SessionOrigin {
            session_id: 42,
            version: 1,
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            name: "ArStreamer".into(),
        }
    }

    #[test]
    fn test_track_order_and_ids() {
        let sdp = describe_session(&StreamConfig::ar_mode(), origin());
        let ids: Vec<u8> = sdp.tracks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let pts: Vec<u8> = sdp.tracks.iter().map(|t| t.payload_type).collect();
        assert_eq!(pts, vec![96, 97, 98]);
    }

    #[test]
    fn test_missing_audio_keeps_ar_index() {
        let sdp = describe_session(&StreamConfig::from_mode(StreamMode::VideoAr), origin());
        let ids: Vec<u8> = sdp.tracks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![VIDEO_TRACK_ID, AR_TRACK_ID]);
        assert!(sdp.track(AUDIO_TRACK_ID).is_none());
    }

    #[test]
    fn test_describe_is_pure() {
        let config = StreamConfig::hd();
        assert_eq!(
            describe_session(&config, origin()),
            describe_session(&config, origin())
        );
    }

    #[test]
    fn test_render() {
        let text = describe_session(&StreamConfig::ar_mode(), origin()).to_sdp();
        assert!(text.starts_with("v=0\r\no=- 42 1 IN IP4 192.168.1.20\r\n"));
        assert!(text.contains("m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n"));
        assert!(text.contains("a=rtpmap:97 opus/48000/2\r\n"));
        assert!(text.contains("m=application 0 RTP/AVP 98\r\n"));
        assert!(text.contains("a=fmtp:98 type=ar-data;format=json;schema=1;depth=1\r\n"));
        assert!(text.contains("a=control:trackID=2\r\n"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_depth_flag_follows_config() {
        let mut config = StreamConfig::ar_mode();
        config.include_depth = false;
        let text = describe_session(&config, origin()).to_sdp();
        assert!(text.contains("a=fmtp:98 type=ar-data;format=json;schema=1\r\n"));
    }

    #[test]
    fn test_track_for_url() {
        let sdp = describe_session(&StreamConfig::hd(), origin());
        let url = "rtsp://192.168.1.20:8086/stream/trackID=1";
        assert_eq!(sdp.track_for_url(url).unwrap().kind, TrackKind::Audio);
        assert!(sdp.track_for_url("rtsp://host/stream/trackID=2").is_none());
        assert!(sdp.track_for_url("rtsp://host/stream").is_none());
    }
}
