//! Per-client RTSP session state

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::mux::TrackKind;
use crate::rtsp::request::Method;
use crate::rtsp::rtp::RtpPacketizer;
use crate::rtsp::transport::TrackTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Init,
    Ready,
    Playing,
    TornDown,
}

impl ProtocolState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolState::Init => "Init",
            ProtocolState::Ready => "Ready",
            ProtocolState::Playing => "Playing",
            ProtocolState::TornDown => "TornDown",
        }
    }
}

/// A track the client has negotiated a transport for
#[derive(Debug)]
pub struct TrackSetup {
    pub track_id: u8,
    pub kind: TrackKind,
    pub transport: TrackTransport,
    pub packetizer: RtpPacketizer,
}

#[derive(Debug)]
pub struct ClientSession {
    id: String,
    peer: SocketAddr,
    state: ProtocolState,
    tracks: BTreeMap<u8, TrackSetup>,
    last_activity: Instant,
    timeout: Duration,
}

impl ClientSession {
    pub fn new(peer: SocketAddr, timeout: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            peer,
            state: ProtocolState::Init,
            tracks: BTreeMap::new(),
            last_activity: Instant::now(),
            timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == ProtocolState::Playing
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `Session` header value
    pub fn session_header(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.idle_deadline()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackSetup> {
        self.tracks.values()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut TrackSetup> {
        self.tracks.values_mut()
    }

    pub fn track(&self, id: u8) -> Option<&TrackSetup> {
        self.tracks.get(&id)
    }

    /// Interleaved channels not yet taken by another track
    pub fn free_channels(&self, preferred: u8) -> (u8, u8) {
        let taken: Vec<u8> = self
            .tracks
            .values()
            .filter_map(|t| match t.transport {
                TrackTransport::Interleaved { rtp_channel, .. } => Some(rtp_channel),
                TrackTransport::Udp(_) => None,
            })
            .collect();
        let mut channel = preferred;
        while taken.contains(&channel) {
            channel = channel.wrapping_add(2);
        }
        (channel, channel.wrapping_add(1))
    }

    /// Check that `method` may run in the current state
    pub fn check(&self, method: &Method) -> Result<(), ProtocolError> {
        let allowed = match (method, self.state) {
            (_, ProtocolState::TornDown) => false,
            (Method::Setup, ProtocolState::Playing) => false,
            (Method::Play | Method::Pause, ProtocolState::Init) => false,
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState {
                method: method.to_string(),
                state: self.state.as_str(),
            })
        }
    }

    /// Record a negotiated track. Replaces an earlier setup of the same track.
    pub fn add_track(&mut self, setup: TrackSetup) -> Result<(), ProtocolError> {
        self.check(&Method::Setup)?;
        self.tracks.insert(setup.track_id, setup);
        self.state = ProtocolState::Ready;
        Ok(())
    }

    pub fn play(&mut self) -> Result<(), ProtocolError> {
        self.check(&Method::Play)?;
        if self.tracks.is_empty() {
            return Err(ProtocolError::InvalidState {
                method: Method::Play.to_string(),
                state: self.state.as_str(),
            });
        }
        self.state = ProtocolState::Playing;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), ProtocolError> {
        self.check(&Method::Pause)?;
        self.state = ProtocolState::Ready;
        Ok(())
    }

    /// Release every track. Idempotent.
    pub fn teardown(&mut self) {
        self.tracks.clear();
        self.state = ProtocolState::TornDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ClientSession {
        ClientSession::new("127.0.0.1:5000".parse().unwrap(), Duration::from_secs(60))
    }

    fn setup(id: u8, channel: u8) -> TrackSetup {
        TrackSetup {
            track_id: id,
            kind: TrackKind::Video,
            transport: TrackTransport::Interleaved {
                rtp_channel: channel,
                rtcp_channel: channel + 1,
            },
            packetizer: RtpPacketizer::new(96, 90_000, 1400),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        assert_eq!(s.state(), ProtocolState::Init);
        s.add_track(setup(0, 0)).unwrap();
        assert_eq!(s.state(), ProtocolState::Ready);
        s.play().unwrap();
        assert!(s.is_playing());
        s.pause().unwrap();
        assert_eq!(s.state(), ProtocolState::Ready);
        s.play().unwrap();
        s.teardown();
        assert_eq!(s.state(), ProtocolState::TornDown);
        assert_eq!(s.tracks().count(), 0);
        s.teardown();
    }

    #[test]
    fn test_play_before_setup() {
        let mut s = session();
        let err = s.play().unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidState {
                method: "PLAY".into(),
                state: "Init"
            }
        );
        assert!(s.pause().is_err());
    }

    #[test]
    fn test_setup_while_playing_rejected() {
        let mut s = session();
        s.add_track(setup(0, 0)).unwrap();
        s.play().unwrap();
        assert!(s.add_track(setup(1, 2)).is_err());
    }

    #[test]
    fn test_nothing_after_teardown() {
        let mut s = session();
        s.teardown();
        assert!(s.check(&Method::Options).is_err());
        assert!(s.add_track(setup(0, 0)).is_err());
    }

    #[test]
    fn test_free_channels() {
        let mut s = session();
        assert_eq!(s.free_channels(0), (0, 1));
        s.add_track(setup(0, 0)).unwrap();
        assert_eq!(s.free_channels(0), (2, 3));
        assert_eq!(s.free_channels(4), (4, 5));
    }

    #[test]
    fn test_session_header_and_expiry() {
        let s = ClientSession::new("127.0.0.1:1".parse().unwrap(), Duration::from_millis(0));
        assert!(s.session_header().ends_with(";timeout=0"));
        assert_eq!(s.id().len(), 32);
        assert!(s.is_expired(Instant::now()));
    }
}
