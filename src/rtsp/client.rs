//! One RTSP connection
//!
//! The task owns both halves of the socket. Responses and interleaved RTP
//! are written from the same loop so they never interleave mid-frame.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::constants::STREAM_PATH;
use crate::error::{NetworkError, ProtocolError};
use crate::mux::{encode_ar_packet, SessionDescription, StreamUnit, TrackKind};
use crate::rtsp::queue::ClientQueue;
use crate::rtsp::request::{parse_message, Incoming, Method, RtspRequest, RtspResponse, PUBLIC_METHODS};
use crate::rtsp::rtp::{frame_interleaved, RtpPacketizer};
use crate::rtsp::server::ServerContext;
use crate::rtsp::session::{ClientSession, TrackSetup};
use crate::rtsp::transport::{parse_transport, TrackTransport, TransportRequest, UdpTransport};

const READ_BUFFER: usize = 4096;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Continue,
    Close,
}

pub(crate) async fn run(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>, cancel: CancellationToken) {
    ctx.status.client_connected();

    match ClientConnection::new(stream, peer, ctx.clone()) {
        Ok(mut conn) => {
            if let Err(e) = conn.serve(cancel).await {
                debug!(%peer, "Connection ended: {}", e);
            }
            conn.close();
        }
        Err(e) => warn!(%peer, "Failed to set up connection: {}", e),
    }

    ctx.status.client_disconnected();
    info!(%peer, "Client disconnected");
}

struct ClientConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    local: SocketAddr,
    ctx: Arc<ServerContext>,
    session: ClientSession,
    queue: Arc<ClientQueue>,
    inbuf: BytesMut,
    last_seq: Option<u64>,
}

impl ClientConnection {
    fn new(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<Self, NetworkError> {
        let local = stream
            .local_addr()
            .map_err(|_| NetworkError::NoLocalAddress)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            local,
            session: ClientSession::new(peer, ctx.settings.session_timeout()),
            queue: Arc::new(ClientQueue::new(ctx.settings.client_queue_capacity)),
            ctx,
            inbuf: BytesMut::with_capacity(READ_BUFFER),
            last_seq: None,
        })
    }

    fn peer(&self) -> SocketAddr {
        self.session.peer()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> Result<(), NetworkError> {
        loop {
            let deadline = tokio::time::Instant::from_std(self.session.idle_deadline());
            let idle_applies = self.idle_timeout_applies();
            let playing = self.session.is_playing();

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline), if idle_applies => {
                    info!(peer = %self.peer(), session = self.session.id(), "Session timed out");
                    return Ok(());
                }
                read = self.reader.read_buf(&mut self.inbuf) => {
                    let n = read.map_err(|e| NetworkError::SendFailed(e.to_string()))?;
                    if n == 0 {
                        return Ok(());
                    }
                    if self.process_input().await? == Outcome::Close {
                        return Ok(());
                    }
                }
                _ = self.queue.notified(), if playing => {
                    self.drain_queue().await?;
                }
            }
        }
    }

    // A playing TCP client proves liveness through the connection itself
    fn idle_timeout_applies(&self) -> bool {
        !(self.session.is_playing()
            && self
                .session
                .tracks()
                .any(|t| matches!(t.transport, TrackTransport::Interleaved { .. })))
    }

    async fn process_input(&mut self) -> Result<Outcome, NetworkError> {
        loop {
            match parse_message(&mut self.inbuf) {
                Ok(None) => return Ok(Outcome::Continue),
                Ok(Some(Incoming::Interleaved { channel, len })) => {
                    self.session.touch();
                    trace!(peer = %self.peer(), channel, len, "Interleaved data from client");
                }
                Ok(Some(Incoming::Request(request))) => {
                    self.session.touch();
                    let (response, outcome) = self.handle(&request);
                    self.write(&response.to_bytes(request.cseq())).await?;
                    if outcome == Outcome::Close {
                        return Ok(Outcome::Close);
                    }
                }
                Err(e) => {
                    warn!(peer = %self.peer(), "Protocol violation: {}", e);
                    let status = match e {
                        ProtocolError::RequestTooLarge(_) => 413,
                        _ => 400,
                    };
                    self.write(&RtspResponse::new(status).to_bytes(None)).await?;
                    return Ok(Outcome::Close);
                }
            }
        }
    }

    fn handle(&mut self, request: &RtspRequest) -> (RtspResponse, Outcome) {
        debug!(
            peer = %self.peer(),
            method = %request.method,
            uri = %request.uri,
            "RTSP request"
        );

        if let Some(id) = request.session_id() {
            if id != self.session.id() {
                return (RtspResponse::new(454), Outcome::Continue);
            }
        }

        if let Err(e) = self.session.check(&request.method) {
            warn!(peer = %self.peer(), "{}", e);
            return (RtspResponse::new(455), Outcome::Close);
        }

        match request.method {
            Method::Options => (
                RtspResponse::ok().with_header("Public", PUBLIC_METHODS),
                Outcome::Continue,
            ),
            Method::Describe => self.describe(request),
            Method::Setup => self.setup(request),
            Method::Play => self.play(),
            Method::Pause => self.pause(),
            Method::Teardown => {
                self.ctx.distributor.detach(self.session.id());
                let response = RtspResponse::ok().with_header("Session", self.session.id());
                self.session.teardown();
                (response, Outcome::Close)
            }
            Method::GetParameter | Method::SetParameter => (self.with_session(RtspResponse::ok()), Outcome::Continue),
            Method::Other(_) => (
                RtspResponse::new(501).with_header("Public", PUBLIC_METHODS),
                Outcome::Continue,
            ),
        }
    }

    fn with_session(&self, response: RtspResponse) -> RtspResponse {
        if self.session.tracks().next().is_some() {
            response.with_header("Session", self.session.session_header())
        } else {
            response
        }
    }

    fn base_url(&self) -> String {
        format!("rtsp://{}/{}", self.local, STREAM_PATH)
    }

    fn description(&self) -> SessionDescription {
        self.ctx.describe(self.local.ip())
    }

    fn describe(&self, request: &RtspRequest) -> (RtspResponse, Outcome) {
        if uri_path(&request.uri).trim_matches('/') != STREAM_PATH {
            return (RtspResponse::new(404), Outcome::Continue);
        }
        let sdp = self.description().to_sdp();
        (
            RtspResponse::ok()
                .with_header("Content-Base", format!("{}/", self.base_url()))
                .with_body("application/sdp", sdp),
            Outcome::Continue,
        )
    }

    fn setup(&mut self, request: &RtspRequest) -> (RtspResponse, Outcome) {
        let description = self.description();
        let Some(track) = description.track_for_url(&request.uri) else {
            debug!(uri = %request.uri, "SETUP for unknown track");
            return (RtspResponse::new(404), Outcome::Continue);
        };
        let Some(header) = request.header("Transport") else {
            return (RtspResponse::new(461), Outcome::Continue);
        };

        let transport = match parse_transport(header) {
            Ok(TransportRequest::Interleaved { channels }) => {
                let (rtp_channel, rtcp_channel) =
                    channels.unwrap_or_else(|| self.session.free_channels(track.id * 2));
                TrackTransport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                }
            }
            Ok(TransportRequest::Udp {
                client_rtp,
                client_rtcp,
            }) => match UdpTransport::bind(self.local.ip(), self.peer().ip(), client_rtp, client_rtcp) {
                Ok(udp) => TrackTransport::Udp(udp),
                Err(e) => {
                    warn!(peer = %self.peer(), "UDP transport unavailable: {}", e);
                    self.ctx.status.record_error(&e);
                    return (RtspResponse::new(500), Outcome::Continue);
                }
            },
            Err(ProtocolError::UnsupportedTransport(reason)) => {
                debug!(peer = %self.peer(), track = track.id, "Refusing transport: {}", reason);
                return (RtspResponse::new(461), Outcome::Continue);
            }
            Err(e) => {
                warn!(peer = %self.peer(), "Protocol violation: {}", e);
                return (RtspResponse::new(400), Outcome::Close);
            }
        };

        let mtu = self.ctx.settings.rtp_mtu.min(transport.max_packet());
        let packetizer = RtpPacketizer::new(track.payload_type, track.clock_rate, mtu);
        let transport_header = transport.describe(packetizer.ssrc());

        let setup = TrackSetup {
            track_id: track.id,
            kind: track.kind,
            transport,
            packetizer,
        };
        if let Err(e) = self.session.add_track(setup) {
            warn!(peer = %self.peer(), "{}", e);
            return (RtspResponse::new(455), Outcome::Close);
        }

        info!(
            peer = %self.peer(),
            session = self.session.id(),
            track = track.id,
            transport = %transport_header,
            "Track set up"
        );

        (
            RtspResponse::ok()
                .with_header("Transport", transport_header)
                .with_header("Session", self.session.session_header()),
            Outcome::Continue,
        )
    }

    fn play(&mut self) -> (RtspResponse, Outcome) {
        if let Err(e) = self.session.play() {
            warn!(peer = %self.peer(), "{}", e);
            return (RtspResponse::new(455), Outcome::Close);
        }

        // Anything left from before a pause is stale
        while self.queue.pop().is_some() {}
        self.last_seq = None;
        self.ctx.distributor.attach(self.session.id(), self.queue.clone());

        let now = self.ctx.clock.now_micros();
        let base = self.base_url();
        let rtp_info = self
            .session
            .tracks()
            .map(|t| {
                format!(
                    "url={}/trackID={};seq={};rtptime={}",
                    base,
                    t.track_id,
                    t.packetizer.next_sequence(),
                    t.packetizer.rtp_timestamp(now)
                )
            })
            .collect::<Vec<_>>()
            .join(",");

        info!(peer = %self.peer(), session = self.session.id(), "Playing");

        (
            RtspResponse::ok()
                .with_header("Range", "npt=0.000-")
                .with_header("Session", self.session.session_header())
                .with_header("RTP-Info", rtp_info),
            Outcome::Continue,
        )
    }

    fn pause(&mut self) -> (RtspResponse, Outcome) {
        if let Err(e) = self.session.pause() {
            warn!(peer = %self.peer(), "{}", e);
            return (RtspResponse::new(455), Outcome::Close);
        }
        self.ctx.distributor.detach(self.session.id());
        (
            RtspResponse::ok().with_header("Session", self.session.session_header()),
            Outcome::Continue,
        )
    }

    async fn drain_queue(&mut self) -> Result<(), NetworkError> {
        while self.session.is_playing() {
            let Some(item) = self.queue.pop() else {
                break;
            };

            let gap = match self.last_seq {
                Some(last) => item.seq.saturating_sub(last + 1),
                None => 0,
            };
            self.last_seq = Some(item.seq);
            if gap > 0 {
                debug!(peer = %self.peer(), gap, "Client fell behind, units dropped");
                for track in self.session.tracks_mut() {
                    track.packetizer.skip(gap);
                }
            }

            self.send_unit(&item.unit).await?;
        }
        Ok(())
    }

    async fn send_unit(&mut self, unit: &StreamUnit) -> Result<(), NetworkError> {
        let mut interleaved = BytesMut::new();

        for track in self.session.tracks_mut() {
            let max_payload = track.transport.max_payload();
            let packets = match track.kind {
                TrackKind::Video => match unit.video() {
                    Some(v) => track.packetizer.packetize_h264(&v.payload, v.timestamp_micros),
                    None => continue,
                },
                TrackKind::Audio => match unit.audio() {
                    Some(a) => match track.packetizer.packetize_single(&a.payload, a.timestamp_micros, max_payload) {
                        Ok(packet) => vec![packet],
                        Err(e) => {
                            warn!("Audio frame dropped: {}", e);
                            continue;
                        }
                    },
                    None => continue,
                },
                TrackKind::Ar => match unit.ar() {
                    Some(ar) => {
                        let payload = match encode_ar_packet(ar) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(sequence = ar.sequence, "AR packet dropped: {}", e);
                                track.packetizer.skip(1);
                                continue;
                            }
                        };
                        match track.packetizer.packetize_single(&payload, ar.timestamp_micros(), max_payload) {
                            Ok(packet) => vec![packet],
                            Err(_) => {
                                warn!(
                                    size = payload.len(),
                                    limit = max_payload,
                                    sequence = ar.sequence,
                                    "AR packet exceeds transport payload limit, dropped"
                                );
                                continue;
                            }
                        }
                    }
                    None => continue,
                },
            };

            match &track.transport {
                TrackTransport::Interleaved { rtp_channel, .. } => {
                    for packet in &packets {
                        frame_interleaved(*rtp_channel, packet, &mut interleaved)?;
                    }
                }
                TrackTransport::Udp(udp) => {
                    for packet in &packets {
                        // Unreachable ports surface as send errors; the session keeps going
                        if let Err(e) = udp.send(packet).await {
                            trace!(peer = %udp.peer_rtp(), "UDP send failed: {}", e);
                        }
                    }
                }
            }
        }

        if !interleaved.is_empty() {
            self.write(&interleaved).await?;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        match tokio::time::timeout(WRITE_TIMEOUT, self.writer.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NetworkError::SendFailed(e.to_string())),
            Err(_) => Err(NetworkError::SendFailed("write timed out".into())),
        }
    }

    fn close(&mut self) {
        self.ctx.distributor.detach(self.session.id());
        self.queue.close();
        self.session.teardown();
    }
}

/// Path part of an `rtsp://host:port/path` URL, or the URI itself when relative
fn uri_path(uri: &str) -> &str {
    match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => uri,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_path() {
        assert_eq!(uri_path("rtsp://10.0.0.2:8086/stream"), "/stream");
        assert_eq!(uri_path("rtsp://10.0.0.2:8086/stream/trackID=1"), "/stream/trackID=1");
        assert_eq!(uri_path("rtsp://10.0.0.2:8086"), "");
        assert_eq!(uri_path("/stream/"), "/stream/");
        assert_eq!(uri_path("*"), "*");
    }
}
