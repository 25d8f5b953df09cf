//! Transport negotiation
//!
//! Two delivery modes are offered: RTP interleaved on the RTSP connection and
//! RTP over unicast UDP. Multicast and secure profiles are refused.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::constants::MAX_INTERLEAVED_PACKET;
use crate::error::{NetworkError, ProtocolError};
use crate::rtsp::rtp::RTP_HEADER_LEN;

/// Largest UDP payload over IPv4
const MAX_UDP_PACKET: usize = 65_507;

const UDP_SEND_BUFFER: usize = 1024 * 1024;
const PORT_PAIR_ATTEMPTS: usize = 16;

/// What the client asked for in its `Transport` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRequest {
    /// RTP on the control connection; channels chosen by the server when absent
    Interleaved { channels: Option<(u8, u8)> },
    Udp { client_rtp: u16, client_rtcp: u16 },
}

/// Parse a `Transport` header, taking the first acceptable alternative
pub fn parse_transport(header: &str) -> Result<TransportRequest, ProtocolError> {
    let mut last_err = ProtocolError::UnsupportedTransport(header.to_string());
    for spec in header.split(',') {
        match parse_one(spec.trim()) {
            Ok(t) => return Ok(t),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn parse_one(spec: &str) -> Result<TransportRequest, ProtocolError> {
    let mut params = spec.split(';').map(str::trim);
    let profile = params.next().unwrap_or_default();

    let tcp = match profile.to_ascii_uppercase().as_str() {
        "RTP/AVP" | "RTP/AVP/UDP" => false,
        "RTP/AVP/TCP" => true,
        other => {
            return Err(ProtocolError::UnsupportedTransport(format!(
                "profile {}",
                other
            )))
        }
    };

    let mut interleaved = None;
    let mut client_port = None;
    for param in params {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        match key.to_ascii_lowercase().as_str() {
            "multicast" => {
                return Err(ProtocolError::UnsupportedTransport("multicast".into()));
            }
            "interleaved" => interleaved = Some(parse_pair::<u8>(value)?),
            "client_port" => client_port = Some(parse_pair::<u16>(value)?),
            _ => {}
        }
    }

    if tcp {
        return Ok(TransportRequest::Interleaved {
            channels: interleaved,
        });
    }
    match client_port {
        Some((client_rtp, client_rtcp)) => Ok(TransportRequest::Udp {
            client_rtp,
            client_rtcp,
        }),
        None => Err(ProtocolError::UnsupportedTransport(
            "UDP transport without client_port".into(),
        )),
    }
}

/// `a-b` or a single `a` (then `b = a + 1`)
fn parse_pair<T>(value: &str) -> Result<(T, T), ProtocolError>
where
    T: std::str::FromStr + Copy + TryFrom<u32> + Into<u32>,
{
    let bad = || ProtocolError::Malformed(format!("bad port or channel range {:?}", value));
    match value.split_once('-') {
        Some((a, b)) => {
            let a = a.trim().parse::<T>().map_err(|_| bad())?;
            let b = b.trim().parse::<T>().map_err(|_| bad())?;
            Ok((a, b))
        }
        None => {
            let a = value.trim().parse::<T>().map_err(|_| bad())?;
            let b = T::try_from(a.into() + 1).map_err(|_| bad())?;
            Ok((a, b))
        }
    }
}

/// UDP socket pair owned by one track of one client
#[derive(Debug)]
pub struct UdpTransport {
    rtp: Arc<UdpSocket>,
    // Held open so the advertised RTCP port stays reserved
    _rtcp: UdpSocket,
    peer_rtp: SocketAddr,
    peer_rtcp: SocketAddr,
}

impl UdpTransport {
    /// Bind an even/odd port pair on `local` and target the client ports on `peer`
    pub fn bind(local: IpAddr, peer: IpAddr, client_rtp: u16, client_rtcp: u16) -> Result<Self, NetworkError> {
        for _ in 0..PORT_PAIR_ATTEMPTS {
            let rtp = bind_udp(SocketAddr::new(local, 0))?;
            let port = rtp
                .local_addr()
                .map_err(|e| NetworkError::BindFailed(e.to_string()))?
                .port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            let Ok(rtcp) = bind_udp(SocketAddr::new(local, port + 1)) else {
                continue;
            };

            return Ok(Self {
                rtp: Arc::new(rtp),
                _rtcp: rtcp,
                peer_rtp: SocketAddr::new(peer, client_rtp),
                peer_rtcp: SocketAddr::new(peer, client_rtcp),
            });
        }
        Err(NetworkError::BindFailed(format!(
            "no free UDP port pair on {}",
            local
        )))
    }

    pub fn server_ports(&self) -> (u16, u16) {
        let port = self.rtp.local_addr().map(|a| a.port()).unwrap_or_default();
        (port, port.wrapping_add(1))
    }

    pub fn peer_rtp(&self) -> SocketAddr {
        self.peer_rtp
    }

    pub fn peer_rtcp(&self) -> SocketAddr {
        self.peer_rtcp
    }

    pub async fn send(&self, packet: &[u8]) -> Result<(), NetworkError> {
        self.rtp
            .send_to(packet, self.peer_rtp)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    let _ = socket.set_send_buffer_size(UDP_SEND_BUFFER);
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// Negotiated delivery for one track
#[derive(Debug)]
pub enum TrackTransport {
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
    Udp(UdpTransport),
}

impl TrackTransport {
    /// Largest RTP packet, header included, that fits this transport
    pub fn max_packet(&self) -> usize {
        match self {
            TrackTransport::Interleaved { .. } => MAX_INTERLEAVED_PACKET,
            TrackTransport::Udp(_) => MAX_UDP_PACKET,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_packet() - RTP_HEADER_LEN
    }

    /// Value for the `Transport` response header
    pub fn describe(&self, ssrc: u32) -> String {
        match self {
            TrackTransport::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                rtp_channel, rtcp_channel, ssrc
            ),
            TrackTransport::Udp(udp) => {
                let (server_rtp, server_rtcp) = udp.server_ports();
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                    udp.peer_rtp.port(),
                    udp.peer_rtcp.port(),
                    server_rtp,
                    server_rtcp,
                    ssrc
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_interleaved() {
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap(),
            TransportRequest::Interleaved {
                channels: Some((2, 3))
            }
        );
        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast").unwrap(),
            TransportRequest::Interleaved { channels: None }
        );
    }

    #[test]
    fn test_parse_udp() {
        assert_eq!(
            parse_transport("RTP/AVP;unicast;client_port=5000-5001").unwrap(),
            TransportRequest::Udp {
                client_rtp: 5000,
                client_rtcp: 5001
            }
        );
        assert_eq!(
            parse_transport("RTP/AVP/UDP;unicast;client_port=6000").unwrap(),
            TransportRequest::Udp {
                client_rtp: 6000,
                client_rtcp: 6001
            }
        );
    }

    #[test]
    fn test_first_acceptable_alternative_wins() {
        let header = "RTP/AVP;multicast, RTP/AVP/TCP;unicast;interleaved=0-1";
        assert_eq!(
            parse_transport(header).unwrap(),
            TransportRequest::Interleaved {
                channels: Some((0, 1))
            }
        );
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            parse_transport("RTP/AVP;multicast;destination=224.2.0.1"),
            Err(ProtocolError::UnsupportedTransport(_))
        ));
        assert!(matches!(
            parse_transport("RTP/SAVP;unicast;client_port=5000-5001"),
            Err(ProtocolError::UnsupportedTransport(_))
        ));
        assert!(parse_transport("RTP/AVP;unicast").is_err());
        assert!(parse_transport("RTP/AVP/TCP;interleaved=x-y").is_err());
    }

    #[test]
    fn test_interleaved_describe() {
        let t = TrackTransport::Interleaved {
            rtp_channel: 4,
            rtcp_channel: 5,
        };
        assert_eq!(t.describe(0xABCD), "RTP/AVP/TCP;unicast;interleaved=4-5;ssrc=0000ABCD");
        assert_eq!(t.max_payload(), MAX_INTERLEAVED_PACKET - RTP_HEADER_LEN);
    }

    #[tokio::test]
    async fn test_udp_pair_and_send() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let client_port = receiver.local_addr().unwrap().port();

        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let udp = UdpTransport::bind(localhost, localhost, client_port, client_port + 1).unwrap();
        let (rtp, rtcp) = udp.server_ports();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);

        udp.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let transport = TrackTransport::Udp(udp);
        assert!(transport.describe(1).contains(&format!("server_port={}-{}", rtp, rtcp)));
    }
}
