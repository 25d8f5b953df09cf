//! End-to-end RTSP sessions against a loopback server

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use ar_streamer::clock::SessionClock;
use ar_streamer::codec::EncodedUnit;
use ar_streamer::config::{ServerConfig, StreamConfig};
use ar_streamer::mux::StreamUnit;
use ar_streamer::rtsp::{RtpHeader, StatusPublisher, StreamServer};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal RTSP client reading responses and interleaved frames off one socket
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    cseq: u32,
    base: String,
    session: Option<String>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
            cseq: 0,
            base: format!("rtsp://{}/stream", addr),
            session: None,
        }
    }

    async fn fill(&mut self) -> bool {
        let n = tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("read timed out")
            .unwrap();
        n > 0
    }

    async fn request(&mut self, method: &str, uri: &str, extra: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut text = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, uri, self.cseq);
        if let Some(session) = &self.session {
            text.push_str(&format!("Session: {}\r\n", session));
        }
        for (name, value) in extra {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");
        self.stream.write_all(text.as_bytes()).await.unwrap();

        let response = self.read_response().await.expect("connection closed");
        assert_eq!(response.header("CSeq"), Some(self.cseq.to_string().as_str()));
        if let Some(session) = response.header("Session") {
            self.session = Some(session.split(';').next().unwrap().to_string());
        }
        response
    }

    async fn read_response(&mut self) -> Option<Response> {
        loop {
            // Skip interleaved data that raced ahead of the response
            while self.buf.first() == Some(&b'$') && self.buf.len() >= 4 {
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                if self.buf.len() < 4 + len {
                    break;
                }
                self.buf.advance(4 + len);
            }
            if let Some(end) = find(&self.buf, b"\r\n\r\n") {
                let head = String::from_utf8(self.buf[..end].to_vec()).unwrap();
                let mut lines = head.split("\r\n");
                let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|l| l.split_once(':'))
                    .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
                    .collect();
                let length = headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
                    .map_or(0, |(_, v)| v.parse::<usize>().unwrap());
                if self.buf.len() >= end + 4 + length {
                    self.buf.advance(end + 4);
                    let body = String::from_utf8(self.buf.split_to(length).to_vec()).unwrap();
                    return Some(Response { status, headers, body });
                }
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    /// Next interleaved RTP packet as (channel, packet)
    async fn read_frame(&mut self) -> (u8, Bytes) {
        loop {
            if self.buf.len() >= 4 {
                assert_eq!(self.buf[0], b'$', "expected interleaved data");
                let channel = self.buf[1];
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    return (channel, self.buf.split_to(len).freeze());
                }
            }
            assert!(self.fill().await, "connection closed");
        }
    }

    async fn is_closed(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        matches!(
            tokio::time::timeout(TIMEOUT, self.stream.read(&mut scratch)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn setup_interleaved_and_play(&mut self) {
        let uri = format!("{}/trackID=0", self.base);
        let setup = self
            .request("SETUP", &uri, &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")])
            .await;
        assert_eq!(setup.status, 200);
        let base = self.base.clone();
        let play = self.request("PLAY", &base, &[]).await;
        assert_eq!(play.status, 200);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn start_server(stream: StreamConfig) -> (StreamServer, Arc<StatusPublisher>) {
    let status = Arc::new(StatusPublisher::new());
    let settings = ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = StreamServer::start(
        settings,
        stream,
        "TestStreamer".into(),
        SessionClock::new(),
        status.clone(),
        &CancellationToken::new(),
    )
    .unwrap();
    (server, status)
}

fn video_unit(payload: Vec<u8>, ts: i64) -> StreamUnit {
    StreamUnit::new(Some(EncodedUnit::video(Bytes::from(payload), ts, true)), None, None).unwrap()
}

#[tokio::test]
async fn test_describe_setup_play_teardown() {
    let (mut server, status) = start_server(StreamConfig::hd()).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    let options = client.request("OPTIONS", "*", &[]).await;
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("DESCRIBE"));

    let base = client.base.clone();
    let describe = client.request("DESCRIBE", &base, &[("Accept", "application/sdp")]).await;
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96"));
    assert!(describe.body.contains("a=rtpmap:97 opus/48000/2"));
    assert!(describe.body.contains("IN IP4 127.0.0.1\r\n"));

    client.setup_interleaved_and_play().await;
    assert_eq!(server.distributor().playing_clients(), 1);
    assert_eq!(status.handle().get().client_count, 1);

    let delivered = server
        .distributor()
        .publish(video_unit(vec![0, 0, 0, 1, 0x65, 1, 2, 3], 1_000));
    assert_eq!(delivered, 1);

    let (channel, packet) = client.read_frame().await;
    assert_eq!(channel, 0);
    let header = RtpHeader::parse(&packet).unwrap();
    assert_eq!(header.payload_type, 96);
    assert!(header.marker);
    assert_eq!(&packet[12..], &[0x65, 1, 2, 3]);

    let teardown = client.request("TEARDOWN", &base, &[]).await;
    assert_eq!(teardown.status, 200);
    assert!(client.is_closed().await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.distributor().playing_clients(), 0);
    assert_eq!(status.handle().get().client_count, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_play_before_setup_is_rejected() {
    let (mut server, _status) = start_server(StreamConfig::hd()).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    let base = client.base.clone();
    let play = client.request("PLAY", &base, &[]).await;
    assert_eq!(play.status, 455);
    assert!(client.is_closed().await);

    // The server keeps accepting other clients
    let mut other = TestClient::connect(server.local_addr()).await;
    assert_eq!(other.request("OPTIONS", "*", &[]).await.status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_track_and_transport() {
    let (mut server, _status) = start_server(StreamConfig::hd()).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    let unknown = format!("{}/trackID=7", client.base);
    let setup = client
        .request("SETUP", &unknown, &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")])
        .await;
    assert_eq!(setup.status, 404);

    let track = format!("{}/trackID=0", client.base);
    let setup = client
        .request("SETUP", &track, &[("Transport", "RTP/AVP;multicast")])
        .await;
    assert_eq!(setup.status, 461);

    // Connection survives both refusals
    assert_eq!(client.request("OPTIONS", "*", &[]).await.status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_session_id() {
    let (mut server, _status) = start_server(StreamConfig::hd()).await;
    let mut client = TestClient::connect(server.local_addr()).await;
    client.session = Some("deadbeef".into());

    let base = client.base.clone();
    let response = client.request("PLAY", &base, &[]).await;
    assert_eq!(response.status, 454);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_client_does_not_stall_others() {
    let (mut server, _status) = start_server(StreamConfig::hd()).await;

    let mut stalled = TestClient::connect(server.local_addr()).await;
    stalled.setup_interleaved_and_play().await;
    let mut reader = TestClient::connect(server.local_addr()).await;
    reader.setup_interleaved_and_play().await;
    assert_eq!(server.distributor().playing_clients(), 2);

    // Far more than socket buffers and queues hold; the stalled client never reads
    let distributor = server.distributor();
    let mut bulk = vec![0u8, 0, 0, 1, 0x41];
    bulk.resize(32 * 1024, 0);
    for i in 0..300 {
        distributor.publish(video_unit(bulk.clone(), i * 33_000));
    }
    distributor.publish(video_unit(vec![0, 0, 0, 1, 0x65, 0xAB, 0xCD, 0xEF], 300 * 33_000));

    let last = tokio::time::timeout(TIMEOUT, async {
        loop {
            let (_, packet) = reader.read_frame().await;
            if packet.ends_with(&[0xAB, 0xCD, 0xEF]) {
                return packet;
            }
        }
    })
    .await
    .expect("reader starved by the stalled client");
    assert_eq!(&last[12..], &[0x65, 0xAB, 0xCD, 0xEF]);

    drop(stalled);
    server.shutdown().await;
}
