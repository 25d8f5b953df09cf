//! RTSP/1.0 message parsing and response building

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;

use crate::error::ProtocolError;

/// Largest request head accepted before the connection is dropped
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;
/// Largest request body accepted
pub const MAX_REQUEST_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Other(String),
}

impl Method {
    fn parse(s: &str) -> Self {
        match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Other(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods advertised in the OPTIONS `Public` header
pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    /// Session id without any `;timeout=` suffix
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}

/// A complete message read off the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Request(RtspRequest),
    /// `$`-framed binary data (typically RTCP receiver reports)
    Interleaved { channel: u8, len: usize },
}

/// Take one complete message from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed.
pub fn parse_message(buf: &mut BytesMut) -> Result<Option<Incoming>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'$' {
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4 + len);
        return Ok(Some(Incoming::Interleaved { channel, len }));
    }

    let Some(head_end) = find_head_end(buf) else {
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(ProtocolError::RequestTooLarge(buf.len()));
        }
        return Ok(None);
    };
    if head_end > MAX_REQUEST_HEAD {
        return Err(ProtocolError::RequestTooLarge(head_end));
    }

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProtocolError::Malformed("request head is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) => (m, u, v),
        _ => {
            return Err(ProtocolError::Malformed(format!(
                "bad request line: {:?}",
                request_line
            )))
        }
    };
    if version != "RTSP/1.0" {
        return Err(ProtocolError::Malformed(format!("unsupported version {}", version)));
    }

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Malformed(format!("bad header line: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = RtspRequest {
        method: Method::parse(method),
        uri: uri.to_string(),
        headers,
        body: Bytes::new(),
    };

    let body_len = match request.header("Content-Length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| ProtocolError::Malformed(format!("bad Content-Length {:?}", v)))?,
        None => 0,
    };
    if body_len > MAX_REQUEST_BODY {
        return Err(ProtocolError::RequestTooLarge(body_len));
    }

    let total = head_end + 4 + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut message = buf.split_to(total);
    message.advance(head_end + 4);
    request.body = message.freeze();

    Ok(Some(Incoming::Request(request)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reason phrase for the status codes this server emits
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        459 => "Aggregate Operation Not Allowed",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<(String, Bytes)>,
}

impl RtspResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = Some((content_type.to_string(), body.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize, echoing the request's `CSeq`
    pub fn to_bytes(&self, cseq: Option<&str>) -> Bytes {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status, reason_phrase(self.status));
        if let Some(cseq) = cseq {
            out.push_str(&format!("CSeq: {}\r\n", cseq));
        }
        out.push_str(&format!(
            "Date: {}\r\n",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        out.push_str(concat!("Server: ar-streamer/", env!("CARGO_PKG_VERSION"), "\r\n"));
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }

        let mut bytes = BytesMut::new();
        match &self.body {
            Some((content_type, body)) => {
                out.push_str(&format!("Content-Type: {}\r\n", content_type));
                out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                bytes.extend_from_slice(out.as_bytes());
                bytes.extend_from_slice(body);
            }
            None => {
                out.push_str("\r\n");
                bytes.extend_from_slice(out.as_bytes());
            }
        }
        bytes.freeze()
    }
}
