//! Error types for the streaming pipeline

use thiserror::Error;
use tokio::sync::mpsc;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes shared by every component.
///
/// Only `CodecFailure` and loss of the capture device tear down the whole
/// pipeline; every other kind stays inside the component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device or tracking hardware is incapable. Terminal, never retried.
    CapabilityUnsupported,
    /// Camera or network momentarily busy. Retried with bounded backoff.
    TransientUnavailable,
    /// Rejected before any resource was acquired.
    ConfigInvalid,
    /// Encoder setup or runtime failure. Aborts the session.
    CodecFailure,
    /// A capture device disappeared mid-session. Aborts the session.
    DeviceLost,
    /// Malformed or out-of-order client request. Only that client is torn down.
    ClientProtocolViolation,
    /// A unit or request was dropped; the session continues.
    ResourceExhausted,
}

impl ErrorKind {
    /// Whether this kind propagates to a full pipeline teardown
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::CodecFailure | ErrorKind::DeviceLost)
    }
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Error::Tracking(e) => e.kind(),
            Error::Capture(e) => e.kind(),
            Error::Codec(_) => ErrorKind::CodecFailure,
            Error::Protocol(_) => ErrorKind::ClientProtocolViolation,
            Error::Network(_) | Error::Io(_) => ErrorKind::TransientUnavailable,
            Error::Discovery(_) => ErrorKind::TransientUnavailable,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Whether the error must tear down the whole pipeline
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// AR tracking errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("Tracking is not supported on this device: {0}")]
    Unsupported(String),

    #[error("Tracking temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Tracking backend failed: {0}")]
    Backend(String),

    #[error("Depth image unavailable")]
    DepthUnavailable,
}

impl TrackingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackingError::Unsupported(_) => ErrorKind::CapabilityUnsupported,
            TrackingError::Unavailable(_) | TrackingError::Backend(_) => {
                ErrorKind::TransientUnavailable
            }
            TrackingError::DepthUnavailable => ErrorKind::ResourceExhausted,
        }
    }
}

/// Camera and microphone errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture stopped")]
    Stopped,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::DeviceNotFound(_) | CaptureError::UnsupportedFormat(_) => {
                ErrorKind::CapabilityUnsupported
            }
            CaptureError::Busy(_) | CaptureError::StreamError(_) | CaptureError::Stopped => {
                ErrorKind::TransientUnavailable
            }
            CaptureError::DeviceLost(_) => ErrorKind::DeviceLost,
        }
    }
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Unsupported encoder setting: {0}")]
    Unsupported(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Encoding stage is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// RTSP protocol errors raised by a client connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Method {method} not valid in state {state}")]
    InvalidState {
        method: String,
        state: &'static str,
    },

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Unknown session: {0}")]
    SessionNotFound(String),

    #[error("Unknown track: {0}")]
    TrackNotFound(String),

    #[error("Request too large: {0} bytes")]
    RequestTooLarge(usize),
}

/// Network errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("No usable local address")]
    NoLocalAddress,
}

/// Service discovery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Unregistration failed: {0}")]
    UnregistrationFailed(String),

    #[error("Discovery daemon unavailable: {0}")]
    DaemonUnavailable(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Channel through which background contexts hand failures to the supervisor
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<Error>,
}

impl FaultReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forward `err`. Dropped silently once the supervisor is gone.
    pub fn report(&self, err: impl Into<Error>) {
        let err = err.into();
        tracing::error!(kind = ?err.kind(), "Component failure: {}", err);
        let _ = self.tx.send(err);
    }
}
