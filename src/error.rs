//! Error types for the WebSocket engine

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Invalid WebSocket frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in text message
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Protocol violation
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("Connection reset by peer")]
    ConnectionReset,
    /// Reassembled message too large
    #[error("Message too large")]
    MessageTooLarge,
    /// Frame length field exceeds the configured maximum
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),
    /// Invalid HTTP request or response
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// No binding registered for the requested URI
    #[error("No binding for URI: {0}")]
    BindingNotFound(String),
    /// A binding already exists for this URI
    #[error("URI already bound: {0}")]
    DuplicateBinding(String),
    /// The accept callback rejected the connection
    #[error("Connection rejected by accept handler")]
    Rejected,
    /// Operation requires an open connection
    #[error("Connection is not open")]
    NotOpen,
    /// Send queue is full (backpressure)
    #[error("Send queue full")]
    BufferFull,
    /// Invalid close code
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Engine is shutting down
    #[error("Engine is shut down")]
    Shutdown,
    /// A connection listener panicked
    #[error("Listener panicked")]
    ListenerPanicked,
}

impl Error {
    /// Close status code sent to the peer when this error fails a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge | Error::FrameTooLarge(_) => CloseReason::TOO_BIG,
            Error::ListenerPanicked => CloseReason::INTERNAL,
            Error::Io(_) | Error::ConnectionClosed | Error::ConnectionReset => {
                CloseReason::GOING_AWAY
            }
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }

    /// Check if this error came from the transport rather than the peer's protocol usage
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::ConnectionReset
        )
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Parse a close frame payload (2-byte big-endian code, then UTF-8 reason)
    ///
    /// An empty payload yields `Ok(None)`.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("invalid close frame payload")),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !Self::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let reason =
                    std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(Self::new(code, reason)))
            }
        }
    }

    /// Serialize into a close frame payload
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
