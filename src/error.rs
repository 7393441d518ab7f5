use thiserror::Error;

/// Classifies every error the broker can surface, so callers can branch on
/// scope without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested identity fails validation.
    InvalidId,
    /// The relay rejected our access key.
    InvalidKey,
    /// The relay reports the requested identity is already held by another
    /// session.
    UnavailableId,
    /// Generic relay-reported failure.
    ServerError,
    /// The signaling websocket could not be established.
    SocketError,
    /// Lost the signaling connection; existing peer connections survive.
    Network,
    /// The relay could not reach the target peer.
    PeerUnavailable,
    /// Negotiation or transport failure scoped to one connection.
    Negotiation,
    /// A payload could not be converted to or from channel bytes.
    Serialization,
    /// A send was attempted on a connection that is not open.
    NotOpen,
    /// An operation was attempted after the session disconnected.
    Disconnected,
}

impl ErrorKind {
    /// Fatal kinds tear down the session (or the connection, for
    /// connection-scoped kinds); the rest are recoverable.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidId
                | ErrorKind::InvalidKey
                | ErrorKind::UnavailableId
                | ErrorKind::ServerError
                | ErrorKind::SocketError
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::UnavailableId => "unavailable-id",
            ErrorKind::ServerError => "server-error",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::Network => "network",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::Negotiation => "negotiation",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NotOpen => "not-open",
            ErrorKind::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed error event, surfaced on the smallest affected scope (connection
/// before session).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failures inside a transport-session collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation step failed: {0}")]
    Negotiation(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Failures inside the payload codec collaborator.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload encode failed: {0}")]
    Encode(String),
    #[error("payload decode failed: {0}")]
    Decode(String),
}
