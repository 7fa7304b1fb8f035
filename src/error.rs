use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// A transport endpoint could not be bound. Fatal at startup: the
    /// controller unwinds every listener bound so far and stays stopped.
    #[error("endpoint unavailable: {endpoint}: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    /// A payload could not be decoded into a `Value`. Reported on the
    /// owning consumer's error channel; the message is dropped.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Unsubscribe of a handle that is no longer registered. Callers treat
    /// this as a no-op.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(u64),

    /// Connection-level I/O failure. Isolated to the connection it
    /// happened on.
    #[error("transport I/O error: {0}")]
    TransportIo(String),

    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported transport scheme: {0}")]
    UnsupportedScheme(String),

    /// A peer violated its protocol's framing rules.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("frame too large: size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BrokerError {
    /// True for errors that mean "the peer went away", which accept loops
    /// and sessions log quietly instead of treating as faults.
    #[must_use]
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::TransportIo(msg) => {
                msg.contains("Connection reset") || msg.contains("broken pipe")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => BrokerError::ConnectionClosed,
            _ => BrokerError::TransportIo(err.to_string()),
        }
    }
}
