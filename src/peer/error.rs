use thiserror::Error;

/// Errors terminating a single peer connection.
///
/// These never outlive the connection that produced them: the torrent and
/// the client keep running.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that are not a BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// A frame exceeding the single-message cap.
    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),

    /// A syntactically broken protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// A message ID this implementation does not speak.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A well-formed message that violates protocol rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote closed the connection.
    #[error("connection closed")]
    Closed,

    /// No message arrived within the read deadline.
    #[error("read timed out")]
    Timeout,

    /// Malformed bencode inside a control message.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

impl PeerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        PeerError::Protocol(msg.into())
    }
}
