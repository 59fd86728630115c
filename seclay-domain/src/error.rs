use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum SeclayError {
    // ---
    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The peer answered a handshake with `ResultCode::Ng`.
    #[error("{op} rejected by peer: {reason}")]
    Rejected { op: &'static str, reason: String },

    /// The connection is closing or closed; nothing new may start.
    #[error("connection closed")]
    ConnectionClosed,

    /// The socket died while the operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    #[error("stream closed")]
    StreamClosed,

    /// The stream is parked while the connection reconnects.
    #[error("stream suspended while reconnecting")]
    StreamSuspended,

    #[error("no free {0} identifier")]
    IdsExhausted(&'static str),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl SeclayError {
    // ---
    /// `true` for failures caused by the socket going away rather than by the
    /// peer or the caller.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            SeclayError::ConnectionLost | SeclayError::Transport(_) | SeclayError::Io(_)
        )
    }
}

// ---

pub type Result<T> = std::result::Result<T, SeclayError>;
