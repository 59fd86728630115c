//! Error types for `seclay-ws`.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum WsError {
    // ---
    #[error("invalid request: {0}")]
    Request(String),

    #[error("invalid header {name}: {reason}")]
    Header { name: String, reason: String },

    #[error("websocket error: {0}")]
    Protocol(#[from] tungstenite::Error),

    #[error("text frames are not part of the protocol")]
    TextFrame,

    #[error("socket already closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Bridge to seclay_domain::SeclayError
// ---------------------------------------------------------------------------

impl From<WsError> for seclay_domain::SeclayError {
    // ---
    fn from(e: WsError) -> Self {
        seclay_domain::SeclayError::Transport(e.to_string())
    }
}
