use async_trait::async_trait;

use super::error::Result;

// ---------------------------------------------------------------------------
// LinkState
// ---------------------------------------------------------------------------

/// Observable state of a connection's physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    // ---
    /// Authenticating and establishing the first socket.
    Connecting,

    /// Socket up; flush and read loops running.
    Connected,

    /// Socket lost; streams are suspended while the supervisor retries.
    Reconnecting,

    /// `close()` in progress. No new streams may be opened.
    Closing,

    /// Terminal.
    Closed,
}

// ---

impl LinkState {
    // ---
    /// `true` once the connection will never carry traffic again.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, LinkState::Closing | LinkState::Closed)
    }
}

// ---------------------------------------------------------------------------
// Socket halves
// ---------------------------------------------------------------------------

/// Write half of a duplex message socket.
///
/// Owned exclusively by the flush scheduler: one writer per socket.
#[async_trait]
pub trait SocketSink: Send {
    // ---
    /// Send one complete wire message.
    async fn send(&mut self, message: Vec<u8>) -> Result<()>;

    /// Close the socket gracefully. The peer observes EOF.
    async fn close(&mut self) -> Result<()>;
}

// ---

/// Read half of a duplex message socket.
///
/// Owned exclusively by the read dispatch loop: one reader per socket.
#[async_trait]
pub trait SocketSource: Send {
    // ---
    /// Block until the next wire message arrives.
    ///
    /// Returns `Ok(None)` on clean EOF.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

// ---

/// Convenience type alias for a heap-allocated [`SocketSink`].
pub type SocketSinkPtr = Box<dyn SocketSink>;

/// Convenience type alias for a heap-allocated [`SocketSource`].
pub type SocketSourcePtr = Box<dyn SocketSource>;

// ---

/// A connected socket, split at connect time so the two halves can be owned
/// by different tasks.
pub struct Socket {
    // ---
    pub sink: SocketSinkPtr,
    pub source: SocketSourcePtr,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Factory for sockets.
///
/// Implementations: `seclay_ws::WsConnector`, `seclay_link_sim::LinkSimTransport`.
#[async_trait]
pub trait Connector: Send + Sync {
    // ---
    /// Open a socket to `url`, attaching `headers` to the opening request.
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<Socket>;
}
