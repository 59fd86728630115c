//! Stream lifecycle shared by Upstream and Downstream.
//!
//! ```text
//! Opening ──► Active ──► Closing ──► Closed
//!               │  ▲
//!   socket lost ▼  │ re-opened
//!             Suspended ──► Closing (close during reconnect)
//! ```

use std::sync::Arc;

// ---

use seclay_domain::{Result, StreamId, StreamSpec};

// ---

use super::{DownstreamInner, InboundQueue, LinkHandle, Shared, UpstreamInner};

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    // ---
    /// Open request sent, response pending.
    Opening,

    /// Open on the current link.
    Active,

    /// The link was lost; waiting for the supervisor to re-open the stream.
    Suspended,

    /// `close()` in progress.
    Closing,

    /// Terminal.
    Closed,
}

// ---

impl StreamState {
    // ---
    pub fn is_closed(self) -> bool {
        matches!(self, StreamState::Closing | StreamState::Closed)
    }
}

// ---------------------------------------------------------------------------
// LiveStream
// ---------------------------------------------------------------------------

/// A registered stream as seen by the connection and the supervisor.
#[derive(Clone)]
pub(crate) enum LiveStream {
    // ---
    Upstream(Arc<UpstreamInner>),
    Downstream(Arc<DownstreamInner>),
}

// ---

impl LiveStream {
    // ---
    pub(crate) fn key(&self) -> u64 {
        match self {
            LiveStream::Upstream(s) => s.key(),
            LiveStream::Downstream(s) => s.key(),
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        match self {
            LiveStream::Upstream(s) => s.stream_id(),
            LiveStream::Downstream(s) => s.stream_id(),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        match self {
            LiveStream::Upstream(s) => s.state(),
            LiveStream::Downstream(s) => s.state(),
        }
    }

    pub(crate) fn spec(&self) -> StreamSpec {
        match self {
            LiveStream::Upstream(s) => StreamSpec::Upstream(s.spec().clone()),
            LiveStream::Downstream(s) => StreamSpec::Downstream(s.spec().clone()),
        }
    }

    /// Inbound queue, for Downstreams.
    pub(crate) fn inbound(&self) -> Option<Arc<InboundQueue>> {
        match self {
            LiveStream::Upstream(_) => None,
            LiveStream::Downstream(s) => Some(s.queue()),
        }
    }

    // ---

    pub(crate) async fn close(&self) -> Result<()> {
        match self {
            LiveStream::Upstream(s) => s.close().await,
            LiveStream::Downstream(s) => s.close().await,
        }
    }

    pub(crate) async fn suspend(&self) {
        match self {
            LiveStream::Upstream(s) => s.suspend().await,
            LiveStream::Downstream(s) => s.suspend().await,
        }
    }

    pub(crate) async fn reopen(&self, shared: &Shared, link: &LinkHandle) -> Result<()> {
        match self {
            LiveStream::Upstream(s) => s.reopen(shared, link).await,
            LiveStream::Downstream(s) => s.reopen(shared, link).await,
        }
    }

    /// Mark closed without any handshake; used when the stream cannot be
    /// re-opened or the connection is gone.
    pub(crate) fn abandon(&self) {
        match self {
            LiveStream::Upstream(s) => s.abandon(),
            LiveStream::Downstream(s) => s.abandon(),
        }
    }
}
