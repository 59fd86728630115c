//! seclay connection engine.
//!
//! Multiplexes any number of logical streams over one duplex message
//! socket:
//!
//! - **Upstreams** produce records, framed into sections by SOS/EOS markers
//!   that a rotation task rolls over every `section_interval`.
//! - **Downstreams** consume units routed to them by stream ID.
//!
//! One [`FlushScheduler`] task owns the socket's write half and batches
//! everything queued within a `flush_interval` into one wire message. One
//! [`ReadLoop`] task owns the read half and routes every decoded element
//! through the correlation tables. Open and close are request/response
//! round trips correlated by an 8-bit request ID.
//!
//! With `auto_reconnect` (the default) a lost socket is replaced by the
//! supervisor and every open stream is re-opened with its original spec.
//!
//! ```rust,ignore
//! let conn = Connection::open(endpoint, Collaborators::new(connector), ConnConfig::default()).await?;
//! let up = conn.open_upstream(UpstreamSpec::new("sensor-7")).await?;
//! up.write(record).await?;
//! conn.close().await?;
//! ```

mod codec;
mod config;
mod connection;
mod correlation;
mod dispatch;
mod downstream;
mod id_alloc;
mod link;
mod outbound;
mod stream;
mod supervisor;
mod upstream;

#[cfg(test)]
mod test_support;

// --- public API
pub use codec::JsonCodec;
pub use config::ConnConfig;
pub use connection::{Collaborators, Connection, Endpoint};
pub use downstream::Downstream;
pub use id_alloc::IdAllocator;
pub use stream::StreamState;
pub use upstream::Upstream;

// Gateway re-exports; siblings import via super::Symbol
pub(crate) use connection::Shared;
pub(crate) use correlation::{InboundQueue, Response, StreamRoute, Tables};
pub(crate) use dispatch::ReadLoop;
pub(crate) use downstream::DownstreamInner;
pub(crate) use link::{Link, LinkEvent, LinkHandle, LossReporter};
pub(crate) use outbound::{FlushScheduler, Outbound};
pub(crate) use stream::LiveStream;
pub(crate) use upstream::UpstreamInner;
