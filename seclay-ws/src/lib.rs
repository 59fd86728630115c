//! WebSocket transport for seclay.
//!
//! [`WsConnector`] implements [`seclay_domain::Connector`] over
//! `tokio-tungstenite`. One wire message travels as one binary frame. The
//! stream is split at connect time: the write half goes to the connection's
//! flush task, the read half to its read loop.

mod connector;
mod error;

// --- public API
pub use connector::WsConnector;
pub use error::WsError;
