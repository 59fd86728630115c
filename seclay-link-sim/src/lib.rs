//! In-process transport and remote peer for seclay unit and integration
//! testing.
//!
//! [`LinkSimTransport`] implements [`seclay_domain::Connector`] using tokio
//! channels instead of real sockets. Every `connect` is answered by a
//! [`SimPeer`], which plays the server side of the protocol: it answers
//! open/close requests, records what it receives, and publishes units to
//! the Downstreams open on it. [`LinkSimConfig`] controls injected
//! impairments:
//!
//! - Peer-to-client message drop probability
//! - Refused connects (for reconnect back-off)
//! - Deterministic RNG seed for reproducible runs
//!
//! [`LinkSimTransport::sever`] kills the live socket on demand.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use seclay_link_sim::{LinkSimConfig, LinkSimTransport};
//!
//! let transport = LinkSimTransport::new(LinkSimConfig::perfect(), codec);
//! let peer = transport.peer();
//! ```

mod config;
mod peer;
mod socket;
mod transport;

// --- public API
pub use config::LinkSimConfig;
pub use peer::{OpenRecord, SimPeer};
pub use transport::LinkSimTransport;

pub(crate) use socket::SimLink;
