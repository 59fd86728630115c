//! Core types and collaborator traits for the seclay streaming connection.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `seclay-domain` and speak its types. No engine logic lives here.
//!
//! # Structure
//!
//! - [`error`]    : [`SeclayError`] and [`Result<T>`] alias
//! - [`element`]  : [`Element`] sum type exchanged over the wire
//! - [`spec`]     : [`UpstreamSpec`], [`DownstreamSpec`] and filters
//! - [`transport`]: [`Connector`], [`SocketSink`], [`SocketSource`], [`LinkState`]
//! - [`auth`]     : [`Credentials`], [`AuthToken`], [`Authenticator`]
//! - [`codec`]    : [`ElementCodec`] boundary

mod auth;
mod codec;
mod element;
mod error;
mod spec;
mod transport;

// --- error
pub use error::{Result, SeclayError};

// --- element
pub use element::{
    // ---
    Element,
    EosMarker,
    Record,
    RequestElement,
    RequestId,
    RequestKind,
    ResultCode,
    SosMarker,
    StreamElement,
    StreamId,
    Unit,
};

// --- spec
pub use spec::{DownstreamFilter, DownstreamSpec, StreamSpec, UpstreamSpec};

// --- transport
pub use transport::{
    // ---
    Connector,
    LinkState,
    Socket,
    SocketSink,
    SocketSinkPtr,
    SocketSource,
    SocketSourcePtr,
};

// --- auth
pub use auth::{AuthToken, Authenticator, Credentials, PassthroughAuth};

// --- codec
pub use codec::{CodecPtr, ElementCodec};
