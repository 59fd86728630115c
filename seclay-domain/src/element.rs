use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::spec::{DownstreamSpec, UpstreamSpec};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Per-connection stream identifier. Wraps at 256; `0` is never issued.
pub type StreamId = u8;

/// Per-connection request identifier used to pair a handshake with its
/// response. Wraps at 256.
pub type RequestId = u8;

// ---------------------------------------------------------------------------
// ResultCode
// ---------------------------------------------------------------------------

/// Outcome carried by every handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    Ng,
}

// ---------------------------------------------------------------------------
// RequestElement
// ---------------------------------------------------------------------------

/// Open/close handshake traffic. Requests flow client → peer, the matching
/// `Response` flows back with the same `req_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestElement {
    // ---
    pub req_id: RequestId,
    pub kind: RequestKind,
}

// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum RequestKind {
    // ---
    OpenUpstream {
        stream_id: StreamId,
        spec: UpstreamSpec,
    },

    OpenDownstream {
        stream_id: StreamId,
        spec: DownstreamSpec,
    },

    Close {
        stream_id: StreamId,
    },

    Response {
        code: ResultCode,
        /// Free-form explanation, usually only present on `Ng`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

// ---

impl RequestElement {
    // ---
    /// Build the `Ok` answer for request `req_id`.
    pub fn ok(req_id: RequestId) -> Self {
        Self {
            req_id,
            kind: RequestKind::Response {
                code: ResultCode::Ok,
                reason: None,
            },
        }
    }

    // ---

    /// Build an `Ng` answer for request `req_id`.
    pub fn ng(req_id: RequestId, reason: impl Into<String>) -> Self {
        Self {
            req_id,
            kind: RequestKind::Response {
                code: ResultCode::Ng,
                reason: Some(reason.into()),
            },
        }
    }

    // ---

    /// Short label used in logs and rejection errors.
    pub fn op_name(&self) -> &'static str {
        match self.kind {
            RequestKind::OpenUpstream { .. } => "open upstream",
            RequestKind::OpenDownstream { .. } => "open downstream",
            RequestKind::Close { .. } => "close",
            RequestKind::Response { .. } => "response",
        }
    }
}

// ---------------------------------------------------------------------------
// Stream elements
// ---------------------------------------------------------------------------

/// One application data record as supplied by an Upstream caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    // ---
    pub channel: u8,

    /// Time since the start of the measurement.
    pub elapsed: Duration,

    pub data: Vec<u8>,
}

// ---

/// A [`Record`] stamped with the stream it travels on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    // ---
    pub stream_id: StreamId,
    pub channel: u8,
    pub elapsed: Duration,
    pub data: Vec<u8>,
}

// ---

impl Unit {
    // ---
    pub fn new(stream_id: StreamId, record: Record) -> Self {
        Self {
            stream_id,
            channel: record.channel,
            elapsed: record.elapsed,
            data: record.data,
        }
    }
}

// ---

/// Start-of-section marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SosMarker {
    pub stream_id: StreamId,
    pub serial: u32,
}

/// End-of-section marker. `final_section` is set only on the marker that
/// precedes the stream's close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EosMarker {
    pub stream_id: StreamId,
    pub serial: u32,
    #[serde(rename = "final")]
    pub final_section: bool,
}

// ---

/// Everything that is routed by stream ID rather than by request ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamElement {
    Unit(Unit),
    Sos(SosMarker),
    Eos(EosMarker),
}

// ---

impl StreamElement {
    // ---
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamElement::Unit(u) => u.stream_id,
            StreamElement::Sos(m) => m.stream_id,
            StreamElement::Eos(m) => m.stream_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// The unit exchanged over the wire. A wire message carries a batch of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum Element {
    Request(RequestElement),
    Stream(StreamElement),
}

// ---

impl From<RequestElement> for Element {
    fn from(r: RequestElement) -> Self {
        Element::Request(r)
    }
}

impl From<StreamElement> for Element {
    fn from(s: StreamElement) -> Self {
        Element::Stream(s)
    }
}

impl From<Unit> for Element {
    fn from(u: Unit) -> Self {
        Element::Stream(StreamElement::Unit(u))
    }
}

impl From<SosMarker> for Element {
    fn from(m: SosMarker) -> Self {
        Element::Stream(StreamElement::Sos(m))
    }
}

impl From<EosMarker> for Element {
    fn from(m: EosMarker) -> Self {
        Element::Stream(StreamElement::Eos(m))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    #[test]
    fn stream_id_is_read_from_every_variant() {
        // ---
        let unit = StreamElement::Unit(Unit {
            stream_id: 7,
            channel: 1,
            elapsed: Duration::from_millis(5),
            data: vec![1, 2],
        });
        let sos = StreamElement::Sos(SosMarker {
            stream_id: 8,
            serial: 0,
        });
        let eos = StreamElement::Eos(EosMarker {
            stream_id: 9,
            serial: 0,
            final_section: true,
        });

        assert_eq!(unit.stream_id(), 7);
        assert_eq!(sos.stream_id(), 8);
        assert_eq!(eos.stream_id(), 9);
    }

    // ---

    #[test]
    fn eos_final_flag_uses_wire_name() {
        // ---
        let eos: Element = EosMarker {
            stream_id: 3,
            serial: 12,
            final_section: true,
        }
        .into();

        let json = serde_json::to_string(&eos).unwrap();
        assert!(json.contains("\"final\":true"), "unexpected encoding: {json}");
    }

    // ---

    #[test]
    fn ng_response_carries_reason() {
        // ---
        let resp = RequestElement::ng(4, "unknown source");
        match resp.kind {
            RequestKind::Response { code, reason } => {
                assert_eq!(code, ResultCode::Ng);
                assert_eq!(reason.as_deref(), Some("unknown source"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
