use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// UpstreamSpec
// ---------------------------------------------------------------------------

/// What an Upstream publishes and where it goes. Forwarded verbatim in the
/// open handshake; seclay never interprets the identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    // ---
    pub source_id: String,

    pub destination_ids: Vec<String>,

    /// Ask the backend to resend the stream to late-joining destinations.
    pub resend: bool,

    /// Ask the backend to persist the stream.
    pub store: bool,

    /// Measurement the data belongs to, when the backend tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<Uuid>,
}

// ---

impl UpstreamSpec {
    // ---
    /// Minimal spec: publish `source_id` to nobody in particular, live only.
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_ids: Vec::new(),
            resend: false,
            store: false,
            measurement_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DownstreamSpec
// ---------------------------------------------------------------------------

/// Selects a subset of a source's units. Absent fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownstreamFilter {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

// ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamSpec {
    // ---
    pub source_id: String,

    /// Node receiving the stream; empty means "this client".
    #[serde(default)]
    pub destination_id: String,

    /// Empty means every unit from `source_id`.
    #[serde(default)]
    pub filters: Vec<DownstreamFilter>,
}

// ---

impl DownstreamSpec {
    // ---
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: String::new(),
            filters: Vec::new(),
        }
    }

    // ---

    /// `true` when a unit on `channel` passes at least one filter.
    ///
    /// Data type filtering is left to the backend; the client has no type
    /// information on a unit.
    pub fn accepts_channel(&self, channel: u8) -> bool {
        // ---
        self.filters.is_empty()
            || self
                .filters
                .iter()
                .any(|f| f.channel.map_or(true, |c| c == channel))
    }
}

// ---------------------------------------------------------------------------
// StreamSpec
// ---------------------------------------------------------------------------

/// Either kind of open spec; what the reconnection path replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSpec {
    Upstream(UpstreamSpec),
    Downstream(DownstreamSpec),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
