use std::sync::Arc;

use super::element::Element;
use super::error::Result;

// ---------------------------------------------------------------------------
// ElementCodec
// ---------------------------------------------------------------------------

/// Turns batches of [`Element`]s into wire messages and back.
///
/// Both directions are pure: no I/O, no state carried between calls.
/// One `encode` call produces exactly one wire message; `decode` must accept
/// anything `encode` produced and preserve element order.
pub trait ElementCodec: Send + Sync + 'static {
    // ---
    fn encode(&self, elements: &[Element]) -> Result<Vec<u8>>;

    fn decode(&self, message: &[u8]) -> Result<Vec<Element>>;
}

// ---

/// Shared codec handle; cloned into the flush and read loops.
pub type CodecPtr = Arc<dyn ElementCodec>;
