//! Read dispatch loop: the sole reader of one socket.
//!
//! Decodes each wire message and routes every element by ID: responses to
//! the request table, stream elements to the stream table. Misses are
//! expected (the local side may already have retired the ID) and are
//! dropped at `debug`.

use std::sync::Arc;

use seclay_domain::{CodecPtr, Element, RequestElement, RequestKind, SocketSourcePtr};

// ---

use super::{LossReporter, Response, Tables};

// ---------------------------------------------------------------------------
// ReadLoop
// ---------------------------------------------------------------------------

pub(crate) struct ReadLoop {
    // ---
    source: SocketSourcePtr,
    codec: CodecPtr,
    tables: Arc<Tables>,
    generation: u64,
    loss: LossReporter,
}

// ---

impl ReadLoop {
    // ---
    pub(crate) fn new(
        source: SocketSourcePtr,
        codec: CodecPtr,
        tables: Arc<Tables>,
        loss: LossReporter,
    ) -> Self {
        // ---
        Self {
            source,
            codec,
            tables,
            generation: loss.generation(),
            loss,
        }
    }

    // ---

    /// Read until EOF or a transport error, then report the loss and exit.
    ///
    /// EOF is reported too: after a local shutdown the supervisor ignores it,
    /// otherwise the peer went away and that is a loss like any other.
    pub(crate) async fn run(mut self) {
        // ---
        let reason = loop {
            match self.source.recv().await {
                Ok(Some(message)) => match self.codec.decode(&message) {
                    Ok(elements) => {
                        for element in elements {
                            self.dispatch(element);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            generation = self.generation,
                            "dropping undecodable message: {e}"
                        );
                    }
                },
                Ok(None) => break "socket closed".to_string(),
                Err(e) => break format!("read failed: {e}"),
            }
        };

        tracing::debug!(generation = self.generation, %reason, "read loop exiting");
        self.loss.report(reason);
    }

    // ---

    fn dispatch(&self, element: Element) {
        // ---
        match element {
            Element::Request(RequestElement {
                req_id,
                kind: RequestKind::Response { code, reason },
            }) => {
                if !self.tables.requests.resolve(req_id, Response { code, reason }) {
                    tracing::debug!(req_id, "response for unknown request dropped");
                }
            }

            Element::Request(request) => {
                tracing::warn!(
                    req_id = request.req_id,
                    op = request.op_name(),
                    "peer sent a request; dropped"
                );
            }

            Element::Stream(el) => {
                let stream_id = el.stream_id();
                if !self.tables.streams.route(el) {
                    tracing::debug!(stream_id, "element for unknown stream dropped");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
