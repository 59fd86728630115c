//! [`SimPeer`]: the server side of the protocol, scripted for tests.
//!
//! The peer answers every open and close request with `Ok` unless told to
//! reject a source or to stay silent. It keeps a log of what it received so
//! tests can assert on the exact element sequence a client put on the wire.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};

// ---

use seclay_domain::{
    //
    CodecPtr,
    DownstreamSpec,
    Element,
    Record,
    RequestElement,
    RequestKind,
    Result,
    SeclayError,
    StreamElement,
    StreamId,
    StreamSpec,
    Unit,
    UpstreamSpec,
};

// ---

use super::{LinkSimConfig, SimLink};

// ---------------------------------------------------------------------------
// OpenRecord
// ---------------------------------------------------------------------------

/// One open request as the peer saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRecord {
    // ---
    /// Which simulated connection (1-based, in connect order).
    pub conn: u64,
    pub stream_id: StreamId,
    pub spec: StreamSpec,
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// PeerState
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PeerState {
    // ---
    conns: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    upstreams: BTreeMap<(u64, StreamId), UpstreamSpec>,
    downstreams: BTreeMap<(u64, StreamId), DownstreamSpec>,

    opens: Vec<OpenRecord>,
    closes: Vec<(u64, StreamId)>,
    received: Vec<StreamElement>,

    reject_sources: HashSet<String>,
    mute: bool,
}

// ---

struct PeerInner {
    // ---
    codec: CodecPtr,
    drop_percent: f64,
    rng: Mutex<StdRng>,
    state: Mutex<PeerState>,

    /// Bumped after every change so tests can wait on the log.
    changed: watch::Sender<u64>,
}

// ---------------------------------------------------------------------------
// SimPeer
// ---------------------------------------------------------------------------

/// Shared handle onto the simulated server. Cheap to clone.
#[derive(Clone)]
pub struct SimPeer {
    // ---
    inner: Arc<PeerInner>,
}

// ---

impl SimPeer {
    // ---
    pub fn new(codec: CodecPtr, config: &LinkSimConfig) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            inner: Arc::new(PeerInner {
                codec,
                drop_percent: config.drop_percent,
                rng: Mutex::new(rng),
                state: Mutex::new(PeerState::default()),
                changed: watch::channel(0).0,
            }),
        }
    }

    // ---

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.inner.changed.send_modify(|n| *n += 1);
    }

    // ---

    /// Answer `Ng` to opens whose spec names `source_id`.
    pub fn reject_source(&self, source_id: impl Into<String>) {
        self.state().reject_sources.insert(source_id.into());
    }

    pub fn allow_source(&self, source_id: &str) {
        self.state().reject_sources.remove(source_id);
    }

    /// Stop answering requests (client round trips then time out).
    pub fn set_mute(&self, mute: bool) {
        self.state().mute = mute;
    }

    // ---

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.state().opens.clone()
    }

    pub fn closes(&self) -> Vec<(u64, StreamId)> {
        self.state().closes.clone()
    }

    /// Every stream element received, in arrival order.
    pub fn received(&self) -> Vec<StreamElement> {
        self.state().received.clone()
    }

    pub fn open_upstreams(&self) -> usize {
        self.state().upstreams.len()
    }

    pub fn open_downstreams(&self) -> usize {
        self.state().downstreams.len()
    }

    pub fn live_connections(&self) -> usize {
        self.state().conns.len()
    }

    // ---

    /// Wait until `pred` holds, re-checking after every peer-side change.
    /// Returns `false` on timeout.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&SimPeer) -> bool,
    {
        // ---
        let mut rx = self.inner.changed.subscribe();
        let wait = async {
            loop {
                if pred(self) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && pred(self)
    }

    // ---

    /// Send `record` as a unit to every open Downstream on `source_id`
    /// whose filters accept its channel. Returns how many were sent.
    pub fn publish(&self, source_id: &str, record: &Record) -> usize {
        // ---
        let targets: Vec<(StreamId, mpsc::UnboundedSender<Vec<u8>>)> = {
            let st = self.state();
            st.downstreams
                .iter()
                .filter(|(_, spec)| {
                    spec.source_id == source_id && spec.accepts_channel(record.channel)
                })
                .filter_map(|((conn, stream_id), _)| {
                    st.conns.get(conn).map(|tx| (*stream_id, tx.clone()))
                })
                .collect()
        };

        let mut sent = 0;
        for (stream_id, tx) in targets {
            if self.should_drop() {
                tracing::debug!(stream_id, "sim: dropped published unit");
                continue;
            }
            let unit = Unit::new(stream_id, record.clone());
            match self.inner.codec.encode(&[unit.into()]) {
                Ok(message) => {
                    if tx.send(message).is_ok() {
                        sent += 1;
                    }
                }
                Err(e) => tracing::warn!("sim: encode failed: {e}"),
            }
        }
        sent
    }

    // ---

    /// Push raw elements to the most recent connection.
    pub fn send_raw(&self, elements: &[Element]) -> Result<()> {
        // ---
        let tx = {
            let st = self.state();
            st.conns
                .iter()
                .max_by_key(|(id, _)| **id)
                .map(|(_, tx)| tx.clone())
        };
        let tx = tx.ok_or_else(|| SeclayError::Transport("no live connection".into()))?;
        let message = self.inner.codec.encode(elements)?;
        tx.send(message)
            .map_err(|_| SeclayError::Transport("connection gone".into()))
    }

    // ---

    fn should_drop(&self) -> bool {
        // ---
        if self.inner.drop_percent <= 0.0 {
            return false;
        }
        let mut rng = self.inner.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_bool(self.inner.drop_percent.min(1.0))
    }

    // ---

    /// Serve one simulated connection until the client closes it or it is
    /// severed.
    pub(crate) async fn serve(self, link: SimLink) {
        // ---
        let SimLink {
            id,
            tx,
            mut rx,
            mut severed,
        } = link;

        self.state().conns.insert(id, tx.clone());
        self.bump();
        tracing::debug!(conn = id, "sim: connection up");

        loop {
            let message = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = severed.wait_for(|s| *s) => break,
            };

            let elements = match self.inner.codec.decode(&message) {
                Ok(elements) => elements,
                Err(e) => {
                    tracing::warn!(conn = id, "sim: undecodable message: {e}");
                    continue;
                }
            };

            let replies: Vec<Element> = elements
                .into_iter()
                .filter_map(|el| self.handle(id, el))
                .map(Element::from)
                .collect();

            if !replies.is_empty() {
                match self.inner.codec.encode(&replies) {
                    Ok(reply) => {
                        let _ = tx.send(reply);
                    }
                    Err(e) => tracing::warn!(conn = id, "sim: encode failed: {e}"),
                }
            }
            self.bump();
        }

        {
            let mut st = self.state();
            st.conns.remove(&id);
            st.upstreams.retain(|(conn, _), _| *conn != id);
            st.downstreams.retain(|(conn, _), _| *conn != id);
        }
        self.bump();
        tracing::debug!(conn = id, "sim: connection down");
    }

    // ---

    /// Apply one client element; returns the response to send, if any.
    fn handle(&self, conn: u64, element: Element) -> Option<RequestElement> {
        // ---
        let mut st = self.state();

        let (req_id, kind) = match element {
            Element::Stream(el) => {
                st.received.push(el);
                return None;
            }
            Element::Request(RequestElement { req_id, kind }) => (req_id, kind),
        };

        let reply = match kind {
            RequestKind::OpenUpstream { stream_id, spec } => {
                let accepted = !st.reject_sources.contains(&spec.source_id);
                if accepted {
                    st.upstreams.insert((conn, stream_id), spec.clone());
                }
                st.opens.push(OpenRecord {
                    conn,
                    stream_id,
                    spec: StreamSpec::Upstream(spec),
                    accepted,
                });
                verdict(req_id, accepted)
            }

            RequestKind::OpenDownstream { stream_id, spec } => {
                let accepted = !st.reject_sources.contains(&spec.source_id);
                if accepted {
                    st.downstreams.insert((conn, stream_id), spec.clone());
                }
                st.opens.push(OpenRecord {
                    conn,
                    stream_id,
                    spec: StreamSpec::Downstream(spec),
                    accepted,
                });
                verdict(req_id, accepted)
            }

            RequestKind::Close { stream_id } => {
                st.upstreams.remove(&(conn, stream_id));
                st.downstreams.remove(&(conn, stream_id));
                st.closes.push((conn, stream_id));
                RequestElement::ok(req_id)
            }

            RequestKind::Response { .. } => {
                tracing::debug!(conn, req_id, "sim: unexpected response from client");
                return None;
            }
        };

        if st.mute {
            return None;
        }
        Some(reply)
    }
}

// ---

fn verdict(req_id: u8, accepted: bool) -> RequestElement {
    if accepted {
        RequestElement::ok(req_id)
    } else {
        RequestElement::ng(req_id, "source not permitted")
    }
}
