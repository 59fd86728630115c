use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

// ---

use seclay_domain::{CodecPtr, Connector, Result, SeclayError, Socket};

// ---

use super::{LinkSimConfig, SimLink, SimPeer};

// ---------------------------------------------------------------------------
// LinkSimTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConnectLog {
    // ---
    url: Option<String>,
    headers: Vec<(String, String)>,

    /// Sever switches of connections that have not been severed yet.
    live: Vec<watch::Sender<bool>>,
}

// ---

struct TransportInner {
    // ---
    peer: SimPeer,
    refuse: AtomicU32,
    connects: AtomicU64,
    log: Mutex<ConnectLog>,
}

// ---

/// In-process mock transport. Does not use real sockets.
///
/// Every successful `connect` spawns a task in which the shared [`SimPeer`]
/// serves that connection. Cloning shares the peer and the connect log.
#[derive(Clone)]
pub struct LinkSimTransport {
    // ---
    inner: Arc<TransportInner>,
}

// ---

impl LinkSimTransport {
    // ---
    /// `codec` must match the one the client connection uses.
    pub fn new(config: LinkSimConfig, codec: CodecPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(TransportInner {
                peer: SimPeer::new(codec, &config),
                refuse: AtomicU32::new(config.refuse_connects),
                connects: AtomicU64::new(0),
                log: Mutex::new(ConnectLog::default()),
            }),
        }
    }

    // ---

    fn log(&self) -> MutexGuard<'_, ConnectLog> {
        self.inner.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    pub fn peer(&self) -> SimPeer {
        self.inner.peer.clone()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    pub fn last_url(&self) -> Option<String> {
        self.log().url.clone()
    }

    /// Headers presented by the most recent connect attempt.
    pub fn last_headers(&self) -> Vec<(String, String)> {
        self.log().headers.clone()
    }

    // ---

    /// Refuse the next `n` connects.
    pub fn refuse_next(&self, n: u32) {
        self.inner.refuse.store(n, Ordering::Relaxed);
    }

    // ---

    /// Kill every live connection. Both client halves start failing with a
    /// transport error and the peer drops its state for them.
    pub fn sever(&self) {
        // ---
        let live = std::mem::take(&mut self.log().live);
        tracing::info!(connections = live.len(), "sim: severing link");
        for switch in live {
            switch.send_replace(true);
        }
    }
}

// ---

#[async_trait]
impl Connector for LinkSimTransport {
    // ---
    async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<Socket> {
        // ---
        {
            let mut log = self.log();
            log.url = Some(url.to_string());
            log.headers = headers.to_vec();
        }

        let refused = self
            .inner
            .refuse
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            tracing::debug!(url, "sim: connect refused");
            return Err(SeclayError::Transport("connection refused".into()));
        }

        let id = self.inner.connects.fetch_add(1, Ordering::Relaxed) + 1;
        let (socket, link, switch) = SimLink::pair(id);
        self.log().live.push(switch);

        tokio::spawn(self.peer().serve(link));
        Ok(socket)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use seclay_domain::{
        DownstreamSpec, Element, ElementCodec, Record, RequestElement, RequestKind, UpstreamSpec,
    };

    use super::*;

    /// Minimal codec: one JSON array per message.
    struct PlainJson;

    impl ElementCodec for PlainJson {
        fn encode(&self, elements: &[Element]) -> Result<Vec<u8>> {
            serde_json::to_vec(elements).map_err(|e| SeclayError::Codec(e.to_string()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Vec<Element>> {
            serde_json::from_slice(bytes).map_err(|e| SeclayError::Codec(e.to_string()))
        }
    }

    // ---

    #[tokio::test]
    async fn peer_answers_open_and_records_it() {
        // ---
        let sim = LinkSimTransport::new(LinkSimConfig::perfect(), Arc::new(PlainJson));
        let headers = vec![("X-Edge-Token".to_string(), "abc".to_string())];
        let mut socket = sim.connect("sim://peer", &headers).await.unwrap();

        let open = RequestElement {
            req_id: 4,
            kind: RequestKind::OpenUpstream {
                stream_id: 1,
                spec: UpstreamSpec::new("src-a"),
            },
        };
        let message = PlainJson.encode(&[open.into()]).unwrap();
        socket.sink.send(message).await.unwrap();

        let reply = socket.source.recv().await.unwrap().unwrap();
        let reply = PlainJson.decode(&reply).unwrap();
        assert_eq!(reply, vec![Element::from(RequestElement::ok(4))]);

        assert_eq!(sim.last_headers(), headers);
        assert_eq!(sim.peer().open_upstreams(), 1);
        assert!(sim.peer().opens()[0].accepted);
    }

    // ---

    #[tokio::test]
    async fn refused_connects_then_success() {
        // ---
        let sim = LinkSimTransport::new(LinkSimConfig::refusing(2), Arc::new(PlainJson));
        assert!(sim.connect("sim://peer", &[]).await.is_err());
        assert!(sim.connect("sim://peer", &[]).await.is_err());
        assert!(sim.connect("sim://peer", &[]).await.is_ok());
        assert_eq!(sim.connects(), 1);
    }

    // ---

    #[tokio::test]
    async fn sever_drops_peer_state() {
        // ---
        let sim = LinkSimTransport::new(LinkSimConfig::perfect(), Arc::new(PlainJson));
        let mut socket = sim.connect("sim://peer", &[]).await.unwrap();
        let peer = sim.peer();
        assert!(
            peer.wait_for(std::time::Duration::from_secs(1), |p| p.live_connections() == 1)
                .await
        );

        sim.sever();

        assert!(socket.source.recv().await.is_err());
        assert!(
            peer.wait_for(std::time::Duration::from_secs(1), |p| p.live_connections() == 0)
                .await
        );
    }

    // ---

    /// Which of `n` published records reach one open Downstream.
    async fn delivery_pattern(config: LinkSimConfig, n: u8) -> Vec<bool> {
        // ---
        let sim = LinkSimTransport::new(config, Arc::new(PlainJson));
        let mut socket = sim.connect("sim://peer", &[]).await.unwrap();

        let open = RequestElement {
            req_id: 0,
            kind: RequestKind::OpenDownstream {
                stream_id: 1,
                spec: DownstreamSpec::new("src"),
            },
        };
        socket
            .sink
            .send(PlainJson.encode(&[open.into()]).unwrap())
            .await
            .unwrap();
        socket.source.recv().await.unwrap().unwrap();

        let record = Record {
            channel: 0,
            elapsed: std::time::Duration::ZERO,
            data: vec![1],
        };
        (0..n).map(|_| sim.peer().publish("src", &record) == 1).collect()
    }

    // ---

    #[tokio::test]
    async fn seeded_loss_is_reproducible() {
        // ---
        let first = delivery_pattern(LinkSimConfig::lossy(0.3, 11), 200).await;
        let again = delivery_pattern(LinkSimConfig::lossy(0.3, 11), 200).await;
        assert_eq!(first, again);

        let delivered = first.iter().filter(|d| **d).count();
        assert!((100..200).contains(&delivered), "delivered {delivered}");

        let perfect = delivery_pattern(LinkSimConfig::perfect(), 200).await;
        assert!(perfect.iter().all(|d| *d));
    }
}
