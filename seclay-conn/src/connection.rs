//! [`Connection`]: owns the socket, the link tasks, and the set of live streams.
//!
//! # Layering
//!
//! ```text
//! Connection (public handle)
//!   └─ Shared (Arc)
//!        ├─ Link           flush scheduler + read loop for the current socket
//!        ├─ Tables         request / stream correlation, shared with the read loop
//!        ├─ registry       every open Upstream / Downstream, survives reconnects
//!        └─ state_tx       LinkState watch
//!   └─ supervisor task     reacts to LinkEvent::Lost
//! ```
//!
//! Streams hold a `Weak<Shared>`; the connection owns them, not the other
//! way round.
//!
//! # The open gate
//!
//! `open_gate` is an async `RwLock<()>`. Opens hold it shared from the
//! moment they pick a link until the new stream is in the registry.
//! Suspension and `close()` take it exclusively before snapshotting the
//! registry, so no stream can slip in half-opened.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;

// ---

use seclay_domain::{
    //
    Authenticator,
    CodecPtr,
    Connector,
    Credentials,
    DownstreamSpec,
    LinkState,
    PassthroughAuth,
    RequestElement,
    RequestKind,
    Result,
    ResultCode,
    SeclayError,
    Unit,
    UpstreamSpec,
};

// ---

use super::{
    supervisor, ConnConfig, Downstream, JsonCodec, Link, LinkEvent, LinkHandle, LiveStream,
    Response, Tables, Upstream,
};

// ---------------------------------------------------------------------------
// Endpoint / Collaborators
// ---------------------------------------------------------------------------

/// Where to connect and as whom.
#[derive(Debug, Clone)]
pub struct Endpoint {
    // ---
    pub url: String,
    pub credentials: Credentials,
}

// ---

impl Endpoint {
    // ---
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }
}

// ---

/// The pluggable pieces a connection is built from.
#[derive(Clone)]
pub struct Collaborators {
    // ---
    pub connector: Arc<dyn Connector>,
    pub authenticator: Arc<dyn Authenticator>,
    pub codec: CodecPtr,
}

// ---

impl Collaborators {
    // ---
    /// `connector` with [`PassthroughAuth`] and [`JsonCodec`].
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            authenticator: Arc::new(PassthroughAuth),
            codec: Arc::new(JsonCodec),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_codec(mut self, codec: CodecPtr) -> Self {
        self.codec = codec;
        self
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    // ---
    pub config: ConnConfig,
    endpoint: Endpoint,
    collab: Collaborators,
    pub tables: Arc<Tables>,

    state_tx: watch::Sender<LinkState>,

    /// Current link; `None` while reconnecting and after close.
    link: Mutex<Option<Link>>,

    /// Last generation number handed out.
    generations: AtomicU64,

    /// Every stream that has finished opening and not yet closed.
    registry: Mutex<BTreeMap<u64, LiveStream>>,
    next_key: AtomicU64,

    events_tx: mpsc::UnboundedSender<LinkEvent>,

    pub open_gate: RwLock<()>,
}

// ---

impl Shared {
    // ---
    fn new(
        endpoint: Endpoint,
        collab: Collaborators,
        config: ConnConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        // ---
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            config,
            endpoint,
            collab,
            tables: Arc::new(Tables::new()),
            state_tx: watch::channel(LinkState::Connecting).0,
            link: Mutex::new(None),
            generations: AtomicU64::new(0),
            registry: Mutex::new(BTreeMap::new()),
            next_key: AtomicU64::new(0),
            events_tx,
            open_gate: RwLock::new(()),
        });
        (shared, events_rx)
    }

    // ---

    fn link_slot(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<u64, LiveStream>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    pub(crate) fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Move to `state` unless `close()` has already started.
    pub(crate) fn set_state(&self, state: LinkState) {
        // ---
        self.state_tx.send_if_modified(|current| {
            if *current == state || current.is_shutting_down() {
                return false;
            }
            tracing::info!(from = ?*current, to = ?state, "link state");
            *current = state;
            true
        });
    }

    /// Fail fast once `close()` has started.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        // ---
        if self.state().is_shutting_down() {
            return Err(SeclayError::ConnectionClosed);
        }
        Ok(())
    }

    // ---

    pub(crate) fn current_generation(&self) -> Option<u64> {
        self.link_slot().as_ref().map(Link::generation)
    }

    /// The current link, only while [`LinkState::Connected`].
    pub(crate) fn live_link(&self) -> Option<LinkHandle> {
        // ---
        if self.state() != LinkState::Connected {
            return None;
        }
        self.link_slot().as_ref().map(Link::handle)
    }

    /// The current link if it is still `generation`, whatever the state.
    ///
    /// Used by stream close handshakes, which are allowed during
    /// connection close but not across a reconnect.
    pub(crate) fn link_for(&self, generation: u64) -> Option<LinkHandle> {
        // ---
        self.link_slot()
            .as_ref()
            .filter(|link| link.generation() == generation)
            .map(Link::handle)
    }

    // ---

    /// Wait, bounded by `request_timeout`, until the link is usable.
    async fn wait_connected(&self) -> Result<()> {
        // ---
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            self.config.request_timeout,
            rx.wait_for(|s| *s == LinkState::Connected || s.is_shutting_down()),
        )
        .await;

        let state = match waited {
            Err(_) => return Err(SeclayError::Timeout { op: "open" }),
            Ok(Err(_)) => return Err(SeclayError::ConnectionClosed),
            Ok(Ok(state)) => *state,
        };

        if state.is_shutting_down() {
            return Err(SeclayError::ConnectionClosed);
        }
        Ok(())
    }

    // ---

    /// Pick a link for a new stream and hold the open gate.
    ///
    /// During a reconnection window this waits for the link to come back.
    pub(crate) async fn begin_open(&self) -> Result<(LinkHandle, RwLockReadGuard<'_, ()>)> {
        // ---
        loop {
            self.ensure_open()?;
            self.wait_connected().await?;

            let gate = self.open_gate.read().await;
            self.ensure_open()?;
            if let Some(link) = self.live_link() {
                return Ok((link, gate));
            }
            // Lost again between the wait and the gate.
        }
    }

    // ---

    /// After an open lost its link: return once the loss has been noticed
    /// (or a new link is already up), bounded by `request_timeout`.
    pub(crate) async fn await_loss(&self, generation: u64) {
        // ---
        let mut rx = self.subscribe();
        loop {
            if self.state() != LinkState::Connected
                || self.current_generation() != Some(generation)
            {
                return;
            }
            match tokio::time::timeout(self.config.request_timeout, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return,
            }
        }
    }

    // ---

    /// Send one request on `link` and wait for its response.
    ///
    /// `Ng` becomes [`SeclayError::Rejected`]. Losing `link` before the
    /// response arrives becomes [`SeclayError::ConnectionLost`], as does a
    /// timeout on a link that has since been replaced.
    pub(crate) async fn round_trip(&self, link: &LinkHandle, kind: RequestKind) -> Result<()> {
        // ---
        let (req_id, rx) = self.tables.requests.register()?;
        let request = RequestElement { req_id, kind };
        let op = request.op_name();

        tracing::debug!(req_id, op, generation = link.generation, "request");
        if let Err(e) = link.outbound.push(request).await {
            self.tables.requests.retire(req_id);
            return Err(e);
        }

        let waited = tokio::select! {
            biased;
            waited = tokio::time::timeout(self.config.request_timeout, rx) => waited,
            _ = link.lost() => {
                self.tables.requests.retire(req_id);
                tracing::debug!(req_id, op, generation = link.generation, "link lost mid-request");
                return Err(SeclayError::ConnectionLost);
            }
        };

        let response = match waited {
            Err(_) => {
                self.tables.requests.retire(req_id);
                if self.current_generation() != Some(link.generation) {
                    return Err(SeclayError::ConnectionLost);
                }
                tracing::warn!(req_id, op, "request timed out");
                return Err(SeclayError::Timeout { op });
            }
            Ok(Err(_)) => return Err(SeclayError::ConnectionLost),
            Ok(Ok(response)) => response?,
        };

        match response {
            Response {
                code: ResultCode::Ok,
                ..
            } => Ok(()),
            Response {
                code: ResultCode::Ng,
                reason,
            } => {
                let reason = reason.unwrap_or_else(|| "no reason given".into());
                tracing::warn!(req_id, op, %reason, "request rejected");
                Err(SeclayError::Rejected { op, reason })
            }
        }
    }

    // ---

    /// Authenticate, connect, and install a fresh link.
    pub(crate) async fn connect_link(&self) -> Result<u64> {
        // ---
        let token = self
            .collab
            .authenticator
            .authenticate(&self.endpoint.credentials)
            .await?;
        let headers: Vec<(String, String)> = token.header().into_iter().collect();

        let socket = self
            .collab
            .connector
            .connect(&self.endpoint.url, &headers)
            .await?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let link = Link::start(
            socket,
            generation,
            Arc::clone(&self.collab.codec),
            Arc::clone(&self.tables),
            &self.config,
            self.events_tx.clone(),
        );

        *self.link_slot() = Some(link);

        // A close() that started meanwhile may have missed the new link.
        if self.state().is_shutting_down() {
            let link = {
                let mut slot = self.link_slot();
                match slot.as_ref() {
                    Some(current) if current.generation() == generation => slot.take(),
                    _ => None,
                }
            };
            if let Some(link) = link {
                link.shutdown(self.config.close_timeout).await;
            }
            return Err(SeclayError::ConnectionClosed);
        }

        // Never overwrite Closing/Closed set by a concurrent close().
        self.state_tx.send_if_modified(|current| {
            if current.is_shutting_down() {
                return false;
            }
            *current = LinkState::Connected;
            true
        });

        tracing::info!(generation, url = %self.endpoint.url, "connected");
        Ok(generation)
    }

    // ---

    /// Take the current link out and shut it down.
    pub(crate) async fn stop_link(&self) {
        // ---
        let link = self.link_slot().take();
        if let Some(link) = link {
            link.shutdown(self.config.close_timeout).await;
        }
    }

    // ---

    pub(crate) fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, key: u64, stream: LiveStream) {
        self.registry().insert(key, stream);
    }

    pub(crate) fn unregister(&self, key: u64) {
        self.registry().remove(&key);
    }

    pub(crate) fn snapshot(&self) -> Vec<LiveStream> {
        self.registry().values().cloned().collect()
    }

    pub(crate) fn live_streams(&self) -> usize {
        self.registry().len()
    }

    // ---

    /// Close every stream, then the link. Idempotent; concurrent callers
    /// wait for the first to finish.
    pub(crate) async fn close(&self) {
        // ---
        if !self.claim_close() {
            let mut rx = self.subscribe();
            let _ = rx.wait_for(|s| *s == LinkState::Closed).await;
            return;
        }
        self.finish_close().await;
    }

    /// Move to [`LinkState::Closing`]. `false` if another caller got there
    /// first.
    pub(crate) fn claim_close(&self) -> bool {
        // ---
        self.state_tx.send_if_modified(|current| {
            if current.is_shutting_down() {
                return false;
            }
            *current = LinkState::Closing;
            true
        })
    }

    /// The rest of [`Shared::close`]; only for the caller that claimed it.
    pub(crate) async fn finish_close(&self) {
        // ---
        tracing::info!("closing connection");

        // Wait for in-flight opens to land in the registry.
        let gate = self.open_gate.write().await;

        for stream in self.snapshot() {
            if let Err(e) = stream.close().await {
                tracing::debug!(stream_id = stream.stream_id(), "stream close failed: {e}");
            }
        }

        self.stop_link().await;

        let failed = self.tables.requests.fail_all(|| SeclayError::ConnectionClosed);
        if failed > 0 {
            tracing::debug!(failed, "pending requests failed by close");
        }
        self.tables.streams.clear();
        drop(gate);

        self.state_tx.send_replace(LinkState::Closed);
        tracing::info!("connection closed");
    }
}

// ---

impl Drop for Shared {
    fn drop(&mut self) {
        // Dropped without close(): release anything still waiting on a stream.
        let streams = std::mem::take(&mut *self.registry());
        for stream in streams.into_values() {
            stream.abandon();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A client connection carrying any number of Upstreams and Downstreams.
///
/// All streams share one socket: one flush task writes it, one read task
/// reads it. With `auto_reconnect` a lost socket is replaced transparently
/// and every open stream is re-opened with its original spec.
pub struct Connection {
    // ---
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

// ---

impl Connection {
    // ---
    /// Authenticate and connect. Fails if the first connect fails; retries
    /// only apply to later losses.
    pub async fn open(
        endpoint: Endpoint,
        collab: Collaborators,
        config: ConnConfig,
    ) -> Result<Self> {
        // ---
        let (shared, events_rx) = Shared::new(endpoint, collab, config);

        if let Err(e) = shared.connect_link().await {
            tracing::warn!("connect failed: {e}");
            shared.state_tx.send_replace(LinkState::Closed);
            return Err(e);
        }

        let supervisor = tokio::spawn(supervisor::run(Arc::clone(&shared), events_rx));

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    // ---

    /// Open a producer stream.
    ///
    /// Fails with [`SeclayError::Rejected`] if the peer answers `Ng` and with
    /// [`SeclayError::ConnectionClosed`] once [`Connection::close`] has been
    /// called.
    pub async fn open_upstream(&self, spec: UpstreamSpec) -> Result<Upstream> {
        Upstream::open(&self.shared, spec).await
    }

    // ---

    /// Open a consumer stream. `on_unit` runs on the stream's delivery task,
    /// once per received unit, in arrival order.
    pub async fn open_downstream<F>(&self, spec: DownstreamSpec, on_unit: F) -> Result<Downstream>
    where
        F: FnMut(Unit) + Send + 'static,
    {
        Downstream::open(&self.shared, spec, Box::new(on_unit)).await
    }

    // ---

    /// Close every stream, flush, and release the socket. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.shared.close().await;

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            let grace = self.shared.config.close_timeout;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        Ok(())
    }

    // ---

    pub fn link_state(&self) -> LinkState {
        self.shared.state()
    }

    /// Watch link transitions (e.g. to observe a reconnect).
    pub fn link_state_rx(&self) -> watch::Receiver<LinkState> {
        self.shared.subscribe()
    }

    /// Number of streams currently open (including suspended ones).
    pub fn live_streams(&self) -> usize {
        self.shared.live_streams()
    }

    /// Generation of the current socket; bumps on every reconnect.
    pub fn generation(&self) -> Option<u64> {
        self.shared.current_generation()
    }

    /// Request handshakes still awaiting a response.
    pub fn requests_in_flight(&self) -> usize {
        self.shared.tables.requests.in_flight()
    }
}

// ---

impl Drop for Connection {
    fn drop(&mut self) {
        // ---
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{connect, record, sim, SessionAuth, WAIT};
    use crate::StreamState;

    // ---

    #[tokio::test(start_paused = true)]
    async fn open_close_cycles_never_share_ids_and_wrap() {
        // ---
        let sim = sim();
        let conn = connect(&sim, ConnConfig::local()).await;

        let held = conn
            .open_upstream(UpstreamSpec::new("held"))
            .await
            .unwrap();
        let held_id = held.stream_id();

        let mut ids = Vec::new();
        for i in 0..300 {
            let up = conn
                .open_upstream(UpstreamSpec::new(format!("cycle-{i}")))
                .await
                .unwrap();
            assert_ne!(up.stream_id(), held_id, "cycle {i} reused a live ID");
            assert_ne!(up.stream_id(), 0, "ID 0 is reserved");
            ids.push(up.stream_id());
            up.close().await.unwrap();
        }

        assert_eq!(ids.iter().copied().max(), Some(255));
        assert!(
            ids.windows(2).any(|w| w[1] < w[0]),
            "allocator never wrapped: {ids:?}"
        );
        assert_eq!(conn.live_streams(), 1);
        assert_eq!(held.state(), StreamState::Active);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn second_close_is_a_no_op() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();
        up.close().await.unwrap();
        up.close().await.unwrap();

        assert_eq!(peer.closes().len(), 1);
        assert_eq!(up.state(), StreamState::Closed);
        assert_eq!(conn.live_streams(), 0);

        conn.close().await.unwrap();
        assert_eq!(peer.closes().len(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn open_after_close_fails_fast_without_io() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;
        let up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.link_state(), LinkState::Closed);

        let opens_before = peer.opens().len();
        let started = tokio::time::Instant::now();

        let err = conn
            .open_upstream(UpstreamSpec::new("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SeclayError::ConnectionClosed), "got {err:?}");
        let err = conn
            .open_downstream(DownstreamSpec::new("late"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SeclayError::ConnectionClosed), "got {err:?}");

        let err = up.write(record(1)).await.unwrap_err();
        assert!(matches!(err, SeclayError::ConnectionClosed), "got {err:?}");

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(peer.opens().len(), opens_before);
        assert_eq!(sim.connects(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn close_closes_every_stream_with_handshakes() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();
        let down = conn
            .open_downstream(DownstreamSpec::new("b"), |_| {})
            .await
            .unwrap();
        up.write(record(1)).await.unwrap();

        conn.close().await.unwrap();

        assert_eq!(up.state(), StreamState::Closed);
        assert_eq!(down.state(), StreamState::Closed);
        assert_eq!(peer.closes().len(), 2);
        assert_eq!(conn.live_streams(), 0);
        assert_eq!(conn.requests_in_flight(), 0);

        // Final EOS made it out before the socket closed.
        let trace = crate::test_support::trace_of(&peer.received(), up.stream_id());
        assert_eq!(trace, ["S0", "U", "F0"]);
        assert!(peer.wait_for(WAIT, |p| p.live_connections() == 0).await);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn rejected_open_is_typed_and_connection_survives() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        peer.reject_source("forbidden");
        let conn = connect(&sim, ConnConfig::local()).await;

        let err = conn
            .open_upstream(UpstreamSpec::new("forbidden"))
            .await
            .unwrap_err();
        match err {
            SeclayError::Rejected { op, reason } => {
                assert_eq!(op, "open upstream");
                assert_eq!(reason, "source not permitted");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }

        assert_eq!(conn.link_state(), LinkState::Connected);
        assert_eq!(conn.live_streams(), 0);
        conn.open_upstream(UpstreamSpec::new("fine")).await.unwrap();

        peer.allow_source("forbidden");
        conn.open_upstream(UpstreamSpec::new("forbidden")).await.unwrap();
        assert_eq!(conn.live_streams(), 2);
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_open() {
        // ---
        let sim = sim();
        sim.peer().set_mute(true);
        let config = ConnConfig::local();
        let limit = config.request_timeout;
        let conn = connect(&sim, config).await;

        let started = tokio::time::Instant::now();
        let err = conn
            .open_downstream(DownstreamSpec::new("a"), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, SeclayError::Timeout { op: "open downstream" }), "got {err:?}");
        assert!(started.elapsed() >= limit);
        assert_eq!(conn.requests_in_flight(), 0);
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn credentials_become_a_connect_header() {
        // ---
        let sim = sim();
        let conn = connect(&sim, ConnConfig::local()).await;

        assert_eq!(sim.last_url().as_deref(), Some("sim://peer"));
        assert_eq!(
            sim.last_headers(),
            vec![("Authorization".to_string(), "Bearer t0k3n".to_string())]
        );
        assert_eq!(conn.generation(), Some(1));
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens_get_distinct_ids() {
        // ---
        let sim = sim();
        let conn = Arc::new(connect(&sim, ConnConfig::local()).await);

        let mut tasks = Vec::new();
        for i in 0..40 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.open_upstream(UpstreamSpec::new(format!("s{i}")))
                    .await
                    .unwrap()
            }));
        }

        let mut streams = Vec::new();
        for task in tasks {
            streams.push(task.await.unwrap());
        }
        let ids: HashSet<_> = streams.iter().map(|s| s.stream_id()).collect();
        assert_eq!(ids.len(), 40);
        assert_eq!(conn.live_streams(), 40);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test]
    async fn first_connect_failure_is_returned() {
        // ---
        let sim = sim();
        sim.refuse_next(1);
        let endpoint = Endpoint::new("sim://peer", Credentials::Anonymous);
        let collab = Collaborators::new(Arc::new(sim.clone()));

        let err = Connection::open(endpoint, collab, ConnConfig::local())
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, SeclayError::Transport(_)), "got {err:?}");
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn failed_authentication_is_returned_without_connecting() {
        // ---
        let sim = sim();
        let auth = Arc::new(SessionAuth::failing_on(&[1]));
        let endpoint = Endpoint::new("sim://peer", Credentials::ApiToken("t0k3n".into()));
        let collab = Collaborators::new(Arc::new(sim.clone())).with_authenticator(auth.clone());

        let err = Connection::open(endpoint, collab, ConnConfig::local())
            .await
            .err()
            .expect("authentication should fail");
        assert!(matches!(err, SeclayError::Auth(_)), "got {err:?}");
        assert_eq!(auth.calls(), 1);
        // No connect was even attempted.
        assert!(sim.last_url().is_none());
    }
}
