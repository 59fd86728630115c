//! [`Downstream`]: a consumer stream delivering units to a callback.
//!
//! The read loop pushes into the stream's [`InboundQueue`] and never
//! waits; a per-stream delivery task pops and invokes the callback. The
//! queue outlives reconnects: a re-opened Downstream keeps its queue and
//! its delivery task, only the stream ID changes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

// ---

use seclay_domain::{
    //
    DownstreamSpec,
    RequestKind,
    Result,
    SeclayError,
    StreamElement,
    StreamId,
    Unit,
};

// ---

use super::{InboundQueue, LinkHandle, LiveStream, Shared, StreamRoute, StreamState};

/// Callback invoked once per received unit.
pub(crate) type UnitCallback = Box<dyn FnMut(Unit) + Send + 'static>;

// ---------------------------------------------------------------------------
// DownstreamInner
// ---------------------------------------------------------------------------

pub(crate) struct DownstreamInner {
    // ---
    shared: Weak<Shared>,
    key: u64,
    spec: DownstreamSpec,
    stream_id: AtomicU8,
    queue: Arc<InboundQueue>,

    /// Link the stream is open on. `None` unless `Active`.
    binding: Mutex<Option<LinkHandle>>,

    state_tx: watch::Sender<StreamState>,
    delivery: StdMutex<Option<JoinHandle<()>>>,

    /// Serial of the most recent section marker seen.
    last_serial: StdMutex<Option<u32>>,
}

// ---

impl DownstreamInner {
    // ---
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub(crate) fn spec(&self) -> &DownstreamSpec {
        &self.spec
    }

    pub(crate) fn queue(&self) -> Arc<InboundQueue> {
        Arc::clone(&self.queue)
    }

    fn set_state(&self, state: StreamState) {
        self.state_tx.send_replace(state);
    }

    fn note_serial(&self, serial: u32) {
        *self.last_serial.lock().unwrap_or_else(PoisonError::into_inner) = Some(serial);
    }

    // ---

    /// Pop until the queue is closed and empty.
    async fn deliver(self: Arc<Self>, mut on_unit: UnitCallback) {
        // ---
        while let Some(element) = self.queue.pop().await {
            match element {
                StreamElement::Unit(unit) => on_unit(unit),
                StreamElement::Sos(m) => {
                    tracing::trace!(stream_id = m.stream_id, serial = m.serial, "section start");
                    self.note_serial(m.serial);
                }
                StreamElement::Eos(m) => {
                    tracing::trace!(
                        stream_id = m.stream_id,
                        serial = m.serial,
                        final_section = m.final_section,
                        "section end"
                    );
                    self.note_serial(m.serial);
                }
            }
        }
        tracing::debug!(stream_id = self.stream_id(), "delivery task exiting");
    }

    // ---

    /// Close handshake, retire, then let the delivery task drain. Idempotent.
    pub(crate) async fn close(&self) -> Result<()> {
        // ---
        let mut binding = self.binding.lock().await;
        let was = self.state();
        if was.is_closed() {
            return Ok(());
        }
        self.set_state(StreamState::Closing);

        let stream_id = self.stream_id();
        let shared = self.shared.upgrade();
        let mut result = Ok(());

        if was == StreamState::Active {
            if let Some(shared) = shared.as_ref() {
                let live = binding
                    .as_ref()
                    .and_then(|link| shared.link_for(link.generation));

                match live {
                    Some(link) => {
                        result = shared
                            .round_trip(&link, RequestKind::Close { stream_id })
                            .await;
                    }
                    None => {
                        tracing::debug!(stream_id, "socket gone; closing without handshake");
                    }
                }
                shared.tables.streams.retire(stream_id);
            }
        }

        *binding = None;
        drop(binding);

        // Whatever was already queued is still delivered.
        self.queue.close();
        let delivery = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut delivery) = delivery {
            let grace = shared
                .as_ref()
                .map(|s| s.config.close_timeout)
                .unwrap_or_default();
            if tokio::time::timeout(grace, &mut delivery).await.is_err() {
                tracing::warn!(stream_id, "delivery did not drain in time; aborting");
                delivery.abort();
            }
        }

        self.set_state(StreamState::Closed);
        if let Some(shared) = shared {
            shared.unregister(self.key);
        }

        match &result {
            Ok(()) => tracing::info!(stream_id, "downstream closed"),
            Err(e) => tracing::warn!(stream_id, "downstream close handshake failed: {e}"),
        }
        result
    }

    // ---

    pub(crate) async fn suspend(&self) {
        // ---
        let mut binding = self.binding.lock().await;
        if self.state() == StreamState::Active {
            *binding = None;
            self.set_state(StreamState::Suspended);
            tracing::debug!(stream_id = self.stream_id(), "downstream suspended");
        }
    }

    // ---

    /// Re-issue the open with the original spec, keeping the queue.
    pub(crate) async fn reopen(&self, shared: &Shared, link: &LinkHandle) -> Result<()> {
        // ---
        let mut binding = self.binding.lock().await;
        if self.state() != StreamState::Suspended {
            return Ok(());
        }

        let old_id = self.stream_id();
        let route = StreamRoute::Downstream(self.queue());
        let stream_id = shared.tables.streams.register(route)?;
        let request = RequestKind::OpenDownstream {
            stream_id,
            spec: self.spec.clone(),
        };
        if let Err(e) = shared.round_trip(link, request).await {
            shared.tables.streams.retire(stream_id);
            return Err(e);
        }

        self.stream_id.store(stream_id, Ordering::Release);
        *binding = Some(link.clone());
        self.set_state(StreamState::Active);

        tracing::info!(old_id, stream_id, "downstream re-opened");
        Ok(())
    }

    // ---

    pub(crate) fn abandon(&self) {
        // ---
        if !self.state().is_closed() {
            self.set_state(StreamState::Closed);
            tracing::warn!(stream_id = self.stream_id(), "downstream abandoned");
        }
        self.queue.close();
    }
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

/// Consumer handle returned by [`crate::Connection::open_downstream`].
#[derive(Clone)]
pub struct Downstream {
    // ---
    inner: Arc<DownstreamInner>,
}

// ---

impl Downstream {
    // ---
    pub(crate) async fn open(
        shared: &Arc<Shared>,
        spec: DownstreamSpec,
        on_unit: UnitCallback,
    ) -> Result<Self> {
        // ---
        loop {
            match Self::try_open(shared, &spec).await {
                Ok(inner) => {
                    let delivery = tokio::spawn(Arc::clone(&inner).deliver(on_unit));
                    *inner
                        .delivery
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(delivery);
                    return Ok(Self { inner });
                }
                Err(SeclayError::ConnectionLost) if shared.config.auto_reconnect => {
                    tracing::debug!(source_id = %spec.source_id, "link lost during open; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---

    async fn try_open(shared: &Arc<Shared>, spec: &DownstreamSpec) -> Result<Arc<DownstreamInner>> {
        // ---
        let (link, gate) = shared.begin_open().await?;

        // Routed before the request goes out: data may follow the response
        // in the same wire message.
        let queue = Arc::new(InboundQueue::new(shared.config.inbound_capacity));
        let route = StreamRoute::Downstream(Arc::clone(&queue));
        let stream_id = shared.tables.streams.register(route)?;
        let request = RequestKind::OpenDownstream {
            stream_id,
            spec: spec.clone(),
        };

        if let Err(e) = shared.round_trip(&link, request).await {
            shared.tables.streams.retire(stream_id);
            drop(gate);
            if matches!(e, SeclayError::ConnectionLost) {
                shared.await_loss(link.generation).await;
            }
            return Err(e);
        }

        let key = shared.next_key();
        let inner = Arc::new(DownstreamInner {
            shared: Arc::downgrade(shared),
            key,
            spec: spec.clone(),
            stream_id: AtomicU8::new(stream_id),
            queue,
            binding: Mutex::new(Some(link.clone())),
            state_tx: watch::channel(StreamState::Active).0,
            delivery: StdMutex::new(None),
            last_serial: StdMutex::new(None),
        });

        shared.register(key, LiveStream::Downstream(Arc::clone(&inner)));
        drop(gate);

        tracing::info!(
            stream_id,
            source_id = %spec.source_id,
            generation = link.generation,
            "downstream open"
        );
        Ok(inner)
    }

    // ---

    /// Close the stream. Units already received are still delivered before
    /// this returns. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    // ---

    /// Current stream ID; may change across a reconnect.
    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn state_rx(&self) -> watch::Receiver<StreamState> {
        self.inner.state_tx.subscribe()
    }

    pub fn spec(&self) -> &DownstreamSpec {
        self.inner.spec()
    }

    /// Elements discarded because the callback fell behind.
    pub fn dropped(&self) -> u64 {
        self.inner.queue.dropped()
    }

    /// Elements received but not yet delivered.
    pub fn backlog(&self) -> usize {
        self.inner.queue.len()
    }

    /// Serial of the most recent section marker received, if any.
    pub fn last_serial(&self) -> Option<u32> {
        *self
            .inner
            .last_serial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ---

impl std::fmt::Debug for Downstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downstream")
            .field("stream_id", &self.stream_id())
            .field("state", &self.state())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
