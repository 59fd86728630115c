//! [`Upstream`]: a producer stream with periodic section rotation.
//!
//! Every unit written belongs to a section opened by an SOS marker and
//! closed by an EOS marker with the same serial. A rotation task closes the
//! current section and opens the next one every `section_interval`, but only
//! if something was written; idle streams do not churn sections.
//!
//! All marker and unit pushes for one stream happen under its `Section`
//! lock, so on the wire a stream always reads
//! `SOS(n) U* EOS(n) SOS(n+1) U* ... EOS(m, final)`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ---

use seclay_domain::{
    //
    EosMarker,
    Record,
    RequestKind,
    Result,
    SeclayError,
    SosMarker,
    StreamId,
    Unit,
    UpstreamSpec,
};

// ---

use super::{LinkHandle, LiveStream, Shared, StreamRoute, StreamState};

// ---------------------------------------------------------------------------
// Section
// ---------------------------------------------------------------------------

/// Section bookkeeping; the lock that orders a stream's wire output.
struct Section {
    // ---
    /// Link the stream is open on. `None` unless `Active`.
    link: Option<LinkHandle>,

    /// Serial of the currently open section.
    serial: u32,

    /// Units written since the section opened.
    pending: u32,
}

// ---------------------------------------------------------------------------
// UpstreamInner
// ---------------------------------------------------------------------------

pub(crate) struct UpstreamInner {
    // ---
    shared: Weak<Shared>,
    key: u64,
    spec: UpstreamSpec,
    stream_id: AtomicU8,
    section: Mutex<Section>,
    state_tx: watch::Sender<StreamState>,
}

// ---

impl UpstreamInner {
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

    pub(crate) fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    fn set_state(&self, state: StreamState) {
        self.state_tx.send_replace(state);
    }

    // ---

    /// Open the first section on `link`.
    ///
    /// If the link is already gone the stream starts out `Suspended` and is
    /// picked up by the next re-open pass.
    async fn start(&self, link: &LinkHandle) {
        // ---
        let mut section = self.section.lock().await;
        let marker = SosMarker {
            stream_id: self.stream_id(),
            serial: section.serial,
        };

        match link.outbound.push(marker).await {
            Ok(()) => {
                section.link = Some(link.clone());
                self.set_state(StreamState::Active);
            }
            Err(_) => {
                section.link = None;
                self.set_state(StreamState::Suspended);
            }
        }
    }

    // ---

    async fn write(&self, record: Record) -> Result<u32> {
        // ---
        let shared = self.shared.upgrade().ok_or(SeclayError::ConnectionClosed)?;
        shared.ensure_open()?;

        let mut section = self.section.lock().await;
        let link = match (self.state(), section.link.as_ref()) {
            (StreamState::Active, Some(link)) => link.clone(),
            (StreamState::Closing | StreamState::Closed, _) => {
                return Err(SeclayError::StreamClosed)
            }
            _ => return Err(SeclayError::StreamSuspended),
        };

        link.outbound.push(Unit::new(self.stream_id(), record)).await?;
        section.pending = section.pending.saturating_add(1);
        Ok(section.serial)
    }

    // ---

    /// One rotation tick. Returns `false` once the stream is closing.
    async fn rotate(&self) -> bool {
        // ---
        let mut section = self.section.lock().await;
        match self.state() {
            StreamState::Active => {}
            StreamState::Closing | StreamState::Closed => return false,
            StreamState::Opening | StreamState::Suspended => return true,
        }

        if section.pending == 0 {
            return true;
        }
        let Some(link) = section.link.clone() else {
            return true;
        };

        let stream_id = self.stream_id();
        let closing = section.serial;
        let eos = EosMarker {
            stream_id,
            serial: closing,
            final_section: false,
        };
        if link.outbound.push(eos).await.is_err() {
            // Link gone; the re-open starts a fresh section.
            return true;
        }

        section.serial = closing.wrapping_add(1);
        section.pending = 0;
        let sos = SosMarker {
            stream_id,
            serial: section.serial,
        };
        let _ = link.outbound.push(sos).await;

        tracing::trace!(stream_id, serial = section.serial, "section rotated");
        true
    }

    // ---

    fn spawn_rotation(self: &Arc<Self>, period: Duration) {
        // ---
        let weak = Arc::downgrade(self);
        let first = Instant::now() + period;
        tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.rotate().await {
                    break;
                }
            }
        });
    }

    // ---

    /// Final EOS, close handshake, retire. Idempotent.
    ///
    /// The handshake is only attempted on the link the stream was opened
    /// on; once that socket is known dead the stream closes locally.
    pub(crate) async fn close(&self) -> Result<()> {
        // ---
        let mut section = self.section.lock().await;
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
                let live = section
                    .link
                    .as_ref()
                    .and_then(|link| shared.link_for(link.generation));

                match live {
                    Some(link) => {
                        let eos = EosMarker {
                            stream_id,
                            serial: section.serial,
                            final_section: true,
                        };
                        result = match link.outbound.push(eos).await {
                            Ok(()) => {
                                shared
                                    .round_trip(&link, RequestKind::Close { stream_id })
                                    .await
                            }
                            Err(e) => Err(e),
                        };
                    }
                    None => {
                        tracing::debug!(stream_id, "socket gone; closing without handshake");
                    }
                }
                shared.tables.streams.retire(stream_id);
            }
        }

        section.link = None;
        self.set_state(StreamState::Closed);
        drop(section);

        if let Some(shared) = shared {
            shared.unregister(self.key);
        }

        match &result {
            Ok(()) => tracing::info!(stream_id, "upstream closed"),
            Err(e) => tracing::warn!(stream_id, "upstream close handshake failed: {e}"),
        }
        result
    }

    // ---

    pub(crate) async fn suspend(&self) {
        // ---
        let mut section = self.section.lock().await;
        if self.state() == StreamState::Active {
            section.link = None;
            self.set_state(StreamState::Suspended);
            tracing::debug!(stream_id = self.stream_id(), "upstream suspended");
        }
    }

    // ---

    /// Re-issue the open on a new link and start a fresh section.
    pub(crate) async fn reopen(&self, shared: &Shared, link: &LinkHandle) -> Result<()> {
        // ---
        let mut section = self.section.lock().await;
        if self.state() != StreamState::Suspended {
            return Ok(());
        }

        let old_id = self.stream_id();
        let stream_id = shared.tables.streams.register(StreamRoute::Upstream)?;
        let request = RequestKind::OpenUpstream {
            stream_id,
            spec: self.spec.clone(),
        };
        if let Err(e) = shared.round_trip(link, request).await {
            shared.tables.streams.retire(stream_id);
            return Err(e);
        }

        self.stream_id.store(stream_id, Ordering::Release);
        section.serial = section.serial.wrapping_add(1);
        section.pending = 0;

        let sos = SosMarker {
            stream_id,
            serial: section.serial,
        };
        link.outbound.push(sos).await?;

        section.link = Some(link.clone());
        self.set_state(StreamState::Active);

        tracing::info!(old_id, stream_id, serial = section.serial, "upstream re-opened");
        Ok(())
    }

    // ---

    pub(crate) fn abandon(&self) {
        // ---
        if !self.state().is_closed() {
            self.set_state(StreamState::Closed);
            tracing::warn!(stream_id = self.stream_id(), "upstream abandoned");
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// Producer handle returned by [`crate::Connection::open_upstream`].
///
/// Cloning is cheap; all clones refer to the same stream.
#[derive(Clone)]
pub struct Upstream {
    // ---
    inner: Arc<UpstreamInner>,
}

// ---

impl Upstream {
    // ---
    pub(crate) async fn open(shared: &Arc<Shared>, spec: UpstreamSpec) -> Result<Self> {
        // ---
        loop {
            match Self::try_open(shared, &spec).await {
                Err(SeclayError::ConnectionLost) if shared.config.auto_reconnect => {
                    tracing::debug!(source_id = %spec.source_id, "link lost during open; retrying");
                }
                other => return other,
            }
        }
    }

    // ---

    async fn try_open(shared: &Arc<Shared>, spec: &UpstreamSpec) -> Result<Self> {
        // ---
        let (link, gate) = shared.begin_open().await?;

        let stream_id = shared.tables.streams.register(StreamRoute::Upstream)?;
        let request = RequestKind::OpenUpstream {
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
        let inner = Arc::new(UpstreamInner {
            shared: Arc::downgrade(shared),
            key,
            spec: spec.clone(),
            stream_id: AtomicU8::new(stream_id),
            section: Mutex::new(Section {
                link: None,
                serial: 0,
                pending: 0,
            }),
            state_tx: watch::channel(StreamState::Opening).0,
        });

        inner.start(&link).await;
        shared.register(key, LiveStream::Upstream(Arc::clone(&inner)));
        drop(gate);

        inner.spawn_rotation(shared.config.section_interval);

        tracing::info!(
            stream_id,
            source_id = %spec.source_id,
            generation = link.generation,
            "upstream open"
        );
        Ok(Self { inner })
    }

    // ---

    /// Append one record to the current section.
    ///
    /// Returns the serial of the section the record went into. Fails with
    /// [`SeclayError::StreamSuspended`] while reconnecting and
    /// [`SeclayError::StreamClosed`] after close.
    pub async fn write(&self, record: Record) -> Result<u32> {
        self.inner.write(record).await
    }

    /// Close the stream. Calling it again is a no-op.
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

    pub fn spec(&self) -> &UpstreamSpec {
        self.inner.spec()
    }

    /// Serial of the section currently open.
    pub async fn serial(&self) -> u32 {
        self.inner.section.lock().await.serial
    }
}

// ---

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("stream_id", &self.stream_id())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
