//! Correlation tables: request ID → pending response, stream ID → inbound queue.
//!
//! Both tables are 256-entry arenas indexed directly by the 8-bit ID and
//! guarded by one `std::sync::Mutex` each. Locks are held only for the slot
//! operation itself, never across an `.await`.
//!
//! Allocation and registration happen under the same lock, so an ID is
//! issued only if its slot is empty at that instant. Lookups from the read
//! loop that miss (stale response, data for a retired stream) are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};

// ---

use seclay_domain::{RequestId, Result, ResultCode, SeclayError, StreamElement, StreamId};

// ---

use super::IdAllocator;

// ---------------------------------------------------------------------------
// SlotTable
// ---------------------------------------------------------------------------

struct Slots<T> {
    // ---
    ids: IdAllocator,
    entries: Vec<Option<T>>,
    reserve_zero: bool,
}

// ---

/// Fixed 256-slot arena keyed by an 8-bit ID.
pub(crate) struct SlotTable<T> {
    // ---
    /// Used in exhaustion errors: "request" or "stream".
    name: &'static str,
    inner: Mutex<Slots<T>>,
}

// ---

impl<T> SlotTable<T> {
    // ---
    pub(crate) fn new(name: &'static str, start: u8, reserve_zero: bool) -> Self {
        // ---
        Self {
            name,
            inner: Mutex::new(Slots {
                ids: IdAllocator::new(start),
                entries: (0..=u8::MAX).map(|_| None).collect(),
                reserve_zero,
            }),
        }
    }

    // ---

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    /// Issue a free ID and store `value` under it in one step.
    pub(crate) fn allocate(&self, value: T) -> Result<u8> {
        // ---
        let mut guard = self.slots();
        let Slots {
            ids,
            entries,
            reserve_zero,
        } = &mut *guard;

        let id = ids
            .next_free(|id| (*reserve_zero && id == 0) || entries[id as usize].is_some())
            .ok_or(SeclayError::IdsExhausted(self.name))?;

        entries[id as usize] = Some(value);
        Ok(id)
    }

    // ---

    /// Remove and return the entry under `id`.
    pub(crate) fn take(&self, id: u8) -> Option<T> {
        self.slots().entries[id as usize].take()
    }

    // ---

    /// Run `f` on the entry under `id` while the lock is held.
    pub(crate) fn with<R>(&self, id: u8, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots().entries[id as usize].as_ref().map(f)
    }

    // ---

    /// Remove every entry, returning them with their IDs.
    pub(crate) fn drain(&self) -> Vec<(u8, T)> {
        // ---
        let mut guard = self.slots();
        guard
            .entries
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.take().map(|v| (id as u8, v)))
            .collect()
    }

    // ---

    /// Number of occupied slots.
    pub(crate) fn len(&self) -> usize {
        self.slots().entries.iter().filter(|s| s.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// RequestTable
// ---------------------------------------------------------------------------

/// Decoded handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Response {
    pub code: ResultCode,
    pub reason: Option<String>,
}

// ---

type ResponseTx = oneshot::Sender<Result<Response>>;

/// Receiving end handed to the task that issued the request.
pub(crate) type ResponseRx = oneshot::Receiver<Result<Response>>;

// ---

/// In-flight requests awaiting their response.
pub(crate) struct RequestTable {
    // ---
    slots: SlotTable<ResponseTx>,
}

// ---

impl RequestTable {
    // ---
    pub(crate) fn new() -> Self {
        Self {
            slots: SlotTable::new("request", IdAllocator::REQUEST_START, false),
        }
    }

    // ---

    /// Allocate a request ID and the slot its response will land in.
    pub(crate) fn register(&self) -> Result<(RequestId, ResponseRx)> {
        // ---
        let (tx, rx) = oneshot::channel();
        let req_id = self.slots.allocate(tx)?;
        Ok((req_id, rx))
    }

    // ---

    /// Deliver `response` to whoever registered `req_id`, retiring the slot.
    ///
    /// Returns `false` for a stale or duplicate response; it is dropped.
    pub(crate) fn resolve(&self, req_id: RequestId, response: Response) -> bool {
        // ---
        match self.slots.take(req_id) {
            Some(tx) => {
                // Receiver may have timed out between take and send; harmless.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    // ---

    /// Forget `req_id` without delivering anything (timeout, cancellation).
    pub(crate) fn retire(&self, req_id: RequestId) {
        self.slots.take(req_id);
    }

    // ---

    /// Fail every pending request with the error produced by `err`.
    pub(crate) fn fail_all(&self, err: impl Fn() -> SeclayError) -> usize {
        // ---
        let pending = self.slots.drain();
        let n = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(err()));
        }
        n
    }

    // ---

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

// ---------------------------------------------------------------------------
// StreamTable
// ---------------------------------------------------------------------------

/// Where inbound stream elements for one ID go.
#[derive(Clone)]
pub(crate) enum StreamRoute {
    // ---
    /// Upstreams receive nothing; anything addressed to them is dropped.
    Upstream,

    Downstream(Arc<InboundQueue>),
}

// ---

/// Live stream IDs and their inbound routes.
pub(crate) struct StreamTable {
    // ---
    slots: SlotTable<StreamRoute>,
}

// ---

impl StreamTable {
    // ---
    pub(crate) fn new() -> Self {
        Self {
            slots: SlotTable::new("stream", IdAllocator::STREAM_START, true),
        }
    }

    // ---

    /// Allocate a stream ID and register `route` under it.
    pub(crate) fn register(&self, route: StreamRoute) -> Result<StreamId> {
        self.slots.allocate(route)
    }

    // ---

    /// Push `element` to the queue registered for its stream ID.
    ///
    /// Returns `false` when nothing is registered for that ID or the ID
    /// belongs to an Upstream.
    pub(crate) fn route(&self, element: StreamElement) -> bool {
        // ---
        let stream_id = element.stream_id();

        // Clone the queue handle out so the push happens without the table lock.
        let queue = self.slots.with(stream_id, |route| match route {
            StreamRoute::Upstream => None,
            StreamRoute::Downstream(q) => Some(Arc::clone(q)),
        });

        match queue.flatten() {
            Some(q) => {
                q.push(element);
                true
            }
            None => false,
        }
    }

    // ---

    pub(crate) fn retire(&self, stream_id: StreamId) {
        self.slots.take(stream_id);
    }

    // ---

    /// Drop every route. Used when a socket dies and IDs are reassigned.
    pub(crate) fn clear(&self) {
        self.slots.drain();
    }

    // ---

    pub(crate) fn live(&self) -> usize {
        self.slots.len()
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Both correlation tables, shared between the connection and its read loop.
pub(crate) struct Tables {
    // ---
    pub requests: RequestTable,
    pub streams: StreamTable,
}

// ---

impl Tables {
    pub(crate) fn new() -> Self {
        Self {
            requests: RequestTable::new(),
            streams: StreamTable::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// InboundQueue
// ---------------------------------------------------------------------------

struct QueueState {
    // ---
    items: VecDeque<StreamElement>,
    closed: bool,
}

// ---

/// Bounded single-consumer FIFO feeding one Downstream's delivery task.
///
/// The producer (read loop) never waits: when the queue is full the oldest
/// element is discarded and counted in [`InboundQueue::dropped`], so one slow
/// consumer cannot stall every other stream on the socket.
pub(crate) struct InboundQueue {
    // ---
    state: Mutex<QueueState>,
    capacity: usize,
    dropped: AtomicU64,

    /// Wakes the consumer after a push or close.
    ready: Notify,

    /// Wakes `wait_drained` callers when the queue empties.
    drained: Notify,
}

// ---

impl InboundQueue {
    // ---
    pub(crate) fn new(capacity: usize) -> Self {
        // ---
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    // ---

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    /// Append `element`, evicting the oldest entry when at capacity.
    /// Ignored after [`InboundQueue::close`].
    pub(crate) fn push(&self, element: StreamElement) {
        // ---
        {
            let mut st = self.state();
            if st.closed {
                return;
            }
            if st.items.len() >= self.capacity {
                st.items.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    stream_id = element.stream_id(),
                    total_dropped = total,
                    "inbound queue full; dropped oldest element"
                );
            }
            st.items.push_back(element);
        }
        self.ready.notify_one();
    }

    // ---

    /// Wait for the next element. Returns `None` once the queue is closed
    /// and empty.
    pub(crate) async fn pop(&self) -> Option<StreamElement> {
        // ---
        loop {
            {
                let mut st = self.state();
                if let Some(el) = st.items.pop_front() {
                    if st.items.is_empty() {
                        self.drained.notify_waiters();
                    }
                    return Some(el);
                }
                if st.closed {
                    self.drained.notify_waiters();
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the check and
            // this await is not lost.
            self.ready.notified().await;
        }
    }

    // ---

    /// Stop accepting pushes. Elements already queued are still delivered.
    pub(crate) fn close(&self) {
        // ---
        self.state().closed = true;
        self.ready.notify_one();
    }

    // ---

    /// Resolve once every queued element has been popped.
    pub(crate) async fn wait_drained(&self) {
        // ---
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state().items.is_empty() {
                return;
            }
            notified.await;
        }
    }

    // ---

    pub(crate) fn len(&self) -> usize {
        self.state().items.len()
    }

    // ---

    /// Elements discarded because the consumer fell behind.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
