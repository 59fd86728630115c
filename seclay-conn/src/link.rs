//! One physical socket and the two tasks that own it.
//!
//! A [`Link`] is started per successful connect and stamped with a
//! generation number. Loss reports carry that generation so the supervisor
//! can discard reports from links it has already replaced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---

use seclay_domain::{CodecPtr, Socket};

// ---

use super::{ConnConfig, FlushScheduler, Outbound, ReadLoop, Tables};

// ---------------------------------------------------------------------------
// LinkEvent
// ---------------------------------------------------------------------------

/// Reported by link tasks to the supervisor.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    // ---
    /// The socket of `generation` failed or reached EOF.
    Lost { generation: u64, reason: String },
}

// ---------------------------------------------------------------------------
// LossReporter
// ---------------------------------------------------------------------------

/// Held by a link's tasks. Reporting marks the link down for every
/// [`LinkHandle`] before the supervisor hears about it.
#[derive(Clone)]
pub(crate) struct LossReporter {
    // ---
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    down: Arc<watch::Sender<bool>>,
}

// ---

impl LossReporter {
    // ---
    /// The receiver side goes into [`LinkHandle`]s.
    pub(crate) fn new(
        generation: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> (Self, watch::Receiver<bool>) {
        // ---
        let (down, down_rx) = watch::channel(false);
        let reporter = Self {
            generation,
            events,
            down: Arc::new(down),
        };
        (reporter, down_rx)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark the link down without telling the supervisor.
    pub(crate) fn mark_down(&self) {
        self.down.send_replace(true);
    }

    pub(crate) fn report(&self, reason: String) {
        // ---
        self.mark_down();
        let _ = self.events.send(LinkEvent::Lost {
            generation: self.generation,
            reason,
        });
    }
}

// ---------------------------------------------------------------------------
// LinkHandle
// ---------------------------------------------------------------------------

/// What streams hold to talk over a link.
#[derive(Clone)]
pub(crate) struct LinkHandle {
    // ---
    pub generation: u64,
    pub outbound: Outbound,
    down: watch::Receiver<bool>,
}

// ---

impl LinkHandle {
    // ---
    /// Resolves once this link is known dead or has been shut down.
    pub(crate) async fn lost(&self) {
        // ---
        let mut down = self.down.clone();
        // Err: every task of the link is gone, which is a loss too.
        let _ = down.wait_for(|d| *d).await;
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

pub(crate) struct Link {
    // ---
    handle: LinkHandle,
    loss: LossReporter,
    shutdown_tx: watch::Sender<bool>,
    flush: JoinHandle<()>,
    reader: JoinHandle<()>,
}

// ---

impl Link {
    // ---
    /// Spawn the flush scheduler and read loop for `socket`.
    pub(crate) fn start(
        socket: Socket,
        generation: u64,
        codec: CodecPtr,
        tables: Arc<Tables>,
        config: &ConnConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        // ---
        let Socket { sink, source } = socket;
        let (outbound, rx) = Outbound::channel(config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (loss, down) = LossReporter::new(generation, events);

        // One tick can always take the whole buffer.
        let flush = FlushScheduler::new(
            rx,
            sink,
            Arc::clone(&codec),
            config.flush_interval,
            config.outbound_capacity,
            loss.clone(),
        );
        let flush = tokio::spawn(flush.run(shutdown_rx));

        let reader = ReadLoop::new(source, codec, tables, loss.clone());
        let reader = tokio::spawn(reader.run());

        tracing::debug!(generation, "link started");

        Self {
            handle: LinkHandle {
                generation,
                outbound,
                down,
            },
            loss,
            shutdown_tx,
            flush,
            reader,
        }
    }

    // ---

    pub(crate) fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.handle.generation
    }

    // ---

    /// Flush what is queued, close the socket, and wait for both tasks.
    ///
    /// Each task is given `close_timeout`; after that it is aborted.
    /// Outstanding [`LinkHandle`] clones do not keep the flush task alive
    /// past shutdown.
    pub(crate) async fn shutdown(mut self, close_timeout: Duration) {
        // ---
        let generation = self.generation();
        self.loss.mark_down();
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(close_timeout, &mut self.flush)
            .await
            .is_err()
        {
            tracing::warn!(generation, "flush scheduler did not stop in time");
            self.flush.abort();
        }

        if tokio::time::timeout(close_timeout, &mut self.reader)
            .await
            .is_err()
        {
            tracing::debug!(generation, "read loop still running; aborting");
            self.reader.abort();
        }

        tracing::debug!(generation, "link stopped");
    }
}

// ---

impl Drop for Link {
    fn drop(&mut self) {
        self.loss.mark_down();
        let _ = self.shutdown_tx.send(true);
    }
}
