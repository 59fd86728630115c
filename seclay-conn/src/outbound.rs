//! Outbound buffer and the flush scheduler that drains it.
//!
//! Every producer (stream writes, section markers, handshake requests)
//! appends to one bounded FIFO through an [`Outbound`] handle. A single
//! [`FlushScheduler`] task owns the socket's write half and, once per
//! `flush_interval`, encodes everything queued into one wire message.
//!
//! ```text
//! Upstream::write ──┐
//! rotation task ────┼──► Outbound (mpsc, bounded) ──► FlushScheduler ──► SocketSink
//! round_trip ───────┘                                   tokio::interval
//! ```
//!
//! Append order is flush order. Producers wait when the buffer is full.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

// ---

use seclay_domain::{CodecPtr, Element, Result, SeclayError, SocketSinkPtr};

// ---

use super::LossReporter;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Cheap-clone producer handle onto one link's outbound buffer.
#[derive(Clone)]
pub(crate) struct Outbound {
    // ---
    tx: mpsc::Sender<Element>,
}

// ---

impl Outbound {
    // ---
    /// Create the buffer; the receiver goes to [`FlushScheduler::new`].
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Element>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    // ---

    /// Queue `element` for the next flush tick.
    ///
    /// Waits while the buffer is full. Fails with
    /// [`SeclayError::ConnectionLost`] once the flush task has exited.
    pub(crate) async fn push(&self, element: impl Into<Element>) -> Result<()> {
        // ---
        self.tx
            .send(element.into())
            .await
            .map_err(|_| SeclayError::ConnectionLost)
    }
}

// ---------------------------------------------------------------------------
// FlushScheduler
// ---------------------------------------------------------------------------

/// Sole writer of one socket.
pub(crate) struct FlushScheduler {
    // ---
    rx: mpsc::Receiver<Element>,
    sink: SocketSinkPtr,
    codec: CodecPtr,
    period: Duration,

    /// Upper bound on elements per wire message; the buffer's capacity
    /// for a live link, so every tick clears what was queued.
    max_batch: usize,

    generation: u64,
    loss: LossReporter,
}

// ---

impl FlushScheduler {
    // ---
    pub(crate) fn new(
        rx: mpsc::Receiver<Element>,
        sink: SocketSinkPtr,
        codec: CodecPtr,
        period: Duration,
        max_batch: usize,
        loss: LossReporter,
    ) -> Self {
        // ---
        Self {
            rx,
            sink,
            codec,
            period,
            max_batch: max_batch.max(1),
            generation: loss.generation(),
            loss,
        }
    }

    // ---

    /// Tick until `shutdown` flips or the socket fails.
    ///
    /// On shutdown everything still queued is flushed before the sink is
    /// closed. On a write failure the loss is reported and the
    /// task exits without closing the sink.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // ---
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        tracing::warn!(generation = self.generation, "flush failed: {e}");
                        self.loss.report(format!("write failed: {e}"));
                        return;
                    }
                }
                // Err means the link dropped without an explicit shutdown.
                _ = shutdown.changed() => break,
            }
        }

        // Final forced flush: nothing appended before shutdown is left behind.
        loop {
            match self.flush_once().await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(generation = self.generation, "final flush failed: {e}");
                    break;
                }
            }
        }

        if let Err(e) = self.sink.close().await {
            tracing::debug!(generation = self.generation, "socket close failed: {e}");
        }
        tracing::debug!(generation = self.generation, "flush scheduler exiting");
    }

    // ---

    /// Encode and write whatever is queued as one message.
    ///
    /// Returns the number of elements written; 0 means the buffer was empty.
    async fn flush_once(&mut self) -> Result<usize> {
        // ---
        let mut batch = Vec::new();
        while batch.len() < self.max_batch {
            match self.rx.try_recv() {
                Ok(el) => batch.push(el),
                Err(_) => break,
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let message = match self.codec.encode(&batch) {
            Ok(m) => m,
            Err(e) => {
                // Local encoding fault; the socket is fine, so drop the batch
                // rather than the link.
                tracing::error!(
                    generation = self.generation,
                    elements = batch.len(),
                    "dropping unencodable batch: {e}"
                );
                return Ok(batch.len());
            }
        };

        self.sink.send(message).await?;

        tracing::trace!(generation = self.generation, elements = batch.len(), "flushed");
        Ok(batch.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use seclay_domain::{ElementCodec, SocketSink, SosMarker};

    use super::*;
    use crate::{JsonCodec, LinkEvent};

    // ---

    /// Records every message; fails every send once `fail` is set.
    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
        fail: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl SocketSink for RecordingSink {
        async fn send(&mut self, message: Vec<u8>) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(SeclayError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    // ---

    fn sos(serial: u32) -> Element {
        SosMarker {
            stream_id: 1,
            serial,
        }
        .into()
    }

    // ---

    fn decode_all(sent: &[Vec<u8>]) -> Vec<Vec<Element>> {
        sent.iter().map(|m| JsonCodec.decode(m).unwrap()).collect()
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn one_message_per_tick_in_fifo_order() {
        // ---
        let sink = RecordingSink::default();
        let (outbound, rx) = Outbound::channel(64);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flush = FlushScheduler::new(
            rx,
            Box::new(sink.clone()),
            Arc::new(JsonCodec),
            Duration::from_millis(10),
            64,
            LossReporter::new(1, events).0,
        );
        let task = tokio::spawn(flush.run(shutdown_rx));

        for serial in 0..3 {
            outbound.push(sos(serial)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;

        let batches = decode_all(&sink.sent.lock().unwrap());
        assert_eq!(batches, vec![vec![sos(0), sos(1), sos(2)]]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(*sink.closed.lock().unwrap());
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn full_buffer_goes_out_in_one_tick() {
        // ---
        let sink = RecordingSink::default();
        let (outbound, rx) = Outbound::channel(8);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for serial in 0..8 {
            outbound.push(sos(serial)).await.unwrap();
        }

        // Batch limit equal to the capacity, as a live link uses it.
        let flush = FlushScheduler::new(
            rx,
            Box::new(sink.clone()),
            Arc::new(JsonCodec),
            Duration::from_millis(10),
            8,
            LossReporter::new(1, events).0,
        );
        let task = tokio::spawn(flush.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let batches = decode_all(&sink.sent.lock().unwrap());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], (0..8).map(sos).collect::<Vec<_>>());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_final_flush() {
        // ---
        let sink = RecordingSink::default();
        let (outbound, rx) = Outbound::channel(64);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Long period: only the shutdown path can deliver this element.
        let flush = FlushScheduler::new(
            rx,
            Box::new(sink.clone()),
            Arc::new(JsonCodec),
            Duration::from_secs(3600),
            64,
            LossReporter::new(1, events).0,
        );
        let task = tokio::spawn(flush.run(shutdown_rx));

        // Let the immediate first tick pass with an empty buffer.
        tokio::task::yield_now().await;
        outbound.push(sos(7)).await.unwrap();
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let batches = decode_all(&sink.sent.lock().unwrap());
        assert_eq!(batches.concat(), vec![sos(7)]);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn write_failure_reports_loss_and_exits() {
        // ---
        let sink = RecordingSink::default();
        *sink.fail.lock().unwrap() = true;

        let (outbound, rx) = Outbound::channel(64);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let flush = FlushScheduler::new(
            rx,
            Box::new(sink.clone()),
            Arc::new(JsonCodec),
            Duration::from_millis(10),
            64,
            LossReporter::new(42, events).0,
        );
        let task = tokio::spawn(flush.run(shutdown_rx));

        outbound.push(sos(0)).await.unwrap();

        match events_rx.recv().await {
            Some(LinkEvent::Lost { generation, .. }) => assert_eq!(generation, 42),
            None => panic!("no loss reported"),
        }
        task.await.unwrap();

        // Receiver is gone: producers now fail fast.
        assert!(matches!(
            outbound.push(sos(1)).await,
            Err(SeclayError::ConnectionLost)
        ));
    }
}
