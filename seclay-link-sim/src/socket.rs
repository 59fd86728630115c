use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

// ---

use seclay_domain::{Result, SeclayError, Socket, SocketSink, SocketSource};

// ---------------------------------------------------------------------------
// SimSink / SimSource
// ---------------------------------------------------------------------------

/// Client write half. Each `send` is one whole wire message.
pub(crate) struct SimSink {
    // ---
    /// `None` after `close`; the peer then sees EOF.
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    severed: watch::Receiver<bool>,
}

// ---

#[async_trait]
impl SocketSink for SimSink {
    // ---
    async fn send(&mut self, message: Vec<u8>) -> Result<()> {
        // ---
        if *self.severed.borrow() {
            return Err(SeclayError::Transport("link severed".into()));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SeclayError::Transport("socket closed".into()))?;
        tx.send(message)
            .map_err(|_| SeclayError::Transport("peer gone".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

// ---

/// Client read half.
pub(crate) struct SimSource {
    // ---
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    severed: watch::Receiver<bool>,
}

// ---

#[async_trait]
impl SocketSource for SimSource {
    // ---
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        // ---
        tokio::select! {
            biased;
            Ok(_) = self.severed.wait_for(|s| *s) => {
                Err(SeclayError::Transport("link severed".into()))
            }
            message = self.rx.recv() => Ok(message),
        }
    }
}

// ---------------------------------------------------------------------------
// SimLink
// ---------------------------------------------------------------------------

/// The peer's end of one simulated connection.
pub(crate) struct SimLink {
    // ---
    pub id: u64,
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub severed: watch::Receiver<bool>,
}

// ---

impl SimLink {
    // ---
    /// Build a connected (client socket, peer end) pair plus the switch
    /// that severs both.
    pub(crate) fn pair(id: u64) -> (Socket, SimLink, watch::Sender<bool>) {
        // ---
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let (sever_tx, severed) = watch::channel(false);

        let socket = Socket {
            sink: Box::new(SimSink {
                tx: Some(to_peer),
                severed: severed.clone(),
            }),
            source: Box::new(SimSource {
                rx: from_peer,
                severed: severed.clone(),
            }),
        };

        let link = SimLink {
            id,
            tx: to_client,
            rx: from_client,
            severed,
        };

        (socket, link, sever_tx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
