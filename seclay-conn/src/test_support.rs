//! Fixtures shared by the engine tests: a simulated peer and helpers to
//! read back what it received.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---

use async_trait::async_trait;
use seclay_domain::{
    AuthToken, Authenticator, Credentials, Record, Result, SeclayError, StreamElement, StreamId,
    Unit,
};
use seclay_link_sim::{LinkSimConfig, LinkSimTransport};

// ---

use super::{Collaborators, ConnConfig, Connection, Endpoint, JsonCodec};

/// Generous upper bound for waits on the paused clock.
pub(crate) const WAIT: Duration = Duration::from_secs(30);

// ---

pub(crate) fn sim() -> LinkSimTransport {
    LinkSimTransport::new(LinkSimConfig::perfect(), Arc::new(JsonCodec))
}

// ---

pub(crate) async fn connect(sim: &LinkSimTransport, config: ConnConfig) -> Connection {
    // ---
    let endpoint = Endpoint::new("sim://peer", Credentials::ApiToken("t0k3n".into()));
    let collab = Collaborators::new(Arc::new(sim.clone()));
    Connection::open(endpoint, collab, config)
        .await
        .expect("connect to sim peer")
}

// ---

pub(crate) fn record(n: u8) -> Record {
    Record {
        channel: 0,
        elapsed: Duration::from_millis(u64::from(n)),
        data: vec![n],
    }
}

// ---

/// Compact rendering of the elements received for one stream:
/// `S0`, `U`, `E0`, `F1` (final EOS).
pub(crate) fn trace_of(received: &[StreamElement], stream_id: StreamId) -> Vec<String> {
    // ---
    received
        .iter()
        .filter(|el| el.stream_id() == stream_id)
        .map(|el| match el {
            StreamElement::Unit(_) => "U".to_string(),
            StreamElement::Sos(m) => format!("S{}", m.serial),
            StreamElement::Eos(m) if m.final_section => format!("F{}", m.serial),
            StreamElement::Eos(m) => format!("E{}", m.serial),
        })
        .collect()
}

// ---

/// Callback that appends every unit's first data byte to a shared vec.
pub(crate) fn collector() -> (Arc<Mutex<Vec<u8>>>, impl FnMut(Unit) + Send + 'static) {
    // ---
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = move |unit: Unit| {
        if let Some(b) = unit.data.first() {
            sink.lock().unwrap().push(*b);
        }
    };
    (seen, callback)
}

// ---

/// Poll `pred` on the (possibly paused) clock until it holds.
pub(crate) async fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    // ---
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pred()
}

// ---

/// Issues `Bearer session-<n>` for the n-th call; the calls listed in
/// `fail_on` are refused instead.
#[derive(Default)]
pub(crate) struct SessionAuth {
    calls: AtomicU32,
    fail_on: Vec<u32>,
}

impl SessionAuth {
    // ---
    pub(crate) fn failing_on(calls: &[u32]) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_on: calls.to_vec(),
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for SessionAuth {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<AuthToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&n) {
            return Err(SeclayError::Auth("token expired".into()));
        }
        Ok(AuthToken::Bearer(format!("session-{n}")))
    }
}
