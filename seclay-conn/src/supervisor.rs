//! Reconnection supervisor.
//!
//! One task per connection. It waits for [`LinkEvent::Lost`] from the
//! current link's tasks and then either tears the connection down
//! (`auto_reconnect = false`) or runs a suspend / reconnect / re-open cycle:
//!
//! ```text
//! Connected ──lost──► suspend() ──► reconnect(state) ──► Connected
//!                        │              │ backoff 1s, 2s, 4s ... cap
//!                        │              └─ close() observed ──► exit
//!                        └─ ConnectionState { streams }
//! ```
//!
//! Loss reports from superseded generations are ignored, as are reports
//! that arrive once `close()` has started.

use std::sync::Arc;

use tokio::sync::mpsc;

// ---

use seclay_domain::{LinkState, SeclayError};

// ---

use super::{LinkEvent, LiveStream, Shared, StreamState};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The streams carried from a dead link to its replacement.
pub(crate) struct ConnectionState {
    // ---
    pub streams: Vec<LiveStream>,
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub(crate) async fn run(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    // ---
    let mut state_rx = shared.subscribe();

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = state_rx.wait_for(|s| *s == LinkState::Closed) => break,
        };

        let LinkEvent::Lost { generation, reason } = event;

        if shared.state().is_shutting_down() {
            tracing::debug!(generation, %reason, "link ended during close");
            continue;
        }
        if shared.current_generation() != Some(generation) {
            tracing::debug!(generation, %reason, "stale loss report ignored");
            continue;
        }

        tracing::warn!(generation, %reason, "link lost");

        if !shared.config.auto_reconnect {
            // Closing first, so opens fail fast while the dead link stops.
            // Then the streams close locally.
            if shared.claim_close() {
                shared.stop_link().await;
                shared.tables.requests.fail_all(|| SeclayError::ConnectionLost);
                shared.finish_close().await;
            }
            break;
        }

        let state = suspend(&shared).await;
        match reconnect(&shared, state).await {
            Some(state) => {
                let suspended = state
                    .streams
                    .iter()
                    .filter(|s| s.state() == StreamState::Suspended)
                    .count();
                tracing::info!(
                    streams = state.streams.len(),
                    suspended,
                    "reconnect cycle complete"
                );
            }
            None => break,
        }
    }

    tracing::debug!("supervisor exiting");
}

// ---------------------------------------------------------------------------
// suspend
// ---------------------------------------------------------------------------

/// Stop the dead link and park every registered stream.
///
/// Order matters: the link is stopped first so pushes onto it fail, then
/// pending round trips are failed so in-flight opens release the open gate,
/// then the registry is snapshotted under the gate.
pub(crate) async fn suspend(shared: &Shared) -> ConnectionState {
    // ---
    shared.set_state(LinkState::Reconnecting);
    shared.stop_link().await;

    let failed = shared
        .tables
        .requests
        .fail_all(|| SeclayError::ConnectionLost);

    let streams = {
        let _gate = shared.open_gate.write().await;
        let streams = shared.snapshot();
        for stream in &streams {
            stream.suspend().await;
        }
        shared.tables.streams.clear();
        streams
    };

    tracing::warn!(
        streams = streams.len(),
        failed_requests = failed,
        "streams suspended"
    );

    // Let callbacks catch up with what the dead socket delivered.
    let drain = async {
        for queue in streams.iter().filter_map(LiveStream::inbound) {
            queue.wait_drained().await;
        }
    };
    if tokio::time::timeout(shared.config.drain_timeout, drain)
        .await
        .is_err()
    {
        tracing::warn!("inbound queues not drained in time");
    }

    ConnectionState { streams }
}

// ---------------------------------------------------------------------------
// reconnect
// ---------------------------------------------------------------------------

/// Re-establish the link with exponential back-off, then re-open every
/// suspended stream with its original spec.
///
/// Returns `None` if `close()` started while retrying. A stream whose
/// re-open is rejected is abandoned; a link failure mid-way leaves the
/// remaining streams suspended for the next cycle.
pub(crate) async fn reconnect(shared: &Shared, state: ConnectionState) -> Option<ConnectionState> {
    // ---
    let mut backoff = shared.config.reconnect_backoff_min;
    let mut state_rx = shared.subscribe();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(attempt, "attempting reconnect");

        let result = tokio::select! {
            result = shared.connect_link() => result,
            _ = state_rx.wait_for(|s| s.is_shutting_down()) => return None,
        };

        match result {
            Ok(generation) => {
                tracing::info!(attempt, generation, "reconnected");
                break;
            }
            Err(SeclayError::ConnectionClosed) => return None,
            Err(e) => {
                tracing::warn!(attempt, "reconnect failed: {e}; retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = state_rx.wait_for(|s| s.is_shutting_down()) => return None,
                }
                backoff = (backoff * 2).min(shared.config.reconnect_backoff_max);
            }
        }
    }

    let Some(link) = shared.live_link() else {
        return Some(state);
    };

    let mut kept = Vec::with_capacity(state.streams.len());
    let mut remaining = state.streams.into_iter();

    for stream in remaining.by_ref() {
        match stream.reopen(shared, &link).await {
            Ok(()) => kept.push(stream),
            Err(e) if e.is_link_failure() => {
                tracing::warn!(stream_id = stream.stream_id(), "link lost during re-open: {e}");
                kept.push(stream);
                break;
            }
            Err(e) => {
                tracing::warn!(
                    spec = ?stream.spec(),
                    "re-open failed; abandoning stream: {e}"
                );
                stream.abandon();
                shared.unregister(stream.key());
            }
        }
    }
    kept.extend(remaining);

    Some(ConnectionState { streams: kept })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use seclay_domain::{DownstreamSpec, StreamSpec, UpstreamSpec};

    use std::sync::Arc;

    use seclay_domain::Credentials;

    use crate::test_support::{
        collector, connect, eventually, record, sim, trace_of, SessionAuth, WAIT,
    };
    use crate::{Collaborators, ConnConfig, Connection, Endpoint, StreamState};

    use super::*;

    // ---

    async fn await_generation(conn: &Connection, generation: u64) {
        // ---
        let mut rx = conn.link_state_rx();
        let reached = tokio::time::timeout(WAIT, async {
            loop {
                if conn.generation() == Some(generation) && conn.link_state() == LinkState::Connected
                {
                    return;
                }
                let _ = rx.changed().await;
            }
        })
        .await;
        assert!(reached.is_ok(), "generation {generation} never came up");
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn lost_link_reopens_downstreams_and_resumes_delivery() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let (seen_a, on_a) = collector();
        let (seen_b, on_b) = collector();
        let spec_a = DownstreamSpec::new("alpha");
        let spec_b = DownstreamSpec {
            destination_id: "ops".into(),
            ..DownstreamSpec::new("bravo")
        };
        let a = conn.open_downstream(spec_a.clone(), on_a).await.unwrap();
        let b = conn.open_downstream(spec_b.clone(), on_b).await.unwrap();

        peer.publish("alpha", &record(1));
        peer.publish("bravo", &record(2));
        assert!(eventually(|| seen_a.lock().unwrap().len() == 1).await);
        assert!(eventually(|| seen_b.lock().unwrap().len() == 1).await);

        sim.sever();
        await_generation(&conn, 2).await;
        assert!(peer.wait_for(WAIT, |p| p.open_downstreams() == 2).await);

        // Re-opened on the second connection with identical specs.
        let reopened: Vec<StreamSpec> = peer
            .opens()
            .into_iter()
            .filter(|o| o.conn == 2)
            .map(|o| o.spec)
            .collect();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains(&StreamSpec::Downstream(spec_a)));
        assert!(reopened.contains(&StreamSpec::Downstream(spec_b)));

        assert_eq!(a.state(), StreamState::Active);
        assert_eq!(b.state(), StreamState::Active);
        assert_eq!(conn.live_streams(), 2);

        assert_eq!(peer.publish("alpha", &record(3)), 1);
        assert_eq!(peer.publish("bravo", &record(4)), 1);
        assert!(eventually(|| seen_a.lock().unwrap().len() == 2).await);
        assert!(eventually(|| seen_b.lock().unwrap().len() == 2).await);
        assert_eq!(*seen_a.lock().unwrap(), [1, 3]);
        assert_eq!(*seen_b.lock().unwrap(), [2, 4]);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn upstream_continues_with_next_serial() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();
        assert_eq!(up.write(record(1)).await.unwrap(), 0);
        assert!(peer.wait_for(WAIT, |p| p.received().len() == 2).await);

        sim.sever();
        await_generation(&conn, 2).await;
        let mut state = up.state_rx();
        state
            .wait_for(|s| *s == StreamState::Active)
            .await
            .unwrap();

        assert_eq!(up.write(record(2)).await.unwrap(), 1);
        up.close().await.unwrap();

        let trace = trace_of(&peer.received(), up.stream_id());
        assert_eq!(trace[trace.len() - 3..], ["S1", "U", "F1"]);
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_while_refused() {
        // ---
        let sim = sim();
        let config = ConnConfig::local();
        let min = config.reconnect_backoff_min;
        let conn = connect(&sim, config).await;
        let _up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();

        sim.refuse_next(3);
        let started = tokio::time::Instant::now();
        sim.sever();
        await_generation(&conn, 2).await;

        // Three failures: min + 2*min + 4*min of back-off.
        assert!(started.elapsed() >= min * 7, "elapsed {:?}", started.elapsed());
        assert_eq!(sim.connects(), 2);
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn rejected_reopen_abandons_only_that_stream() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let keep = conn
            .open_downstream(DownstreamSpec::new("keep"), |_| {})
            .await
            .unwrap();
        let lose = conn
            .open_downstream(DownstreamSpec::new("lose"), |_| {})
            .await
            .unwrap();

        peer.reject_source("lose");
        sim.sever();
        await_generation(&conn, 2).await;

        assert!(eventually(|| lose.state() == StreamState::Closed).await);
        assert!(eventually(|| keep.state() == StreamState::Active).await);
        assert_eq!(conn.live_streams(), 1);
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn writes_fail_while_suspended_and_close_ends_retries() {
        // ---
        let sim = sim();
        let conn = connect(&sim, ConnConfig::local()).await;
        let up = conn.open_upstream(UpstreamSpec::new("a")).await.unwrap();

        sim.refuse_next(u32::MAX);
        sim.sever();

        let mut state = up.state_rx();
        state
            .wait_for(|s| *s == StreamState::Suspended)
            .await
            .unwrap();
        assert_eq!(conn.link_state(), LinkState::Reconnecting);

        let err = up.write(record(1)).await.unwrap_err();
        assert!(matches!(err, SeclayError::StreamSuspended), "got {err:?}");

        tokio::time::sleep(Duration::from_millis(500)).await;
        conn.close().await.unwrap();

        assert_eq!(conn.link_state(), LinkState::Closed);
        assert_eq!(up.state(), StreamState::Closed);
        assert_eq!(sim.connects(), 1);
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn reconnect_reauthenticates_and_retries_refused_auth() {
        // ---
        let sim = sim();
        let auth = Arc::new(SessionAuth::failing_on(&[2, 3]));
        let endpoint = Endpoint::new("sim://peer", Credentials::ApiToken("t0k3n".into()));
        let collab = Collaborators::new(Arc::new(sim.clone())).with_authenticator(auth.clone());
        let config = ConnConfig::local();
        let conn = Connection::open(endpoint, collab, config.clone()).await.unwrap();
        assert_eq!(auth.calls(), 1);

        let started = tokio::time::Instant::now();
        sim.sever();
        await_generation(&conn, 2).await;

        // Two refusals, then a fresh token on the new socket.
        assert_eq!(auth.calls(), 4);
        assert_eq!(sim.connects(), 2);
        assert_eq!(
            sim.last_headers(),
            vec![("Authorization".to_string(), "Bearer session-4".to_string())]
        );
        assert!(started.elapsed() >= config.reconnect_backoff_min * 3);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn loss_during_reopen_keeps_streams_for_the_next_link() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let conn = connect(&sim, ConnConfig::local()).await;

        let (seen_a, on_a) = collector();
        let (seen_b, on_b) = collector();
        let a = conn
            .open_downstream(DownstreamSpec::new("alpha"), on_a)
            .await
            .unwrap();
        let b = conn
            .open_downstream(DownstreamSpec::new("bravo"), on_b)
            .await
            .unwrap();

        // The second link swallows the first re-open, then dies as well.
        peer.set_mute(true);
        sim.sever();
        await_generation(&conn, 2).await;
        assert!(peer.wait_for(WAIT, |p| p.opens().iter().any(|o| o.conn == 2)).await);

        let started = tokio::time::Instant::now();
        peer.set_mute(false);
        sim.sever();

        await_generation(&conn, 3).await;
        assert!(peer.wait_for(WAIT, |p| p.open_downstreams() == 2).await);
        assert!(eventually(|| a.state() == StreamState::Active).await);
        assert!(eventually(|| b.state() == StreamState::Active).await);
        // Noticed through the dead link, not by waiting out the request.
        assert!(started.elapsed() < ConnConfig::local().request_timeout);
        assert_eq!(conn.live_streams(), 2);

        assert_eq!(peer.publish("alpha", &record(1)), 1);
        assert_eq!(peer.publish("bravo", &record(2)), 1);
        assert!(eventually(|| seen_a.lock().unwrap().len() == 1).await);
        assert!(eventually(|| seen_b.lock().unwrap().len() == 1).await);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn open_racing_a_fatal_loss_fails_fast() {
        // ---
        let sim = sim();
        let conn = connect(&sim, ConnConfig::local().with_auto_reconnect(false)).await;

        sim.sever();
        let started = tokio::time::Instant::now();
        let err = conn
            .open_upstream(UpstreamSpec::new("late"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SeclayError::ConnectionClosed | SeclayError::ConnectionLost),
            "got {err:?}"
        );
        assert!(started.elapsed() < ConnConfig::local().request_timeout);

        let mut rx = conn.link_state_rx();
        rx.wait_for(|s| *s == LinkState::Closed).await.unwrap();
        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn without_auto_reconnect_loss_closes_everything() {
        // ---
        let sim = sim();
        let peer = sim.peer();
        let config = ConnConfig::local().with_auto_reconnect(false);
        let conn = connect(&sim, config).await;

        let (_seen, on_unit) = collector();
        let down = conn
            .open_downstream(DownstreamSpec::new("a"), on_unit)
            .await
            .unwrap();
        let closes_before = peer.closes().len();

        sim.sever();
        let mut rx = conn.link_state_rx();
        rx.wait_for(|s| *s == LinkState::Closed).await.unwrap();

        assert_eq!(down.state(), StreamState::Closed);
        // Known-dead socket: no close handshake attempted.
        assert_eq!(peer.closes().len(), closes_before);

        let err = conn
            .open_upstream(UpstreamSpec::new("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, SeclayError::ConnectionClosed), "got {err:?}");
        assert_eq!(sim.connects(), 1);

        conn.close().await.unwrap();
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn open_during_reconnect_waits_for_the_new_link() {
        // ---
        let sim = sim();
        let conn = connect(&sim, ConnConfig::local()).await;
        let _held = conn.open_upstream(UpstreamSpec::new("held")).await.unwrap();

        sim.refuse_next(2);
        sim.sever();

        let mut rx = conn.link_state_rx();
        rx.wait_for(|s| *s == LinkState::Reconnecting).await.unwrap();

        let up = conn.open_upstream(UpstreamSpec::new("late")).await.unwrap();
        assert_eq!(conn.generation(), Some(2));
        assert_eq!(up.state(), StreamState::Active);
        conn.close().await.unwrap();
    }
}
