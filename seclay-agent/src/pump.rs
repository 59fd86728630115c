//! The two run modes: stdin to an Upstream, a Downstream to stdout.

use std::io::Write;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{info, warn};

// ---

use seclay_conn::{Connection, StreamState, Upstream};
use seclay_domain::{DownstreamSpec, Record, SeclayError, Unit, UpstreamSpec};

// ---------------------------------------------------------------------------
// upstream
// ---------------------------------------------------------------------------

/// Publish stdin line by line until EOF or Ctrl-C, then close the stream.
pub async fn upstream(conn: &Connection, spec: UpstreamSpec, channel: u8) -> anyhow::Result<()> {
    // ---
    let up = conn
        .open_upstream(spec)
        .await
        .context("open upstream")?;
    info!(stream_id = up.stream_id(), "upstream open; reading stdin");

    let started = Instant::now();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut written = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let record = Record {
            channel,
            elapsed: started.elapsed(),
            data: line.into_bytes(),
        };
        write_through_reconnect(&up, record).await?;
        written += 1;
    }

    up.close().await.context("close upstream")?;
    info!(written, "upstream closed");
    Ok(())
}

// ---

/// Write `record`; while the connection is reconnecting, wait for the stream
/// to come back and write it once more.
async fn write_through_reconnect(up: &Upstream, record: Record) -> anyhow::Result<()> {
    // ---
    match up.write(record.clone()).await {
        Ok(_) => Ok(()),
        Err(SeclayError::StreamSuspended) => {
            warn!("stream suspended; waiting for reconnect");
            let mut state = up.state_rx();
            let resumed = *state
                .wait_for(|s| *s == StreamState::Active || s.is_closed())
                .await
                .context("stream state")?;
            if resumed != StreamState::Active {
                bail!("stream closed while reconnecting");
            }
            up.write(record).await.context("write after reconnect")?;
            Ok(())
        }
        Err(e) => Err(e).context("write"),
    }
}

// ---------------------------------------------------------------------------
// downstream
// ---------------------------------------------------------------------------

/// Print every unit as `channel<TAB>elapsed_ms<TAB>data` until Ctrl-C.
pub async fn downstream(conn: &Connection, spec: DownstreamSpec) -> anyhow::Result<()> {
    // ---
    let down = conn
        .open_downstream(spec, print_unit)
        .await
        .context("open downstream")?;
    info!(stream_id = down.stream_id(), "downstream open");

    let mut state = down.state_rx();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = state.wait_for(|s| *s == StreamState::Closed) => warn!("stream closed by connection"),
    }

    down.close().await.context("close downstream")?;
    info!(dropped = down.dropped(), "downstream closed");
    Ok(())
}

// ---

fn print_unit(unit: Unit) {
    // ---
    let mut out = std::io::stdout().lock();
    let _ = writeln!(
        out,
        "{}\t{}\t{}",
        unit.channel,
        unit.elapsed.as_millis(),
        String::from_utf8_lossy(&unit.data)
    );
}
