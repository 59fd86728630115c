//! seclay agent.
//!
//! Bridges stdin/stdout to a seclay streaming service over WebSocket.
//!
//! Usage:
//!   seclay-agent --url wss://host/api/v1/ws --api-token T upstream --source-id S --dest D
//!   seclay-agent --url wss://host/api/v1/ws --api-token T downstream --source-id S

use std::sync::Arc;

// ---

use anyhow::Context;
use clap::Parser;
use tracing::info;

// ---

use seclay_conn::{Collaborators, Connection, Endpoint};
use seclay_ws::WsConnector;

// ---

mod config;
mod pump;

// ---

use config::Config;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stderr());

    // stdout carries data in downstream mode; logs go to stderr.
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %cfg.url,
        "seclay-agent starting",
    );

    let endpoint = Endpoint::new(cfg.url.clone(), cfg.credentials());
    let collab = Collaborators::new(Arc::new(WsConnector::new()));
    let conn = Connection::open(endpoint, collab, cfg.conn_config())
        .await
        .with_context(|| format!("connect to {}", cfg.url))?;

    let result = if let Some((spec, channel)) = cfg.mode.upstream_spec() {
        pump::upstream(&conn, spec, channel).await
    } else if let Some(spec) = cfg.mode.downstream_spec() {
        pump::downstream(&conn, spec).await
    } else {
        Ok(())
    };

    conn.close().await?;
    info!("shutting down");
    result
}
