//! CLI configuration for `seclay-agent`.
//!
//! Run modes:
//!   seclay-agent --url wss://host/api/v1/ws --api-token T upstream --source-id S --dest D
//!   seclay-agent --url wss://host/api/v1/ws --edge-token T downstream --source-id S --channel 2

use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

// ---

use seclay_conn::ConnConfig;
use seclay_domain::{Credentials, DownstreamFilter, DownstreamSpec, UpstreamSpec};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// No `Debug`: the tokens must not end up in logs.
#[derive(Parser)]
#[command(name = "seclay-agent", about = "seclay streaming client")]
pub struct Config {
    // ---
    #[command(subcommand)]
    pub mode: Mode,

    /// WebSocket endpoint of the streaming service.
    #[arg(long, env = "SECLAY_URL")]
    pub url: String,

    /// API token, sent as `Authorization: Bearer`.
    #[arg(long, env = "SECLAY_API_TOKEN", hide_env_values = true, conflicts_with = "edge_token")]
    pub api_token: Option<String>,

    /// Edge token, sent as `X-Edge-Token`.
    #[arg(long, env = "SECLAY_EDGE_TOKEN", hide_env_values = true)]
    pub edge_token: Option<String>,

    /// Close instead of reconnecting when the socket is lost.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Flush period in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub flush_ms: u64,

    /// Upstream section period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub section_ms: u64,
}

// ---

impl Config {
    // ---
    pub fn credentials(&self) -> Credentials {
        // ---
        match (&self.api_token, &self.edge_token) {
            (Some(t), _) => Credentials::ApiToken(t.clone()),
            (None, Some(t)) => Credentials::EdgeToken(t.clone()),
            (None, None) => Credentials::Anonymous,
        }
    }

    // ---

    pub fn conn_config(&self) -> ConnConfig {
        // ---
        ConnConfig::default()
            .with_flush_interval(Duration::from_millis(self.flush_ms.max(1)))
            .with_section_interval(Duration::from_millis(self.section_ms.max(1)))
            .with_auto_reconnect(!self.no_reconnect)
    }
}

// ---

#[derive(Debug, Subcommand)]
pub enum Mode {
    // ---
    /// Publish each stdin line as one record; close cleanly on EOF.
    Upstream {
        // ---
        #[arg(long)]
        source_id: String,

        /// Destination node; repeat for several.
        #[arg(long = "dest")]
        destinations: Vec<String>,

        /// Channel stamped on every record.
        #[arg(long, default_value_t = 0)]
        channel: u8,

        /// Ask the backend to store the stream.
        #[arg(long)]
        store: bool,

        /// Ask the backend to resend on its own reconnects.
        #[arg(long)]
        resend: bool,

        #[arg(long)]
        measurement_id: Option<Uuid>,
    },

    /// Print each received unit until Ctrl-C.
    Downstream {
        // ---
        #[arg(long)]
        source_id: String,

        #[arg(long = "dest")]
        destination: Option<String>,

        /// Only these channels; repeat for several. Default: all.
        #[arg(long = "channel")]
        channels: Vec<u8>,
    },
}

// ---

impl Mode {
    // ---
    pub fn upstream_spec(&self) -> Option<(UpstreamSpec, u8)> {
        // ---
        match self {
            Mode::Upstream {
                source_id,
                destinations,
                channel,
                store,
                resend,
                measurement_id,
            } => {
                let spec = UpstreamSpec {
                    destination_ids: destinations.clone(),
                    store: *store,
                    resend: *resend,
                    measurement_id: *measurement_id,
                    ..UpstreamSpec::new(source_id.clone())
                };
                Some((spec, *channel))
            }
            Mode::Downstream { .. } => None,
        }
    }

    // ---

    pub fn downstream_spec(&self) -> Option<DownstreamSpec> {
        // ---
        match self {
            Mode::Downstream {
                source_id,
                destination,
                channels,
            } => Some(DownstreamSpec {
                destination_id: destination.clone().unwrap_or_default(),
                filters: channels
                    .iter()
                    .map(|c| DownstreamFilter {
                        channel: Some(*c),
                        data_type: None,
                    })
                    .collect(),
                ..DownstreamSpec::new(source_id.clone())
            }),
            Mode::Upstream { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn upstream_flags_build_the_spec() {
        // ---
        let cfg = Config::try_parse_from([
            "seclay-agent",
            "--url",
            "wss://example.test/ws",
            "--api-token",
            "abc",
            "--section-ms",
            "250",
            "upstream",
            "--source-id",
            "sensor-7",
            "--dest",
            "archive",
            "--dest",
            "ops",
            "--channel",
            "3",
            "--store",
        ])
        .unwrap();

        assert!(matches!(cfg.credentials(), Credentials::ApiToken(ref t) if t == "abc"));
        let conn = cfg.conn_config();
        assert_eq!(conn.section_interval, Duration::from_millis(250));
        assert!(conn.auto_reconnect);

        let (spec, channel) = cfg.mode.upstream_spec().unwrap();
        assert_eq!(spec.source_id, "sensor-7");
        assert_eq!(spec.destination_ids, ["archive", "ops"]);
        assert!(spec.store);
        assert!(!spec.resend);
        assert_eq!(channel, 3);
        assert!(cfg.mode.downstream_spec().is_none());
    }

    // ---

    #[test]
    fn downstream_channels_become_filters() {
        // ---
        let cfg = Config::try_parse_from([
            "seclay-agent",
            "--url",
            "ws://localhost:9000",
            "--edge-token",
            "e",
            "--no-reconnect",
            "downstream",
            "--source-id",
            "sensor-7",
            "--channel",
            "1",
            "--channel",
            "4",
        ])
        .unwrap();

        assert!(matches!(cfg.credentials(), Credentials::EdgeToken(_)));
        assert!(!cfg.conn_config().auto_reconnect);

        let spec = cfg.mode.downstream_spec().unwrap();
        assert!(spec.accepts_channel(4));
        assert!(!spec.accepts_channel(2));
        assert_eq!(spec.destination_id, "");
    }

    // ---

    #[test]
    fn both_tokens_conflict() {
        // ---
        let parsed = Config::try_parse_from([
            "seclay-agent",
            "--url",
            "ws://x",
            "--api-token",
            "a",
            "--edge-token",
            "b",
            "downstream",
            "--source-id",
            "s",
        ]);
        assert!(parsed.is_err());
    }
}
