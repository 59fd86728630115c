use std::time::Duration;

// ---------------------------------------------------------------------------
// ConnConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`crate::Connection`].
///
/// `Default` matches the reference deployment; the presets below cover the
/// common variations.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    // ---
    /// Flush scheduler period. Everything queued within one period goes out
    /// as a single wire message.
    pub flush_interval: Duration,

    /// Upstream section rotation period.
    pub section_interval: Duration,

    /// Upper bound on any open/close round trip.
    pub request_timeout: Duration,

    /// Outbound buffer depth in elements. Writers wait when it is full.
    pub outbound_capacity: usize,

    /// Per-Downstream inbound queue depth in elements. When full the oldest
    /// element is discarded and counted.
    pub inbound_capacity: usize,

    /// Reconnect and replay stream opens after socket loss. When `false`
    /// socket loss tears the connection down.
    pub auto_reconnect: bool,

    /// First retry delay while reconnecting; doubles per failure.
    pub reconnect_backoff_min: Duration,

    /// Retry delay cap.
    pub reconnect_backoff_max: Duration,

    /// How long a suspension waits for Downstream queues to empty before the
    /// dead socket is released.
    pub drain_timeout: Duration,

    /// How long `close()` waits for the read loop to see the socket close.
    pub close_timeout: Duration,
}

// ---

impl Default for ConnConfig {
    fn default() -> Self {
        // ---
        Self {
            flush_interval: Duration::from_millis(10),
            section_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            outbound_capacity: 4096,
            inbound_capacity: 1024,
            auto_reconnect: true,
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(2),
        }
    }
}

// ---

impl ConnConfig {
    // ---
    /// Short timers for in-process links: fast retries, short timeouts.
    pub fn local() -> Self {
        // ---
        Self {
            request_timeout: Duration::from_secs(2),
            reconnect_backoff_min: Duration::from_millis(20),
            reconnect_backoff_max: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    // ---

    pub fn with_section_interval(mut self, interval: Duration) -> Self {
        self.section_interval = interval;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}
