// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process link simulator.
///
/// All fields default to a perfect link: no drops, every connect accepted.
#[derive(Debug, Clone, Default)]
pub struct LinkSimConfig {
    // ---
    /// Probability `[0.0, 1.0]` that a peer-to-client message is silently
    /// dropped. Handshake responses are never dropped.
    pub drop_percent: f64,

    /// Number of initial `connect` calls refused with a transport error.
    pub refuse_connects: u32,

    /// RNG seed for reproducible drop sequences. `None` = random.
    pub seed: Option<u64>,
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link, no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Loses `drop_percent` of published data, reproducibly.
    pub fn lossy(drop_percent: f64, seed: u64) -> Self {
        // ---
        Self {
            drop_percent: drop_percent.clamp(0.0, 1.0),
            seed: Some(seed),
            ..Default::default()
        }
    }

    // ---

    /// Refuses the first `n` connects.
    pub fn refusing(n: u32) -> Self {
        Self {
            refuse_connects: n,
            ..Default::default()
        }
    }
}
