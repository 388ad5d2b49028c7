//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime tunables of
//! the bridge engine and the session orchestrator.  Keeping configuration as
//! a plain struct (no global state, no environment reads inside the domain)
//! makes the bridge easy to embed in tests and in whatever host shell ends up
//! owning it.

use std::time::Duration;

/// All runtime configuration for one bridge instance.
///
/// Build this once per embedding and hand it to the engine; the defaults
/// match the production simulator's observed boot behavior.
///
/// # Example
///
/// ```rust
/// use simframe_core::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.max_handshake_retries, 3);
/// assert_eq!(cfg.queue_capacity, 100);
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long to wait for the frame's ready signal before one retry of the
    /// handshake watchdog elapses.
    ///
    /// The simulator boots its WebAssembly core on first load, which can take
    /// several seconds on slow machines; 10 s per attempt is generous enough
    /// to avoid false alarms while still surfacing a dead frame promptly.
    pub handshake_timeout: Duration,

    /// How many watchdog expiries are tolerated before the handshake is
    /// declared failed and pending `wait_for_ready` callers are rejected.
    pub max_handshake_retries: u32,

    /// Capacity of the pre-handshake pending queue.
    ///
    /// On overflow the oldest entry is evicted, so a frame that never becomes
    /// ready cannot grow host memory without bound.
    pub queue_capacity: usize,

    /// Capacity of the diagnostic message-history ring (most-recent-last).
    pub history_capacity: usize,

    /// How long the orchestrator waits for a code-injection confirmation
    /// before rejecting with a communication-class timeout.
    pub confirm_timeout: Duration,

    /// Whether inbound origins are checked at all.
    ///
    /// With enforcement off every origin is trusted and no security fault is
    /// ever emitted.  Only for tests and throwaway prototypes.
    pub enforce_origin: bool,

    /// Additionally trust loopback origins (locally served simulator builds).
    pub dev_mode: bool,
}

impl Default for BridgeConfig {
    /// Returns the production defaults.
    ///
    /// | Field                 | Default |
    /// |-----------------------|---------|
    /// | handshake_timeout     | 10 s    |
    /// | max_handshake_retries | 3       |
    /// | queue_capacity        | 100     |
    /// | history_capacity      | 100     |
    /// | confirm_timeout       | 5 s     |
    /// | enforce_origin        | true    |
    /// | dev_mode              | false   |
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_handshake_retries: 3,
            queue_capacity: 100,
            history_capacity: 100,
            confirm_timeout: Duration::from_secs(5),
            enforce_origin: true,
            dev_mode: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
