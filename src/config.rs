//! Engine Configuration
//!
//! Tunable knobs for the delivery protocol and transport. True wire constants
//! (frame markers, handshake kinds) live next to the framing code; everything
//! here is a policy value a deployment may want to change.

/// Runtime configuration for a node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base retry interval for unacknowledged work and pending calls (ms).
    /// The ack/nack resend path uses this as a constant interval, never
    /// exponentially backed off.
    pub retry_base_ms: u64,
    /// Cadence of the retry scanner pass across all nodes (ms).
    pub scanner_interval_ms: u64,
    /// Grace period before work from (or calls to) a "client" peer are
    /// abandoned. Clients may legitimately disconnect for long periods, so
    /// this is much longer than a member timeout.
    pub client_grace_ms: u64,
    /// Number of reusable bulk TCP sockets kept per destination.
    pub socket_pool_size: usize,
    /// Capacity of the batched small-message send buffer (bytes). A single
    /// small message may never exceed this.
    pub send_buffer_bytes: usize,
    /// Encoded messages at or below this size ride the batched small-message
    /// path; larger ones must use the bulk path.
    pub small_message_limit: usize,
    /// Cap for the exponential reconnect backoff on the raw-socket path (ms).
    pub reconnect_cap_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_base_ms: 200,
            scanner_interval_ms: 1_000,
            client_grace_ms: 60_000,
            socket_pool_size: 2,
            send_buffer_bytes: 64 * 1024,
            small_message_limit: 2 * 1024,
            reconnect_cap_ms: 5_000,
        }
    }
}
