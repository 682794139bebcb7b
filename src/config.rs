use std::time::Duration;

/// Tunables shared by client and server peers. All defaults are chosen for
///  interactive workloads on consumer links; applications with tighter latency
///  budgets (or much slower links) should adjust them together - e.g. a longer
///  `timeout` usually warrants a longer `heartbeat_interval` as well.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// inactivity threshold after which a connection is declared dead
    pub timeout: Duration,
    /// interval between liveness probes on an established connection
    pub heartbeat_interval: Duration,
    /// client-side wait for a welcome, and server-side grace period for
    ///  rejected / unanswered pending connections
    pub connect_timeout: Duration,
    /// transport hint: upper bound for buffered inbound data awaiting `tick()`
    pub socket_buffer_size: usize,
    /// server only: upper bound for concurrently connected clients, and the
    ///  range of assignable client ids
    pub max_clients: u16,
    /// if false, per-message-id handlers are never consulted and only the
    ///  message-received event fires
    pub use_message_handlers: bool,
}

impl PeerConfig {
    pub fn new() -> PeerConfig {
        PeerConfig {
            timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(10000),
            socket_buffer_size: 1024 * 1024,
            max_clients: 16,
            use_message_handlers: true,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}
