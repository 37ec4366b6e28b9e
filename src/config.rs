use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Settings for one room session: where the relay lives, which ICE servers the
/// media engine should use, and how patient the recovery machinery is.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    pub reconnect: ReconnectPolicy,
    /// A link that has not reached `Connected` within this window is torn down
    /// and, if the peer is still present, re-initiated.
    pub negotiation_timeout: Duration,
}

/// Exponential backoff bounds for relay reconnection. The delay starts at
/// `initial_delay`, doubles per failed attempt, and never exceeds `max_delay`.
/// Attempts are unbounded; only an explicit shutdown stops the retry loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
            reconnect: ReconnectPolicy::default(),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}
