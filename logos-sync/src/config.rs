//! Session and relay configuration.

use std::time::Duration;

/// Per-client session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Cursor coalescing window (default: 16ms, one frame at 60Hz)
    pub cursor_interval: Duration,
    /// Default page size for operation history (default: 100)
    pub history_limit: usize,
    /// Ask the channel to echo our own broadcasts (default: false)
    pub receive_own: bool,
    /// Participant cap for rooms created without an explicit one (default: 50)
    pub default_max_participants: u32,
    /// Longest accepted comment body in bytes (default: 10_000)
    pub max_comment_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(16),
            history_limit: 100,
            receive_own: false,
            default_max_participants: 50,
            max_comment_len: 10_000,
        }
    }
}

/// WebSocket relay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast buffer per room before lagging connections drop frames
    pub broadcast_capacity: usize,
    /// Outgoing frame buffer per connection
    pub event_buffer: usize,
    /// How long a new connection may take to send its Subscribe frame
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            broadcast_capacity: 256,
            event_buffer: 256,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `LOGOS_RELAY_ADDR` and `LOGOS_RELAY_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("LOGOS_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("LOGOS_RELAY_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
                _ => log::warn!("Ignoring invalid LOGOS_RELAY_CAPACITY={raw}"),
            }
        }
        config
    }

    /// Ephemeral port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            event_buffer: 64,
            handshake_timeout: Duration::from_secs(2),
        }
    }
}
