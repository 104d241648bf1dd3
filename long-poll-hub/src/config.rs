use std::time::Duration;

use clap::ValueEnum;

use crate::error::ConfigError;

pub const DEFAULT_EVENT_CAPACITY: usize = 128;
pub const DEFAULT_CLIENT_CAPACITY: usize = 32;
pub const DEFAULT_MAX_BATCH: usize = 10;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Largest accepted shared event queue.
pub const MAX_EVENT_CAPACITY: usize = 1 << 20;
/// Largest accepted per-client delivery queue.
pub const MAX_CLIENT_CAPACITY: usize = 1 << 16;

/// What a delivery queue does with a message that arrives while it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Discard the incoming message for that client only.
    #[default]
    DropNewest,
    /// Evict the oldest buffered message to make room.
    DropOldest,
    /// Make the broadcaster wait for the consumer. One stalled client stalls
    /// every other client too.
    Block,
}

/// Tunables for a hub instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of the shared event queue feeding the broadcaster.
    pub event_capacity: usize,
    /// Capacity of each client's delivery queue.
    pub client_capacity: usize,
    /// Most messages a single Poll hands back.
    pub max_batch: usize,
    /// Wait used when a Poll asks for a non-positive timeout.
    pub default_poll_timeout: Duration,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            client_capacity: DEFAULT_CLIENT_CAPACITY,
            max_batch: DEFAULT_MAX_BATCH,
            default_poll_timeout: DEFAULT_POLL_TIMEOUT,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks = [
            ("event_capacity", self.event_capacity == 0),
            ("client_capacity", self.client_capacity == 0),
            ("max_batch", self.max_batch == 0),
            ("default_poll_timeout", self.default_poll_timeout.is_zero()),
        ];
        if let Some((field, _)) = zero_checks.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero { field });
        }

        let limits = [
            ("event_capacity", self.event_capacity, MAX_EVENT_CAPACITY),
            ("client_capacity", self.client_capacity, MAX_CLIENT_CAPACITY),
        ];
        match limits.into_iter().find(|(_, value, max)| value > max) {
            Some((field, _, max)) => Err(ConfigError::TooLarge { field, max }),
            None => Ok(()),
        }
    }

    /// Resolves a caller-supplied timeout, falling back to the default when it
    /// is zero or negative.
    pub fn poll_timeout(&self, timeout_ms: i64) -> Duration {
        match u64::try_from(timeout_ms) {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.default_poll_timeout,
        }
    }
}
