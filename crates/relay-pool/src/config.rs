//! Pool configuration

use crate::admission::{InstantOverflow, SubscriptionLimits};
use crate::error::{ClientError, Result};
use std::time::Duration;

/// Environment variable holding a comma separated relay list
pub const ENV_RELAYS: &str = "RELAY_POOL_RELAYS";
/// Environment variable overriding `max_sub`
pub const ENV_MAX_SUB: &str = "RELAY_POOL_MAX_SUB";
/// Environment variable overriding `max_keep_alive`
pub const ENV_MAX_KEEP_ALIVE: &str = "RELAY_POOL_MAX_KEEP_ALIVE";
/// Environment variable overriding the reconnect delay, in milliseconds
pub const ENV_RECONNECT_DELAY_MS: &str = "RELAY_POOL_RECONNECT_DELAY_MS";
/// Environment variable overriding the connect timeout, in milliseconds
pub const ENV_CONNECT_TIMEOUT_MS: &str = "RELAY_POOL_CONNECT_TIMEOUT_MS";
/// Environment variable overriding the instant inactivity timeout, in milliseconds
pub const ENV_INACTIVITY_TIMEOUT_MS: &str = "RELAY_POOL_INACTIVITY_TIMEOUT_MS";

/// Relay pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relays connected at startup
    pub relays: Vec<String>,
    /// Maximum concurrent live subscriptions per connection
    pub max_sub: usize,
    /// Share of `max_sub` reserved for keep-alive subscriptions
    pub max_keep_alive: usize,
    /// What happens to an instant request when the instant pool is full
    pub instant_overflow: InstantOverflow,
    /// Fixed delay before a closed connection is reopened
    pub reconnect_delay: Duration,
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Inactivity timeout for instant subscriptions
    pub inactivity_timeout: Duration,
    /// Inactivity timeout for keep-alive subscriptions (none = never)
    pub keep_alive_inactivity_timeout: Option<Duration>,
    /// Per-stream buffer; events beyond it are dropped
    pub stream_buffer: usize,
    /// How long a publish handle waits for OK frames
    pub publish_timeout: Duration,
    /// Period of the stats log line (none = disabled)
    pub monitor_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_sub: 10,
            max_keep_alive: 2,
            instant_overflow: InstantOverflow::default(),
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(2),
            keep_alive_inactivity_timeout: None,
            stream_buffer: 1024,
            publish_timeout: Duration::from_secs(5),
            monitor_interval: None,
        }
    }
}

impl PoolConfig {
    /// Create a config with default limits for the given relays.
    pub fn new(relays: Vec<String>) -> Self {
        Self {
            relays,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `RELAY_POOL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values read through `lookup` on top of this config.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(relays) = lookup(ENV_RELAYS) {
            self.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup(ENV_MAX_SUB) {
            self.max_sub = parse_number(ENV_MAX_SUB, &v)? as usize;
        }
        if let Some(v) = lookup(ENV_MAX_KEEP_ALIVE) {
            self.max_keep_alive = parse_number(ENV_MAX_KEEP_ALIVE, &v)? as usize;
        }
        if let Some(v) = lookup(ENV_RECONNECT_DELAY_MS) {
            self.reconnect_delay = Duration::from_millis(parse_number(ENV_RECONNECT_DELAY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            self.connect_timeout = Duration::from_millis(parse_number(ENV_CONNECT_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_INACTIVITY_TIMEOUT_MS) {
            self.inactivity_timeout =
                Duration::from_millis(parse_number(ENV_INACTIVITY_TIMEOUT_MS, &v)?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the relay list.
    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    /// Set the per-connection subscription limits.
    pub fn limits(mut self, max_sub: usize, max_keep_alive: usize) -> Self {
        self.max_sub = max_sub;
        self.max_keep_alive = max_keep_alive;
        self
    }

    /// Set the instant overflow policy.
    pub fn instant_overflow(mut self, policy: InstantOverflow) -> Self {
        self.instant_overflow = policy;
        self
    }

    /// Set the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the instant subscription inactivity timeout.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the keep-alive subscription inactivity timeout.
    pub fn keep_alive_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_inactivity_timeout = timeout;
        self
    }

    /// Set the per-stream buffer size.
    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }

    /// Set the publish wait.
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Enable the periodic stats log.
    pub fn monitor_interval(mut self, interval: Option<Duration>) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Reject configurations the admission controller cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_sub <= self.max_keep_alive {
            return Err(ClientError::InvalidConfig(format!(
                "max_sub ({}) must be greater than max_keep_alive ({})",
                self.max_sub, self.max_keep_alive
            )));
        }
        if self.stream_buffer == 0 {
            return Err(ClientError::InvalidConfig(
                "stream_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Admission limits derived from this config.
    pub fn subscription_limits(&self) -> SubscriptionLimits {
        SubscriptionLimits {
            max_sub: self.max_sub,
            max_keep_alive: self.max_keep_alive,
            overflow: self.instant_overflow,
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ClientError::InvalidConfig(format!("{key}={value}: {e}")))
}
