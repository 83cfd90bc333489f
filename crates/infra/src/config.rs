//! Runtime configuration.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables for the message bus, relay and aggregate repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bounded queue length of each pump subscription.
    pub pump_capacity: usize,
    /// How often the outbox relay polls when not woken by a commit.
    pub relay_poll_interval: Duration,
    /// Maximum outbox records moved per relay pass.
    pub relay_batch_size: usize,
    /// How long a relayed record stays leased before another relay may take
    /// it again if it was never acknowledged.
    pub outbox_lease: Duration,
    /// Snapshot every N versions (`None` disables automatic snapshots).
    pub snapshot_interval: Option<u64>,
    /// Reload-and-retry attempts for `ExpectedVersion::Any` commands on conflict.
    pub conflict_retries: u32,
    /// Reject `send` for commands without exactly one handler.
    pub validate_routes_on_send: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pump_capacity: 1024,
            relay_poll_interval: Duration::from_millis(50),
            relay_batch_size: 256,
            outbox_lease: Duration::from_secs(300),
            snapshot_interval: None,
            conflict_retries: 3,
            validate_routes_on_send: true,
        }
    }
}

impl RuntimeConfig {
    pub const PUMP_CAPACITY: &'static str = "EVENTIDE_PUMP_CAPACITY";
    pub const RELAY_POLL_MS: &'static str = "EVENTIDE_RELAY_POLL_MS";
    pub const RELAY_BATCH: &'static str = "EVENTIDE_RELAY_BATCH";
    pub const OUTBOX_LEASE_SECS: &'static str = "EVENTIDE_OUTBOX_LEASE_SECS";
    pub const SNAPSHOT_INTERVAL: &'static str = "EVENTIDE_SNAPSHOT_INTERVAL";
    pub const CONFLICT_RETRIES: &'static str = "EVENTIDE_CONFLICT_RETRIES";
    pub const VALIDATE_ROUTES: &'static str = "EVENTIDE_VALIDATE_ROUTES";

    /// Defaults overridden by any `EVENTIDE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(Self::PUMP_CAPACITY) {
            config.pump_capacity = parse_positive(Self::PUMP_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(Self::RELAY_POLL_MS) {
            config.relay_poll_interval = Duration::from_millis(parse_positive(Self::RELAY_POLL_MS, &v)? as u64);
        }
        if let Some(v) = lookup(Self::RELAY_BATCH) {
            config.relay_batch_size = parse_positive(Self::RELAY_BATCH, &v)?;
        }
        if let Some(v) = lookup(Self::OUTBOX_LEASE_SECS) {
            config.outbox_lease = Duration::from_secs(parse_positive(Self::OUTBOX_LEASE_SECS, &v)? as u64);
        }
        if let Some(v) = lookup(Self::SNAPSHOT_INTERVAL) {
            let interval = parse_number::<u64>(Self::SNAPSHOT_INTERVAL, &v)?;
            config.snapshot_interval = (interval > 0).then_some(interval);
        }
        if let Some(v) = lookup(Self::CONFLICT_RETRIES) {
            config.conflict_retries = parse_number(Self::CONFLICT_RETRIES, &v)?;
        }
        if let Some(v) = lookup(Self::VALIDATE_ROUTES) {
            config.validate_routes_on_send = parse_bool(Self::VALIDATE_ROUTES, &v)?;
        }

        Ok(config)
    }

    pub fn with_pump_capacity(mut self, capacity: usize) -> Self {
        self.pump_capacity = capacity.max(1);
        self
    }

    pub fn with_relay_poll_interval(mut self, interval: Duration) -> Self {
        self.relay_poll_interval = interval;
        self
    }

    pub fn with_relay_batch_size(mut self, size: usize) -> Self {
        self.relay_batch_size = size.max(1);
        self
    }

    pub fn with_outbox_lease(mut self, lease: Duration) -> Self {
        self.outbox_lease = lease;
        self
    }

    pub fn with_snapshot_interval(mut self, every: u64) -> Self {
        self.snapshot_interval = (every > 0).then_some(every);
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_route_validation(mut self, enabled: bool) -> Self {
        self.validate_routes_on_send = enabled;
        self
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match parse_number::<usize>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
