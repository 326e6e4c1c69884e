//! Runtime configuration
//!
//! This module provides the tuning knobs shared by every flowlet instance of a process:
//! dequeue timeout, idle back-off, default retry budget and transaction timeout.

use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::shared::{ComponentError, Runtime};

/// Default time a single dequeue may block on the storage collaborator
const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// Default sleep when a full dispatch cycle found nothing to do
const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Default retry budget for process and tick methods
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Default transaction timeout (30s)
const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_DEQUEUE_TIMEOUT_MS: &str = "FLOWLET_DEQUEUE_TIMEOUT_MS";
pub const ENV_IDLE_BACKOFF_MS: &str = "FLOWLET_IDLE_BACKOFF_MS";
pub const ENV_DEFAULT_MAX_RETRIES: &str = "FLOWLET_DEFAULT_MAX_RETRIES";
pub const ENV_TX_TIMEOUT_SECS: &str = "FLOWLET_TX_TIMEOUT_SECS";

/// Common runtime configuration that all flowlet instances share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    dequeue_timeout: Duration,
    idle_backoff: Duration,
    default_max_retries: u32,
    tx_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            default_max_retries: DEFAULT_MAX_RETRIES,
            tx_timeout: DEFAULT_TX_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `FLOWLET_*` environment variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparsable values are configuration errors.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_DEQUEUE_TIMEOUT_MS)? {
            self.dequeue_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_IDLE_BACKOFF_MS)? {
            self.idle_backoff = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_override::<u32>(&lookup, ENV_DEFAULT_MAX_RETRIES)? {
            self.default_max_retries = retries;
        }
        if let Some(secs) = parse_override::<u64>(&lookup, ENV_TX_TIMEOUT_SECS)? {
            self.tx_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Set how long a single dequeue may block.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Get how long a single dequeue may block. Default value is 10ms.
    pub fn dequeue_timeout(&self) -> Duration {
        self.dequeue_timeout
    }

    /// Set the sleep used when a dispatch cycle found nothing to process.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Get the idle sleep between empty dispatch cycles. Default value is 50ms.
    pub fn idle_backoff(&self) -> Duration {
        self.idle_backoff
    }

    /// Set the retry budget used by methods that do not declare one.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Get the retry budget used by methods that do not declare one. Default value is 20.
    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Set the transaction timeout requested from the transaction system.
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Get the transaction timeout. Default value is 30s.
    pub fn tx_timeout(&self) -> Duration {
        self.tx_timeout
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    debug!(key, value = %raw, "Applying runtime config override");
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Runtime::config_error(format!("invalid value '{raw}' for {key}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_runtime_config() {
        let config = RuntimeConfig::new();

        assert_eq!(config.dequeue_timeout(), DEFAULT_DEQUEUE_TIMEOUT);
        assert_eq!(config.idle_backoff(), DEFAULT_IDLE_BACKOFF);
        assert_eq!(config.default_max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(config.tx_timeout(), DEFAULT_TX_TIMEOUT);

        let config = config
            .with_dequeue_timeout(Duration::from_millis(1))
            .with_idle_backoff(Duration::from_millis(2))
            .with_default_max_retries(3)
            .with_tx_timeout(Duration::from_secs(4));

        assert_eq!(config.dequeue_timeout(), Duration::from_millis(1));
        assert_eq!(config.idle_backoff(), Duration::from_millis(2));
        assert_eq!(config.default_max_retries(), 3);
        assert_eq!(config.tx_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_runtime_config_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DEQUEUE_TIMEOUT_MS, "5"),
            (ENV_DEFAULT_MAX_RETRIES, " 7 "),
        ]);
        let config = RuntimeConfig::new()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.dequeue_timeout(), Duration::from_millis(5));
        assert_eq!(config.default_max_retries(), 7);
        assert_eq!(config.idle_backoff(), DEFAULT_IDLE_BACKOFF);
    }

    #[test]
    fn test_runtime_config_bad_override() {
        let err = RuntimeConfig::new()
            .with_overrides(|key| (key == ENV_TX_TIMEOUT_SECS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains(ENV_TX_TIMEOUT_SECS));
    }
}
