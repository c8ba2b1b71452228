use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// How a Consul store turns blocking queries into a watch stream
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchStrategy {
    /// Watch plan: squared backoff on errors, only changed results are emitted,
    /// a deleted key is reported as an empty value
    #[default]
    Plan,
    /// Wait-index polling: a missing key is reported as an error and every
    /// error is followed by a fixed delay
    Poll,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Default: plan
    #[serde(default)]
    pub strategy: WatchStrategy,

    /// Capacity of the channel between the watch task and the stream consumer
    /// Default: 1
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Base retry delay of a failing watch plan (unit: milliseconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_in_ms: u64,

    /// Upper bound of the watch plan retry delay (unit: milliseconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_in_ms: u64,

    /// Pause after the poller reported an error (unit: milliseconds)
    #[serde(default = "default_poll_error_delay")]
    pub poll_error_delay_in_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            strategy: WatchStrategy::default(),
            buffer_size: default_buffer_size(),
            retry_interval_in_ms: default_retry_interval(),
            max_backoff_in_ms: default_max_backoff(),
            poll_error_delay_in_ms: default_poll_error_delay(),
        }
    }
}

impl WatchConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_in_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_in_ms)
    }

    pub fn poll_error_delay(&self) -> Duration {
        Duration::from_millis(self.poll_error_delay_in_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.buffer_size must be > 0".into(),
            )));
        }

        if self.retry_interval_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.retry_interval_in_ms must be > 0".into(),
            )));
        }

        if self.max_backoff_in_ms < self.retry_interval_in_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch.max_backoff_in_ms {}ms must be >= retry_interval_in_ms {}ms",
                self.max_backoff_in_ms, self.retry_interval_in_ms
            ))));
        }

        Ok(())
    }
}

fn default_buffer_size() -> usize {
    1
}
fn default_retry_interval() -> u64 {
    5_000
}
fn default_max_backoff() -> u64 {
    20_000
}
fn default_poll_error_delay() -> u64 {
    5_000
}
