use std::env;
use std::fmt::Debug;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Consul refuses blocking queries waiting longer than ten minutes
const MAX_WAIT_TIME_IN_SECS: u64 = 600;

/// Connection parameters of the Consul agent backing a store
#[derive(Serialize, Deserialize, Clone)]
pub struct ConsulConfig {
    /// Agent address as `host:port`, optionally prefixed with `http://` or `https://`
    /// Default: "127.0.0.1:8500"
    #[serde(default = "default_address")]
    pub address: String,

    /// URI scheme used when `address` carries none
    /// Default: "http"
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Datacenter to query, agent's own datacenter when unset
    #[serde(default)]
    pub datacenter: Option<String>,

    /// ACL token sent as `X-Consul-Token`
    #[serde(default)]
    pub token: Option<String>,

    /// Allow any server (not only the leader) to answer reads
    /// Default: false
    #[serde(default)]
    pub allow_stale: bool,

    /// TCP connect timeout in milliseconds
    /// Default: 1 second
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_in_ms: u64,

    /// Deadline for non-blocking requests in milliseconds
    /// Default: 10 seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,

    /// Maximum server-side wait of a blocking query in seconds
    /// Default: 5 minutes (the agent's own default)
    #[serde(default = "default_wait_time")]
    pub wait_time_in_secs: u64,
}

impl Debug for ConsulConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ConsulConfig")
            .field("address", &self.address)
            .field("scheme", &self.scheme)
            .field("datacenter", &self.datacenter)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("allow_stale", &self.allow_stale)
            .field("connect_timeout_in_ms", &self.connect_timeout_in_ms)
            .field("request_timeout_in_ms", &self.request_timeout_in_ms)
            .field("wait_time_in_secs", &self.wait_time_in_secs)
            .finish()
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            scheme: default_scheme(),
            datacenter: None,
            token: None,
            allow_stale: false,
            connect_timeout_in_ms: default_connect_timeout(),
            request_timeout_in_ms: default_request_timeout(),
            wait_time_in_secs: default_wait_time(),
        }
    }
}

impl ConsulConfig {
    /// Overlays the environment variables understood by every Consul client.
    pub fn apply_agent_env(&mut self) {
        if let Ok(addr) = env::var("CONSUL_HTTP_ADDR") {
            if !addr.is_empty() {
                self.set_address(&addr);
            }
        }

        if let Ok(token) = env::var("CONSUL_HTTP_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }

        if let Ok(ssl) = env::var("CONSUL_HTTP_SSL") {
            match ssl.parse::<bool>() {
                Ok(true) => self.scheme = "https".to_string(),
                Ok(false) => {}
                Err(e) => warn!("Could not parse CONSUL_HTTP_SSL={ssl:?}: {e}"),
            }
        }
    }

    /// Sets the agent address, picking up an embedded `http://`/`https://` scheme.
    pub fn set_address(
        &mut self,
        addr: &str,
    ) {
        match addr.split_once("://") {
            Some((scheme, rest)) => {
                self.scheme = scheme.to_ascii_lowercase();
                self.address = rest.trim_end_matches('/').to_string();
            }
            None => self.address = addr.trim_end_matches('/').to_string(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_in_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_in_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "consul.address cannot be empty".into(),
            )));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(Error::Config(ConfigError::Message(format!(
                "consul.scheme must be http or https, got {}",
                self.scheme
            ))));
        }

        if self.connect_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "consul.connect_timeout_in_ms must be > 0".into(),
            )));
        }

        if self.request_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "consul.request_timeout_in_ms must be > 0".into(),
            )));
        }

        if self.wait_time_in_secs > MAX_WAIT_TIME_IN_SECS {
            return Err(Error::Config(ConfigError::Message(format!(
                "consul.wait_time_in_secs {} exceeds maximum {}",
                self.wait_time_in_secs, MAX_WAIT_TIME_IN_SECS
            ))));
        }

        Ok(())
    }
}

fn default_address() -> String {
    "127.0.0.1:8500".to_string()
}
fn default_scheme() -> String {
    "http".to_string()
}
fn default_connect_timeout() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_wait_time() -> u64 {
    300
}
