//! Configuration management for the key-value backends.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Consul agent conventions (`CONSUL_HTTP_ADDR`, `CONSUL_HTTP_TOKEN`, `CONSUL_HTTP_SSL`)
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation
mod consul;
mod watch;
pub use consul::*;
pub use watch::*;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Prefix of the environment variables overriding configuration keys,
/// e.g. `CONFKV__CONSUL__ADDRESS=10.0.0.5:8500`
pub(crate) const ENV_PREFIX: &str = "CONFKV";

/// Main configuration container for the key-value backends
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Consul agent environment variables
/// 3. Configuration file specified by `CONFIG_PATH`
/// 4. Environment variables with `CONFKV__` prefix (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BackendConfig {
    /// Consul agent connection parameters
    #[serde(default)]
    pub consul: ConsulConfig,
    /// Watch stream behaviour
    #[serde(default)]
    pub watch: WatchConfig,
}

impl BackendConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. `CONSUL_HTTP_ADDR`, `CONSUL_HTTP_TOKEN` and `CONSUL_HTTP_SSL`
    /// 3. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 4. Environment variables with `CONFKV__` prefix (highest priority)
    ///
    /// # Note
    /// This method does NOT validate the configuration. Callers MUST call `validate()`
    /// before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFKV__CONSUL__ADDRESS", "10.0.0.5:8500");
    /// let cfg = BackendConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut defaults = Self::default();
        defaults.consul.apply_agent_env();

        let mut builder = Config::builder().add_source(Config::try_from(&defaults)?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    ///
    /// Must be called after all configuration overrides are applied.
    pub fn validate(self) -> Result<Self> {
        self.consul.validate()?;
        self.watch.validate()?;
        Ok(self)
    }
}
