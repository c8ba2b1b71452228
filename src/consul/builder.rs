use std::time::Duration;

use super::ConsulStore;
use crate::BackendConfig;
use crate::Result;
use crate::WatchStrategy;

pub struct ConsulStoreBuilder {
    config: BackendConfig,
    machines: Vec<String>,
}

impl ConsulStoreBuilder {
    /// Create a new builder with default config and the given agent addresses
    pub fn new(machines: Vec<String>) -> Self {
        Self {
            config: BackendConfig::default(),
            machines,
        }
    }

    /// Set the datacenter queried (default: the agent's own)
    pub fn datacenter(
        mut self,
        datacenter: impl Into<String>,
    ) -> Self {
        self.config.consul.datacenter = Some(datacenter.into());
        self
    }

    /// Set the ACL token sent with every request
    pub fn token(
        mut self,
        token: impl Into<String>,
    ) -> Self {
        self.config.consul.token = Some(token.into());
        self
    }

    /// Allow reads from any server, not only the leader (default: disabled)
    pub fn allow_stale(
        mut self,
        allow: bool,
    ) -> Self {
        self.config.consul.allow_stale = allow;
        self
    }

    /// Set the server-side wait of blocking queries (default: 5m)
    ///
    /// Rounded down to whole seconds.
    pub fn wait_time(
        mut self,
        wait: Duration,
    ) -> Self {
        self.config.consul.wait_time_in_secs = wait.as_secs();
        self
    }

    /// Select how watches are driven (default: plan)
    pub fn watch_strategy(
        mut self,
        strategy: WatchStrategy,
    ) -> Self {
        self.config.watch.strategy = strategy;
        self
    }

    /// Completely replaces the default configuration
    ///
    /// # Warning: Configuration Override
    /// This will discard all previous settings configured through individual
    /// methods like [`token`](ConsulStoreBuilder::token) or
    /// [`watch_strategy`](ConsulStoreBuilder::watch_strategy).
    ///
    /// # Example: Full Configuration
    /// ```ignore
    /// let config = BackendConfig::new()?.validate()?;
    /// let store = ConsulStoreBuilder::new(vec!["10.0.0.5:8500".into()])
    ///     .set_config(config)
    ///     .build()?;
    /// ```
    pub fn set_config(
        mut self,
        config: BackendConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the store
    pub fn build(self) -> Result<ConsulStore> {
        let config = self.config.validate()?;
        ConsulStore::new(&self.machines, &config)
    }
}
