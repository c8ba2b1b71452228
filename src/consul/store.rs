use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde_json::Map;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::api::ConsulClient;
use super::api::KvApi;
use super::api::KvEntry;
use super::api::QueryOptions;
use super::api::WriteOptions;
use super::poll::IndexPoller;
use super::poll::POLL_STRATEGY;
use super::watch::WatchPlan;
use super::watch::WatchResult;
use super::watch::PLAN_STRATEGY;
use super::ConsulStoreBuilder;
use crate::backend::normalize_key;
use crate::backend::watch_channel;
use crate::backend::WatchSender;
use crate::scoped_timer::ScopedTimer;
use crate::BackendConfig;
use crate::ConsulConfig;
use crate::Error;
use crate::KvPair;
use crate::KvPairs;
use crate::Result;
use crate::Store;
use crate::WatchConfig;
use crate::WatchStrategy;
use crate::WatchStream;
use crate::ACTIVE_WATCHES_METRIC;

/// [`Store`] backed by a Consul agent.
///
/// Cloning is cheap; clones share the underlying client, so a
/// [`refresh`](ConsulStore::refresh) is seen by all of them.
pub struct ConsulStore<A: KvApi = ConsulClient> {
    api: Arc<ArcSwap<A>>,
    consul: ConsulConfig,
    watch: WatchConfig,
}

impl<A: KvApi> Clone for ConsulStore<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            consul: self.consul.clone(),
            watch: self.watch.clone(),
        }
    }
}

impl ConsulStore {
    /// Connects to `machines[0]`, or to the configured address when no
    /// machine is given.
    pub fn new(
        machines: &[String],
        config: &BackendConfig,
    ) -> Result<Self> {
        let consul = consul_for(machines, &config.consul)?;
        let client = ConsulClient::new(&consul)?;
        info!(address = %client.base_url(), strategy = ?config.watch.strategy, "consul store created");
        Ok(Self::with_api(client, consul, config.watch.clone()))
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Self::new(&[], config)
    }

    /// Creates a configured store builder
    pub fn builder(machines: Vec<String>) -> ConsulStoreBuilder {
        ConsulStoreBuilder::new(machines)
    }

    /// Points the store at another agent.
    ///
    /// New calls use the new client; watches already running keep the client
    /// they were started with.
    pub fn refresh(
        &self,
        machines: &[String],
    ) -> Result<()> {
        let consul = consul_for(machines, &self.consul)?;
        let client = ConsulClient::new(&consul)?;
        info!(address = %client.base_url(), "consul store refreshed");
        self.set_client(client);
        Ok(())
    }
}

impl<A: KvApi> ConsulStore<A> {
    /// Wraps an existing [`KvApi`] implementation
    pub fn with_api(
        api: A,
        consul: ConsulConfig,
        watch: WatchConfig,
    ) -> Self {
        Self {
            api: Arc::new(ArcSwap::from_pointee(api)),
            consul,
            watch,
        }
    }

    /// Client currently used for new calls
    pub fn client(&self) -> Arc<A> {
        self.api.load_full()
    }

    /// Replaces the client used for new calls
    pub fn set_client(
        &self,
        api: A,
    ) {
        self.api.store(Arc::new(api));
    }

    pub fn consul_config(&self) -> &ConsulConfig {
        &self.consul
    }

    pub fn watch_config(&self) -> &WatchConfig {
        &self.watch
    }

    fn query_options(&self) -> QueryOptions {
        QueryOptions {
            datacenter: self.consul.datacenter.clone(),
            token: self.consul.token.clone(),
            allow_stale: self.consul.allow_stale,
            ..QueryOptions::default()
        }
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            datacenter: self.consul.datacenter.clone(),
            token: self.consul.token.clone(),
        }
    }

    /// Parameters of the `key` watch plan of `key`
    fn plan_params(
        &self,
        key: &str,
    ) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("type".to_string(), Value::from("key"));
        params.insert("key".to_string(), Value::from(key));
        if let Some(dc) = &self.consul.datacenter {
            params.insert("datacenter".to_string(), Value::from(dc.as_str()));
        }
        if let Some(token) = &self.consul.token {
            params.insert("token".to_string(), Value::from(token.as_str()));
        }
        if self.consul.allow_stale {
            params.insert("stale".to_string(), Value::Bool(true));
        }
        params
    }

    fn spawn_plan(
        &self,
        key: &str,
        stop: CancellationToken,
        sender: WatchSender,
    ) {
        let api = self.client();
        let key = key.to_string();
        let params = self.plan_params(&key);
        let watch = self.watch.clone();
        let wait_time = self.consul.wait_time();

        tokio::spawn(async move {
            let plan = match WatchPlan::parse(&params) {
                Ok(plan) => plan.with_backoff(watch.retry_interval(), watch.max_backoff()),
                Err(e) => {
                    error!(target: "consul_watch", error = %e, "invalid watch plan");
                    sender.send(Err(e.into())).await;
                    return;
                }
            };
            let plan = if wait_time.is_zero() {
                plan
            } else {
                plan.with_wait_time(wait_time)
            };

            let gauge = ACTIVE_WATCHES_METRIC.with_label_values(&[PLAN_STRATEGY]);
            gauge.inc();
            let handler = |_index: u64, result: WatchResult| {
                let sender = sender.clone();
                async move {
                    match result {
                        WatchResult::Key(Some(entry)) => {
                            sender.send(Ok(Some(entry.value.unwrap_or_default()))).await
                        }
                        WatchResult::Key(None) => sender.send(Ok(None)).await,
                        WatchResult::KeyPrefix(_) => true,
                    }
                }
            };
            tokio::select! {
                _ = plan.run(api.as_ref(), &stop, handler) => {}
                _ = sender.closed() => {}
            }
            gauge.dec();
            debug!(target: "consul_watch", key = %key, "watch task finished");
        });
    }

    fn spawn_poller(
        &self,
        key: &str,
        sender: WatchSender,
    ) {
        let api = self.client();
        let query = QueryOptions {
            wait_time: Some(self.consul.wait_time()).filter(|w| !w.is_zero()),
            ..self.query_options()
        };
        let poller = IndexPoller::new(key, query, self.watch.poll_error_delay());

        tokio::spawn(async move {
            let gauge = ACTIVE_WATCHES_METRIC.with_label_values(&[POLL_STRATEGY]);
            gauge.inc();
            poller.run(api.as_ref(), &sender).await;
            gauge.dec();
        });
    }
}

#[async_trait::async_trait]
impl<A: KvApi> Store for ConsulStore<A> {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Bytes> {
        let _timer = ScopedTimer::new("consul_get");
        let (entry, _) = self.client().get(key, &self.query_options()).await?;
        match entry {
            Some(entry) => Ok(entry.value.unwrap_or_default()),
            None => Err(Error::not_found(key)),
        }
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<KvPairs> {
        let _timer = ScopedTimer::new("consul_list");
        let (entries, _) = self.client().list(prefix, &self.query_options()).await?;
        Ok(entries
            .into_iter()
            .map(|e| KvPair::new(e.key, e.value.unwrap_or_default()))
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let _timer = ScopedTimer::new("consul_set");
        let entry = KvEntry::new(normalize_key(key), Bytes::copy_from_slice(value));
        self.client().put(&entry, &self.write_options()).await?;
        Ok(())
    }

    fn watch(
        &self,
        key: &str,
        stop: CancellationToken,
    ) -> WatchStream {
        let (sender, stream) = watch_channel(self.watch.buffer_size, stop.clone());
        debug!(target: "consul_watch", key, strategy = ?self.watch.strategy, "starting watch");
        match self.watch.strategy {
            WatchStrategy::Plan => self.spawn_plan(key, stop, sender),
            WatchStrategy::Poll => self.spawn_poller(key, sender),
        }
        stream
    }
}

/// Agent settings with `machines[0]` as address, checked again since the
/// address may bring its own scheme.
fn consul_for(
    machines: &[String],
    base: &ConsulConfig,
) -> Result<ConsulConfig> {
    let mut consul = base.clone();
    let address = machines.first().unwrap_or(&base.address).clone();
    consul.set_address(&address);
    consul.validate()?;
    Ok(consul)
}
