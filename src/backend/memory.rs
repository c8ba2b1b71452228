use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::normalize_key;
use super::watch_channel;
use super::KvPair;
use super::KvPairs;
use super::Store;
use super::WatchStream;
use crate::Error;
use crate::Result;

/// In-process [`Store`] keeping pairs in key order.
///
/// Watchers share one `tokio::sync::watch` channel per key, so a slow
/// consumer only ever sees the latest value.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: RwLock<BTreeMap<String, Bytes>>,
    watchers: DashMap<String, watch::Sender<Option<Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `pairs`
    pub fn with_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let store = Self::new();
        {
            let mut data = store.inner.data.write();
            for (k, v) in pairs {
                data.insert(
                    normalize_key(k.as_ref()).to_string(),
                    Bytes::copy_from_slice(v.as_ref()),
                );
            }
        }
        store
    }

    /// Removes `key`; watchers observe `None`. Returns whether the key existed.
    pub fn delete(
        &self,
        key: &str,
    ) -> bool {
        let key = normalize_key(key);
        let existed = {
            let mut data = self.inner.data.write();
            let existed = data.remove(key).is_some();
            self.notify(key, None);
            existed
        };
        debug!(key, existed, "memory store delete");
        existed
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.read().is_empty()
    }

    /// Must be called with the data lock held so notifications keep write order
    fn notify(
        &self,
        key: &str,
        value: Option<Bytes>,
    ) {
        if let Some(tx) = self.inner.watchers.get(key) {
            tx.send_if_modified(|current| {
                if *current == value {
                    false
                } else {
                    *current = value;
                    true
                }
            });
        }
    }

    /// Number of keys with at least one live watch
    pub fn watched_keys(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Drops the channel of `key` once its last receiver is gone.
    /// `subscribe` holds the same shard lock, so a new watcher is never lost.
    fn release(
        &self,
        key: &str,
    ) {
        let removed = self
            .inner
            .watchers
            .remove_if(key, |_, tx| tx.receiver_count() == 0)
            .is_some();
        if removed {
            trace!(key, "memory watch channel released");
        }
    }

    fn subscribe(
        &self,
        key: &str,
    ) -> watch::Receiver<Option<Bytes>> {
        let data = self.inner.data.read();
        self.inner
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(data.get(key).cloned()).0)
            .subscribe()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Bytes> {
        let key = normalize_key(key);
        self.inner.data.read().get(key).cloned().ok_or_else(|| Error::not_found(key))
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<KvPairs> {
        let prefix = normalize_key(prefix);
        let data = self.inner.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let key = normalize_key(key);
        let value = Bytes::copy_from_slice(value);
        let mut data = self.inner.data.write();
        data.insert(key.to_string(), value.clone());
        self.notify(key, Some(value));
        trace!(key, "memory store set");
        Ok(())
    }

    fn watch(
        &self,
        key: &str,
        stop: CancellationToken,
    ) -> WatchStream {
        let key = normalize_key(key).to_string();
        let (sender, stream) = watch_channel(1, stop);
        let mut rx = self.subscribe(&key);
        let store = self.clone();

        tokio::spawn(async move {
            let current = rx.borrow_and_update().clone();
            if sender.send(Ok(current)).await {
                loop {
                    tokio::select! {
                        _ = sender.closed() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let value = rx.borrow_and_update().clone();
                            if !sender.send(Ok(value)).await {
                                break;
                            }
                        }
                    }
                }
            }
            drop(rx);
            store.release(&key);
            debug!(key = %key, "memory watch stopped");
        });

        stream
    }
}
