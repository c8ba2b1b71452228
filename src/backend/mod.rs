//! Store trait - uniform interface over key-value backends.
//!
//! The configuration tool reads, writes and watches values exclusively through
//! [`Store`]. Implementations:
//!
//! - [`crate::ConsulStore`]: remote access to a Consul agent's KV API
//! - [`MemoryStore`]: in-process map, for tests and local runs
//!
//! # Example
//!
//! ```rust,ignore
//! async fn print_updates<S: Store>(store: &S) -> Result<()> {
//!     store.set("app/timeout", b"30s").await?;
//!
//!     let stop = CancellationToken::new();
//!     let mut updates = store.watch("app/timeout", stop.clone());
//!     while let Some(update) = updates.next().await {
//!         println!("{:?}", update?);
//!     }
//!     Ok(())
//! }
//! ```

mod memory;
pub use memory::*;

#[cfg(test)]
mod memory_test;

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A single key/value pair as seen by the configuration tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Bytes,
}

impl KvPair {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Pairs in the order the backend returned them
pub type KvPairs = Vec<KvPair>;

/// One watch notification: the new value, `None` once the key is gone, or
/// the error the backend reported.
pub type WatchResponse = Result<Option<Bytes>>;

/// Key-value backend used by the configuration tool.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`, safe for concurrent access.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Retrieves the value stored under `key`.
    ///
    /// # Errors
    /// - [`crate::Error::KeyNotFound`] if the key does not exist
    /// - [`crate::Error::Consul`] when the remote call fails
    async fn get(
        &self,
        key: &str,
    ) -> Result<Bytes>;

    /// Returns every pair whose key starts with `prefix`.
    ///
    /// A prefix without any key yields an empty list.
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<KvPairs>;

    /// Stores `value` under `key`. A leading `/` is stripped from the key.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()>;

    /// Streams changes of `key` until `stop` is cancelled or the stream is dropped.
    ///
    /// Spawns exactly one background task on the current tokio runtime.
    fn watch(
        &self,
        key: &str,
        stop: CancellationToken,
    ) -> WatchStream;
}

/// Stream of [`WatchResponse`] fed by a watch task.
///
/// Ends once the task exits, which happens when the stop token is cancelled.
pub struct WatchStream {
    inner: ReceiverStream<WatchResponse>,
}

impl WatchStream {
    /// Receives the next notification, `None` once the watch has ended
    pub async fn recv(&mut self) -> Option<WatchResponse> {
        self.inner.as_mut().recv().await
    }
}

impl Stream for WatchStream {
    type Item = WatchResponse;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Producer half of a watch: a bounded sender tied to the stop token.
#[derive(Clone)]
pub(crate) struct WatchSender {
    tx: mpsc::Sender<WatchResponse>,
    stop: CancellationToken,
}

impl WatchSender {
    /// Delivers one notification.
    ///
    /// Returns false once the consumer dropped the stream or the watch was stopped.
    pub(crate) async fn send(
        &self,
        item: WatchResponse,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            res = self.tx.send(item) => res.is_ok(),
        }
    }

    /// Resolves when the watch should end.
    pub(crate) async fn closed(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Creates the channel between a watch task and its consumer
pub(crate) fn watch_channel(
    buffer_size: usize,
    stop: CancellationToken,
) -> (WatchSender, WatchStream) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (
        WatchSender { tx, stop },
        WatchStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// Keys are stored without a leading slash
pub(crate) fn normalize_key(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}
